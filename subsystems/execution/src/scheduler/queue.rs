//! # Queue
//!
//! FIFO container with O(1) enqueue and dequeue, removal of an arbitrary
//! item, and iteration that tolerates the visitor deleting the item it was
//! handed.
//!
//! Nodes live in a slab and are linked by index. Vacated nodes are chained
//! on an intrusive free list and recycled by later enqueues, so once a
//! queue has grown to its working size neither enqueue nor dequeue touches
//! the allocator. The scheduler depends on that: it moves threads through
//! its ready queue from the tick handler.

use crate::{ExecError, ExecResult};

#[derive(Debug)]
struct Node<T> {
    item: Option<T>,
    prev: Option<usize>,
    /// Successor while linked, next free node while vacant
    next: Option<usize>,
}

/// FIFO queue
#[derive(Debug)]
pub struct Queue<T> {
    nodes: Vec<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Option<usize>,
    free_len: usize,
    len: usize,
}

impl<T> Queue<T> {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: None,
            tail: None,
            free: None,
            free_len: 0,
            len: 0,
        }
    }

    /// Create an empty queue with room for `capacity` items
    pub fn with_capacity(capacity: usize) -> ExecResult<Self> {
        let mut queue = Self::new();
        queue.reserve(capacity)?;
        Ok(queue)
    }

    /// Ensure `additional` more items can be enqueued without allocating
    pub fn reserve(&mut self, additional: usize) -> ExecResult<()> {
        let recycled = self.free_len;
        let spare = self.nodes.capacity() - self.nodes.len();
        let needed = additional.saturating_sub(recycled);
        if needed > spare {
            self.nodes
                .try_reserve(needed)
                .map_err(|_| ExecError::OutOfMemory)?;
        }
        Ok(())
    }

    /// Release the queue.
    ///
    /// A queue that still holds items is handed back untouched together
    /// with [`ExecError::NotEmpty`].
    pub fn destroy(self) -> Result<(), (Self, ExecError)> {
        if self.len != 0 {
            return Err((self, ExecError::NotEmpty));
        }
        Ok(())
    }

    /// Append an item at the tail
    pub fn enqueue(&mut self, item: T) -> ExecResult<()> {
        let index = match self.free {
            Some(index) => {
                self.free = self.nodes[index].next;
                self.free_len -= 1;
                index
            }
            None => {
                self.nodes
                    .try_reserve(1)
                    .map_err(|_| ExecError::OutOfMemory)?;
                self.nodes.push(Node {
                    item: None,
                    prev: None,
                    next: None,
                });
                self.nodes.len() - 1
            }
        };

        let node = &mut self.nodes[index];
        node.item = Some(item);
        node.prev = self.tail;
        node.next = None;

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the oldest item
    pub fn dequeue(&mut self) -> ExecResult<T> {
        let head = self.head.ok_or(ExecError::Empty)?;
        Ok(self.unlink(head))
    }

    /// Oldest item without removing it
    pub fn peek(&self) -> Option<&T> {
        self.head.and_then(|head| self.nodes[head].item.as_ref())
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate from head to tail
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, index: usize) -> T {
        let (prev, next) = {
            let node = &self.nodes[index];
            (node.prev, node.next)
        };

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        let free = self.free;
        let node = &mut self.nodes[index];
        let item = node.item.take();
        node.prev = None;
        node.next = free;
        self.free = Some(index);
        self.free_len += 1;
        self.len -= 1;

        match item {
            Some(item) => item,
            // Linked nodes always carry an item.
            None => unreachable!("linked queue node {index} is vacant"),
        }
    }
}

impl<T: PartialEq> Queue<T> {
    /// Remove the first occurrence of `item`
    pub fn delete(&mut self, item: &T) -> ExecResult<()> {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            if node.item.as_ref() == Some(item) {
                self.unlink(index);
                return Ok(());
            }
            cursor = node.next;
        }
        Err(ExecError::NotFound)
    }

    /// Check whether `item` is queued
    pub fn contains(&self, item: &T) -> bool {
        self.iter().any(|queued| queued == item)
    }
}

impl<T: Clone> Queue<T> {
    /// Visit every item from head to tail.
    ///
    /// The visitor gets the queue itself and may delete the item it was
    /// handed. The successor is captured before each call; if the visitor
    /// removes that successor too, iteration stops there.
    pub fn iterate<F>(&mut self, mut visitor: F)
    where
        F: FnMut(&mut Self, &T),
    {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let Some(item) = self.nodes[index].item.clone() else {
                break;
            };
            cursor = self.nodes[index].next;
            visitor(self, &item);
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowing iterator over a [`Queue`]
#[derive(Debug)]
pub struct Iter<'a, T> {
    queue: &'a Queue<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let index = self.cursor?;
        let node = &self.queue.nodes[index];
        self.cursor = node.next;
        node.item.as_ref()
    }
}

impl<'a, T> IntoIterator for &'a Queue<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
