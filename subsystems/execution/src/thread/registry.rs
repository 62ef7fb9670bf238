//! # Thread Table
//!
//! Arena of thread control blocks owned by one runtime.
//!
//! Slots are reused after a thread is reaped; every reuse bumps the slot
//! generation so that stale [`ThreadId`]s resolve to nothing.

use super::Thread;
use crate::{ExecError, ExecResult, ThreadId};
use uthread_hal::ContextBackend;

struct Slot<B: ContextBackend + 'static> {
    generation: u32,
    thread: Option<Box<Thread<B>>>,
}

/// Thread table
pub(crate) struct ThreadTable<B: ContextBackend + 'static> {
    slots: Vec<Slot<B>>,
    free: Vec<u32>,
    live: usize,
}

impl<B: ContextBackend + 'static> ThreadTable<B> {
    /// Create an empty table
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Make sure the next `insert` will not need to grow the table
    pub(crate) fn reserve(&mut self) -> ExecResult<()> {
        if self.free.is_empty() {
            self.slots
                .try_reserve(1)
                .map_err(|_| ExecError::OutOfMemory)?;
            // The slot pushed by insert goes back on the free list when reaped.
            self.free
                .try_reserve(self.slots.len() + 1)
                .map_err(|_| ExecError::OutOfMemory)?;
        }
        Ok(())
    }

    /// Identifier the next inserted thread will receive
    pub(crate) fn next_id(&self) -> ExecResult<ThreadId> {
        match self.free.last() {
            Some(&index) => Ok(ThreadId::new(index, self.slots[index as usize].generation)),
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| ExecError::OutOfMemory)?;
                Ok(ThreadId::new(index, 0))
            }
        }
    }

    /// Store a thread built for the identifier returned by `next_id`
    pub(crate) fn insert(&mut self, thread: Box<Thread<B>>) -> ThreadId {
        let id = thread.id();
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert_eq!(slot.generation, id.generation());
                slot.thread = Some(thread);
            }
            None => {
                debug_assert_eq!(self.slots.len(), id.index() as usize);
                self.slots.push(Slot {
                    generation: id.generation(),
                    thread: Some(thread),
                });
            }
        }
        self.live += 1;
        id
    }

    /// Remove a thread, retiring its identifier
    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Box<Thread<B>>> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let thread = slot.thread.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        // Capacity was reserved when the slot was created.
        self.free.push(id.index());
        self.live -= 1;
        Some(thread)
    }

    /// Get a thread by ID
    pub(crate) fn get(&self, id: ThreadId) -> Option<&Thread<B>> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.thread.as_deref()
    }

    /// Get a thread by ID, mutably
    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread<B>> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.thread.as_deref_mut()
    }

    /// Get thread count
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Identifiers of every live thread
    pub(crate) fn ids(&self) -> Vec<ThreadId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.thread.as_ref().map(|t| t.id()))
            .collect()
    }
}

impl<B: ContextBackend + 'static> core::fmt::Debug for ThreadTable<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadTable")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .finish()
    }
}
