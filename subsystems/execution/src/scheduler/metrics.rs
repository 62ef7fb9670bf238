//! # Scheduler Metrics
//!
//! Counters for scheduler activity. They are atomics so the tick handler
//! can bump them without taking the state lock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Total context switches
    context_switches: AtomicU64,
    /// Total timer ticks
    ticks: AtomicU64,
    /// Total voluntary yields
    voluntary_yields: AtomicU64,
    /// Total preemptions
    preemptions: AtomicU64,
    /// Threads created
    spawned: AtomicU64,
    /// Threads whose resources were released
    reaped: AtomicU64,
    /// Threads whose entry function panicked
    panicked: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total context switches
    pub context_switches: u64,
    /// Total timer ticks
    pub ticks: u64,
    /// Total voluntary yields
    pub voluntary_yields: u64,
    /// Total preemptions
    pub preemptions: u64,
    /// Threads created
    pub spawned: u64,
    /// Threads whose resources were released
    pub reaped: u64,
    /// Threads whose entry function panicked
    pub panicked: u64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            voluntary_yields: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timer tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a voluntary yield
    pub fn record_yield(&self) {
        self.voluntary_yields.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preemption
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a thread creation
    pub fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a thread being reaped
    pub fn record_reap(&self) {
        self.reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a panicking thread
    pub fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total context switches
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Get total ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Get preemptions
    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    /// Copy every counter
    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            voluntary_yields: self.voluntary_yields.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.context_switches.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.voluntary_yields.store(0, Ordering::Relaxed);
        self.preemptions.store(0, Ordering::Relaxed);
        self.spawned.store(0, Ordering::Relaxed);
        self.reaped.store(0, Ordering::Relaxed);
        self.panicked.store(0, Ordering::Relaxed);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
