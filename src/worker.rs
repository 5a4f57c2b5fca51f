//! Rotating-slot worker pool for per-buffer analysis.
//!
//! The pool holds a fixed number of execution slots, each with at most one
//! in-flight analysis task. Before a slot is reused its previous task is
//! joined, so for slot count M, task *i* always completes (including its
//! final counter update) before task *i+M* begins. This caps analysis
//! concurrency at M independently of the transfer-buffer depth.
//!
//! A task that returns an error is surfaced when its slot is next joined;
//! the streaming loop observes it before the next submission and terminates
//! the session instead of crashing silently.

use std::thread::{self, JoinHandle};

use log::debug;

use crate::error::{Error, Result};

/// Default number of analysis worker slots.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Fixed set of rotating analysis execution slots.
pub struct WorkerPool {
    slots: Vec<Option<JoinHandle<Result<()>>>>,
}

impl WorkerPool {
    /// Create a pool with `worker_count` slots.
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(Error::invalid_config("worker count must be non-zero"));
        }
        Ok(Self {
            slots: (0..worker_count).map(|_| None).collect(),
        })
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index used for the buffer analyzed at `loop_count`.
    pub fn slot_for(&self, loop_count: u64) -> usize {
        (loop_count.saturating_sub(1) % self.slots.len() as u64) as usize
    }

    /// Submit a task into a slot, joining the slot's previous task first.
    ///
    /// Blocks until the previous occupant (if any) finishes; its error, if
    /// it failed, is returned and the new task is *not* started.
    pub fn submit<F>(&mut self, slot: usize, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.join_slot(slot)?;
        self.slots[slot] = Some(thread::spawn(task));
        Ok(())
    }

    /// Join the task occupying `slot`, if any, and return its result.
    ///
    /// A panicked task is reported as [`Error::WorkerPanic`].
    pub fn join_slot(&mut self, slot: usize) -> Result<()> {
        match self.slots[slot].take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::WorkerPanic),
            },
            None => Ok(()),
        }
    }

    /// Join every outstanding task. All slots are drained even if an early
    /// one failed; the first error is returned.
    pub fn join_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for slot in 0..self.slots.len() {
            if let Err(e) = self.join_slot(slot) {
                debug!("worker slot {} finished with error: {}", slot, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Tasks are never cancelled; run everything to completion.
        let _ = self.join_all();
    }
}
