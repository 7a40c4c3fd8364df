// Cooperative flags shared between the model, the scheduler and the player.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A flag has no invariant a panicking holder could break.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Binary flag with blocking waits.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.flag) = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *lock(&self.flag) = false;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.flag)
    }

    /// Blocks until the flag equals `state` or the timeout elapses.
    /// Returns whether the flag reached `state`.
    pub fn wait_for(&self, state: bool, timeout: Duration) -> bool {
        let guard = lock(&self.flag);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |flag| *flag != state)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == state
    }
}

/// Set-with-tag flag: the most recent tag wins and is consumed by `take`.
#[derive(Debug)]
pub struct TaggedEvent<T> {
    tag: Mutex<Option<T>>,
}

impl<T> Default for TaggedEvent<T> {
    fn default() -> Self {
        Self {
            tag: Mutex::new(None),
        }
    }
}

impl<T: Copy> TaggedEvent<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tag: T) {
        *lock(&self.tag) = Some(tag);
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.tag).take()
    }

    pub fn peek(&self) -> Option<T> {
        *lock(&self.tag)
    }

    pub fn is_set(&self) -> bool {
        lock(&self.tag).is_some()
    }

    pub fn clear(&self) {
        *lock(&self.tag) = None;
    }
}
