//! Duplicate call suppression.
//!
//! [`Group::work`] collapses concurrent calls that share a key into one
//! execution of the underlying operation. The first caller runs it; callers
//! arriving while it is in flight wait and receive a clone of its result.
//! The key is cleared as soon as the call completes, so nothing is cached:
//! the next call after completion runs the operation again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::trace;

type Flight<T> = watch::Receiver<Option<T>>;

/// A set of in-flight calls keyed by string.
#[derive(Debug)]
pub struct Group<T> {
    calls: Mutex<HashMap<String, Flight<T>>>,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Group<T> {
    /// Poisoning is ignored: no critical section leaves the map half-updated.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Flight<T>>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(Flight<T>),
}

/// Clears the leader's key when its call finishes or is dropped mid-flight.
struct Landing<'a, T> {
    group: &'a Group<T>,
    key: &'a str,
}

impl<T> Drop for Landing<'_, T> {
    fn drop(&mut self) {
        self.group.lock().remove(self.key);
    }
}

impl<T> Group<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` unless a call for `key` is already in flight, in
    /// which case the result of that call is returned instead.
    ///
    /// If the caller running the operation is cancelled before it finishes,
    /// one of the waiting callers runs its own `operation` in its place.
    pub async fn work<F, Fut>(&self, key: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            match self.join(key) {
                Role::Leader(sender) => {
                    let landing = Landing { group: self, key };
                    let result = operation().await;
                    drop(landing);
                    sender.send_replace(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut flight) => {
                    trace!(key, "joining in-flight call");
                    if let Ok(result) = flight.wait_for(Option::is_some).await
                        && let Some(result) = result.as_ref()
                    {
                        return result.clone();
                    }
                }
            }
        }
    }

    fn join(&self, key: &str) -> Role<T> {
        let mut calls = self.lock();
        if let Some(flight) = calls.get(key) {
            return Role::Follower(flight.clone());
        }
        let (sender, receiver) = watch::channel(None);
        calls.insert(key.to_string(), receiver);
        Role::Leader(sender)
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
