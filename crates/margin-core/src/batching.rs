//! Coalescing of identical in-flight requests.
//!
//! The first caller for a key becomes the leader: it waits out the batch
//! window, performs the call and fans the result out to every caller that
//! joined in the meantime. A leader that is dropped mid-flight hands nothing
//! to its followers; they retry and one of them takes over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ApiError;

type Waiter = oneshot::Sender<Result<Value, ApiError>>;

#[derive(Debug)]
struct InFlight {
    generation: u64,
    waiters: Vec<Waiter>,
}

enum Ticket {
    Leader(u64),
    Follower(oneshot::Receiver<Result<Value, ApiError>>),
}

#[derive(Debug, Default)]
pub struct RequestCoalescer {
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_generation: AtomicU64,
    coalesced: AtomicU64,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, key: &str) -> Ticket {
        let mut in_flight = self.lock();
        if let Some(entry) = in_flight.get_mut(key) {
            let (sender, receiver) = oneshot::channel();
            entry.waiters.push(sender);
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ticket::Follower(receiver);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(
            key.to_owned(),
            InFlight {
                generation,
                waiters: Vec::new(),
            },
        );
        Ticket::Leader(generation)
    }

    /// Runs `operation` once for all concurrent callers sharing `key`.
    pub async fn run<F, Fut>(
        &self,
        key: &str,
        window: Duration,
        operation: F,
    ) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let generation = loop {
            match self.join(key) {
                Ticket::Leader(generation) => break generation,
                Ticket::Follower(receiver) => match receiver.await {
                    Ok(result) => return result,
                    Err(_) => {
                        debug!(key, "batch leader went away; retrying");
                        continue;
                    }
                },
            }
        };

        let mut guard = LeaderGuard {
            coalescer: self,
            key,
            generation,
            armed: true,
        };

        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
        let result = operation().await;

        guard.armed = false;
        let waiters = self.take(key, generation);
        if !waiters.is_empty() {
            debug!(key, followers = waiters.len(), "fanning out batched response");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    fn take(&self, key: &str, generation: u64) -> Vec<Waiter> {
        let mut in_flight = self.lock();
        match in_flight.get(key) {
            Some(entry) if entry.generation == generation => in_flight
                .remove(key)
                .map(|entry| entry.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Requests that piggybacked on another caller's call.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().len()
    }

    /// Forget every batch. Waiting followers retry on their own.
    pub fn clear(&self) {
        self.lock().clear();
        self.coalesced.store(0, Ordering::Relaxed);
    }
}

struct LeaderGuard<'a> {
    coalescer: &'a RequestCoalescer,
    key: &'a str,
    generation: u64,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            // Dropping the senders wakes the followers with a closed channel.
            drop(self.coalescer.take(self.key, self.generation));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_call() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let calls = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    coalescer
                        .run("GET:/ml-models:null", Duration::from_millis(50), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(json!({"models": []}))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let result = task.await.expect("task should not panic");
            assert_eq!(result, Ok(json!({"models": []})));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.coalesced_count(), 2);
        assert_eq!(coalescer.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let coalescer = RequestCoalescer::new();

        let result = coalescer
            .run("k", Duration::ZERO, || async {
                Err(ApiError::transient("upstream down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(coalescer.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn dropped_leader_releases_key() {
        let coalescer = RequestCoalescer::new();

        let pending = coalescer.run("k", Duration::from_secs(60), || async { Ok(Value::Null) });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(coalescer.in_flight_len(), 0);

        let result = coalescer
            .run("k", Duration::ZERO, || async { Ok(json!(1)) })
            .await;
        assert_eq!(result, Ok(json!(1)));
    }
}
