//! In-flight call coalescing
//!
//! [`SingleFlight`] guarantees at most one running future per key. Callers
//! that arrive while a call is running await the same shared future and
//! observe the identical result. The slot is released as soon as the call
//! settles, so the next caller starts a fresh one. If every caller goes
//! away before completion the underlying future is dropped, which cancels
//! the work it was doing.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

type SharedCall<T> = Shared<BoxFuture<'static, T>>;
type SlotMap<K, T> = Arc<Mutex<HashMap<K, Slot<T>>>>;

struct Slot<T> {
    generation: u64,
    call: WeakShared<BoxFuture<'static, T>>,
}

/// Removes its slot when the owning call completes or is dropped.
struct SlotRelease<K: Eq + Hash, T> {
    slots: SlotMap<K, T>,
    key: Option<K>,
    generation: u64,
}

impl<K: Eq + Hash, T> Drop for SlotRelease<K, T> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&key).is_some_and(|slot| slot.generation == self.generation) {
            slots.remove(&key);
        }
    }
}

pub struct SingleFlight<K, T> {
    slots: SlotMap<K, T>,
    generation: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Runs `make()` unless a call for `key` is already in flight, in which
    /// case that call's result is awaited instead. `make` is only invoked by
    /// the caller that starts the call.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.join_or_start(key, make).await
    }

    fn join_or_start<F, Fut>(&self, key: K, make: F) -> SharedCall<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slots.get(&key).and_then(|slot| slot.call.upgrade()) {
            self.joined.fetch_add(1, Ordering::Relaxed);
            trace!("joining in-flight call");
            return existing;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let release = SlotRelease {
            slots: Arc::clone(&self.slots),
            key: Some(key.clone()),
            generation,
        };
        let call = async move {
            let _release = release;
            make().await
        }
        .boxed()
        .shared();

        if let Some(weak) = call.downgrade() {
            slots.insert(key, Slot { generation, call: weak });
        }
        self.started.fetch_add(1, Ordering::Relaxed);
        call
    }

    pub fn in_flight(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Calls actually started.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that attached to an existing call.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_call() {
        let flight = Arc::new(SingleFlight::<String, u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("k".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        7
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.started(), 1);
        assert_eq!(flight.joined(), 4);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_released_after_completion() {
        let flight = SingleFlight::<&'static str, u32>::new();
        assert_eq!(flight.run("k", || async { 1 }).await, 1);
        assert!(!flight.is_in_flight(&"k"));
        assert_eq!(flight.run("k", || async { 2 }).await, 2);
        assert_eq!(flight.started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_caller_cancels_the_call() {
        let flight = Arc::new(SingleFlight::<&'static str, u32>::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let task = {
            let flight = flight.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                flight
                    .run("k", move || async move {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        1
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flight.is_in_flight(&"k"));
        task.abort();
        let _ = task.await;

        assert!(!flight.is_in_flight(&"k"));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_independently() {
        let flight = SingleFlight::<u8, u8>::new();
        let (a, b) = tokio::join!(flight.run(1, || async { 10 }), flight.run(2, || async { 20 }));
        assert_eq!((a, b), (10, 20));
        assert_eq!(flight.joined(), 0);
    }
}
