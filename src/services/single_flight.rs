//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one computation: the
//! first caller (the leader) runs it, everyone else subscribes and receives
//! a clone of the leader's result. If the leader is dropped before finishing,
//! its channel closes and a waiting caller takes over.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, broadcast::Sender<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the leader's entry if the computation never completes.
struct LeaderGuard<'a, K: Eq + Hash, V> {
    flight: &'a SingleFlight<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flight.lock().remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, broadcast::Sender<V>>> {
        // The map stays consistent even if a holder panicked
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{

    /// Run `compute` for `key`, or join a computation already running for it.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let mut rx = {
                let mut in_flight = self.lock();
                match in_flight.get(&key) {
                    Some(sender) => sender.subscribe(),
                    None => {
                        let (sender, _) = broadcast::channel(1);
                        in_flight.insert(key.clone(), sender);
                        break;
                    }
                }
            };

            match rx.recv().await {
                Ok(value) => return value,
                // Leader went away without a result
                Err(_) => continue,
            }
        }

        let mut guard = LeaderGuard {
            flight: self,
            key: Some(key.clone()),
        };
        let value = compute().await;

        {
            let mut in_flight = self.lock();
            if let Some(sender) = in_flight.remove(&key) {
                // No receivers is fine
                let _ = sender.send(value.clone());
            }
        }
        guard.key = None;

        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let flight: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("sprint:1", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_compute_again() {
        let flight: SingleFlight<u8, u32> = SingleFlight::new();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            flight
                .run(1, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    0
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_follower_takes_over_from_cancelled_leader() {
        let flight: Arc<SingleFlight<u8, &'static str>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(7, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        "leader"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flight.in_flight(), 1);

        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run(7, || async { "follower" }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let value = tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .expect("follower should not hang")
            .unwrap();

        assert_eq!(value, "follower");
        assert_eq!(flight.in_flight(), 0);
    }
}
