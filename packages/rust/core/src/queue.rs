//! Bounded background work queue with submit-time deduplication.
//!
//! A job is keyed by its artifact cache key. While a job for a key is queued
//! or executing, further submissions for that key are rejected as
//! [`SubmitOutcome::Deduplicated`]. Concurrency is bounded by a semaphore;
//! accepted jobs wait for a permit before they start.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Deduplicated,
}

#[derive(Clone)]
pub struct WorkQueue {
    in_flight: Arc<DashMap<String, ()>>,
    permits: Arc<Semaphore>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Releases a job's key when the job finishes, panics, or is dropped.
struct KeyGuard {
    in_flight: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

impl WorkQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Submit `job` under `key`. The key is claimed atomically; it stays
    /// claimed until the job completes.
    pub fn submit<F>(&self, key: impl Into<String>, job: F) -> SubmitOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(%key, "job already in flight");
                return SubmitOutcome::Deduplicated;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let guard = KeyGuard {
            in_flight: Arc::clone(&self.in_flight),
            key,
        };
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            // The semaphore is never closed, so acquisition only fails on shutdown.
            let _permit = permits.acquire_owned().await.ok();
            job.await;
        });

        let mut handles = self.lock_handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        SubmitOutcome::Accepted
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait for every accepted job, including jobs submitted while draining.
    pub async fn drain(&self) {
        loop {
            let pending = std::mem::take(&mut *self.lock_handles());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background job did not complete");
                }
            }
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_keys_are_rejected_while_in_flight() {
        let queue = WorkQueue::new(2);
        let runs = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let counter = runs.clone();
        assert_eq!(
            queue.submit("judgement:sc1:fr1", async move {
                let _ = rx.await;
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            SubmitOutcome::Accepted
        );
        assert!(queue.is_in_flight("judgement:sc1:fr1"));

        let counter = runs.clone();
        assert_eq!(
            queue.submit("judgement:sc1:fr1", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            SubmitOutcome::Deduplicated
        );

        tx.send(()).unwrap();
        queue.drain().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!queue.is_in_flight("judgement:sc1:fr1"));

        // Released keys can be submitted again.
        assert_eq!(queue.submit("judgement:sc1:fr1", async {}), SubmitOutcome::Accepted);
        queue.drain().await;
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let queue = WorkQueue::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            queue.submit(format!("job-{i}"), async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        queue.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn panicking_job_releases_its_key() {
        let queue = WorkQueue::new(1);
        queue.submit("k", async { panic!("boom") });
        queue.drain().await;
        assert!(!queue.is_in_flight("k"));
    }
}
