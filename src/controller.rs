//! Job controller: at-most-one-in-flight dispatch per key on a bounded
//! worker pool, plus the global outbound-call limiter and run epochs.
//!
//! A job is identified by a stable string key. While a key is in flight any
//! further `submit` for it is refused, so periodic triggers (scan timers,
//! fallback polls) can never pile up duplicate work. The key is released on
//! every exit path of the task, including panics and runtime shutdown.
//!
//! Exchange rate limits apply per account/IP rather than per job, so a second,
//! independent semaphore caps outbound calls across all keys.

use crate::config::ControllerConfig;
use crate::errors::Result;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, warn};

/// Lifecycle notification for one submitted job, tagged with its run id.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent<T> {
    Started(u64),
    Succeeded(u64, T),
    Failed(u64, String),
    Finished(u64),
}

/// Receiving side of a submitted job.
pub struct JobHandle<T> {
    key: String,
    run_id: u64,
    events: mpsc::UnboundedReceiver<JobEvent<T>>,
}

impl<T> JobHandle<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Next lifecycle event; `None` once `Finished` has been delivered.
    pub async fn next_event(&mut self) -> Option<JobEvent<T>> {
        self.events.recv().await
    }

    /// Waits for the terminal result, skipping lifecycle events.
    pub async fn outcome(mut self) -> std::result::Result<T, String> {
        let mut outcome = Err(format!("job {} ended without a result", self.key));
        while let Some(event) = self.events.recv().await {
            match event {
                JobEvent::Succeeded(_, value) => outcome = Ok(value),
                JobEvent::Failed(_, message) => outcome = Err(message),
                JobEvent::Finished(_) => break,
                JobEvent::Started(_) => {}
            }
        }
        outcome
    }
}

/// Global cap on outbound exchange calls; cheap to clone.
#[derive(Clone)]
pub struct OutboundLimiter {
    slots: Arc<Semaphore>,
}

impl OutboundLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Holds one slot for the duration of `call`, released on every exit path.
    pub async fn run<F, T>(&self, call: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        call.await
    }

    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        // The semaphore is never closed, so `None` is unreachable in practice.
        self.slots.clone().acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Monotonic run counter; bumping it makes every older completion inert.
#[derive(Clone, Default, Debug)]
pub struct RunEpoch(Arc<AtomicU64>);

impl RunEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Starts a new run and returns its id.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, run_id: u64) -> bool {
        self.current() == run_id
    }
}

struct Inner {
    // key -> ticket of the submission currently holding it
    in_flight: Mutex<HashMap<String, u64>>,
    next_ticket: AtomicU64,
    workers: Arc<Semaphore>,
}

/// Releases a key when the owning task ends, unless it was force-cleared and
/// taken by a newer submission in the meantime.
struct KeyRelease {
    inner: Arc<Inner>,
    key: String,
    ticket: u64,
}

impl Drop for KeyRelease {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(&self.key) == Some(&self.ticket) {
            in_flight.remove(&self.key);
        }
    }
}

/// Process-scoped dispatcher; construct once and clone into every consumer.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
    limiter: OutboundLimiter,
}

impl JobController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            }),
            limiter: OutboundLimiter::new(config.max_http),
        }
    }

    pub fn limiter(&self) -> OutboundLimiter {
        self.limiter.clone()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Submits `task` under `key`. Returns `None` without running anything when
    /// the key already has a task in flight; callers retry on a later trigger.
    pub fn submit<F, T>(&self, key: impl Into<String>, run_id: u64, task: F) -> Option<JobHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        let ticket = {
            let mut in_flight = self.inner.in_flight.lock();
            if in_flight.contains_key(&key) {
                debug!(%key, run_id, "[JOB] already in flight, skipped");
                return None;
            }
            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
            in_flight.insert(key.clone(), ticket);
            ticket
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(JobEvent::Started(run_id));

        let release = KeyRelease {
            inner: self.inner.clone(),
            key: key.clone(),
            ticket,
        };
        let workers = self.inner.workers.clone();
        let job_key = key.clone();
        tokio::spawn(async move {
            let event = match workers.acquire_owned().await {
                Ok(_worker) => match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(value)) => JobEvent::Succeeded(run_id, value),
                    Ok(Err(err)) => JobEvent::Failed(run_id, err.to_string()),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(key = %job_key, run_id, %message, "[JOB] task panicked");
                        JobEvent::Failed(run_id, message)
                    }
                },
                Err(_) => JobEvent::Failed(run_id, "worker pool closed".into()),
            };
            let _ = tx.send(event);
            drop(release);
            let _ = tx.send(JobEvent::Finished(run_id));
        });

        Some(JobHandle {
            key,
            run_id,
            events: rx,
        })
    }

    /// Force-releases `key`. A task still running under it keeps running; its
    /// completion is expected to be rejected downstream by run id.
    pub fn clear_key(&self, key: &str) {
        self.inner.in_flight.lock().remove(key);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn controller(workers: usize, http: usize) -> JobController {
        JobController::new(&ControllerConfig {
            max_workers: workers,
            max_http: http,
        })
    }

    #[tokio::test]
    async fn second_submit_for_busy_key_is_refused_until_first_resolves() {
        let ctl = controller(4, 4);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = ctl
            .submit("scan", 1, async move {
                let _ = release_rx.await;
                Ok(7u32)
            })
            .expect("first submit runs");
        assert!(ctl.submit("scan", 1, async { Ok(8u32) }).is_none());
        assert!(ctl.is_in_flight("scan"));

        release_tx.send(()).unwrap();
        assert_eq!(first.outcome().await, Ok(7));
        assert!(!ctl.is_in_flight("scan"));

        let third = ctl.submit("scan", 2, async { Ok(9u32) }).expect("key released");
        assert_eq!(third.outcome().await, Ok(9));
    }

    #[tokio::test]
    async fn events_arrive_in_lifecycle_order() {
        let ctl = controller(1, 1);
        let mut handle = ctl.submit("k", 5, async { Ok("done") }).unwrap();
        assert_eq!(handle.next_event().await, Some(JobEvent::Started(5)));
        assert_eq!(handle.next_event().await, Some(JobEvent::Succeeded(5, "done")));
        assert_eq!(handle.next_event().await, Some(JobEvent::Finished(5)));
        assert_eq!(handle.next_event().await, None);
    }

    #[tokio::test]
    async fn failures_and_panics_release_the_key() {
        let ctl = controller(2, 2);
        let failed = ctl
            .submit("discovery", 3, async {
                Err::<(), _>(AppError::DiscoveryUnavailable("all venues down".into()))
            })
            .unwrap();
        let err = failed.outcome().await.unwrap_err();
        assert!(err.contains("all venues down"));
        assert!(!ctl.is_in_flight("discovery"));

        let panicked = ctl
            .submit("discovery", 4, async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .unwrap();
        let err = panicked.outcome().await.unwrap_err();
        assert!(err.contains("boom"));
        assert!(ctl.submit("discovery", 5, async { Ok(()) }).is_some());
    }

    #[tokio::test]
    async fn stale_completion_after_clear_key_keeps_new_owner() {
        let ctl = controller(4, 4);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let stale = ctl
            .submit("fallback:BTC/USDT", 1, async move {
                let _ = release_rx.await;
                Ok(1u8)
            })
            .unwrap();

        ctl.clear_key("fallback:BTC/USDT");
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let fresh = ctl
            .submit("fallback:BTC/USDT", 2, async move {
                let _ = hold_rx.await;
                Ok(2u8)
            })
            .expect("cleared key can be reused");

        release_tx.send(()).unwrap();
        assert_eq!(stale.outcome().await, Ok(1));
        // the stale task ending must not free the key held by the new run
        assert!(ctl.is_in_flight("fallback:BTC/USDT"));

        hold_tx.send(()).unwrap();
        assert_eq!(fresh.outcome().await, Ok(2));
        assert!(!ctl.is_in_flight("fallback:BTC/USDT"));
    }

    #[tokio::test]
    async fn outbound_limiter_caps_concurrency_across_tasks() {
        let limiter = OutboundLimiter::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..8).map(|_| {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                limiter
                    .run(async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn run_epoch_rejects_older_ids() {
        let epoch = RunEpoch::new();
        let first = epoch.advance();
        assert!(epoch.is_current(first));
        let second = epoch.advance();
        assert!(!epoch.is_current(first));
        assert!(epoch.is_current(second));
    }
}
