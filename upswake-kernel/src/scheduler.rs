/**
 * SCHEDULER - One polling worker per wake target
 *
 * Each worker waits one interval, asks for a conditional wake of its MAC,
 * resets its ticker and waits again. Requests inside a worker never overlap;
 * workers know nothing about each other.
 *
 * The wake request goes through a `WakeTrigger`: either a loopback HTTP call
 * to our own `/api/upswake` (same path an operator would use) or a direct
 * call into the `WakeService` with the current config snapshot.
 *
 * A single CancellationToken stops everything: it is watched while waiting
 * for a tick and while a request is in flight. A worker whose interval does
 * not parse refuses to start and reports it; the others keep running.
 */

use crate::config::{parse_interval, Config, WakeTarget};
use crate::models::{Message, UpsWakeIn};
use crate::service::{ServiceError, UpsWakeOutcome, WakeService, MSG_NOT_ALLOWED, MSG_WOKEN};
use crate::state::SharedConfig;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("target {target}: invalid interval: {reason}")]
    InvalidInterval { target: String, reason: String },

    #[error("wake request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("wake request answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("MAC {mac} not found in the config")]
    NotFound { mac: String },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[async_trait]
pub trait WakeTrigger: Send + Sync {
    async fn request_wake(&self, mac: &str) -> Result<Message, SchedulerError>;
}

/// Loopback call to `POST {base_url}/api/upswake`.
pub struct HttpTrigger {
    client: reqwest::Client,
    url: String,
}

impl HttpTrigger {
    pub fn new(base_url: &str) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/upswake", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl WakeTrigger for HttpTrigger {
    async fn request_wake(&self, mac: &str) -> Result<Message, SchedulerError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&UpsWakeIn { mac: mac.to_string() })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SchedulerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<Message>().await?)
    }
}

/// Skips the HTTP hop and reads the live config on every call.
pub struct InProcessTrigger {
    service: WakeService,
    config: SharedConfig,
}

impl InProcessTrigger {
    pub fn new(service: WakeService, config: SharedConfig) -> Self {
        Self { service, config }
    }
}

#[async_trait]
impl WakeTrigger for InProcessTrigger {
    async fn request_wake(&self, mac: &str) -> Result<Message, SchedulerError> {
        let cfg = self.config.snapshot();
        match self.service.upswake(&cfg, mac).await? {
            UpsWakeOutcome::Woken(_) => Ok(Message::woken(MSG_WOKEN, true)),
            UpsWakeOutcome::NotAllowed => Ok(Message::woken(MSG_NOT_ALLOWED, false)),
            UpsWakeOutcome::NotFound => Err(SchedulerError::NotFound { mac: mac.to_string() }),
        }
    }
}

/// How a worker ended.
#[derive(Debug)]
pub enum WorkerExit {
    Stopped,
    Failed(SchedulerError),
    Panicked(String),
    /// Did not stop within the grace period.
    Aborted,
}

pub async fn run_worker(
    target: WakeTarget,
    trigger: Arc<dyn WakeTrigger>,
    cancel: CancellationToken,
) -> Result<(), SchedulerError> {
    let (period, first) = parse_interval(&target.interval)
        .and_then(|period| {
            Instant::now()
                .checked_add(period)
                .map(|first| (period, first))
                .ok_or_else(|| format!("interval {:?} is out of range", target.interval))
        })
        .map_err(|reason| {
            error!(
                wake_target = %target.name,
                interval = %target.interval,
                %reason,
                "worker not started"
            );
            SchedulerError::InvalidInterval {
                target: target.name.clone(),
                reason,
            }
        })?;

    info!(
        wake_target = %target.name,
        mac = %target.mac,
        every = %humantime::format_duration(period),
        "worker started"
    );

    let mut ticker = interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = trigger.request_wake(&target.mac) => match res {
                Ok(reply) => info!(
                    wake_target = %target.name,
                    woken = reply.woken.unwrap_or(false),
                    message = %reply.message,
                    "wake request done"
                ),
                Err(e) => warn!(wake_target = %target.name, error = %e, "wake request failed"),
            }
        }

        ticker.reset();
    }

    info!(wake_target = %target.name, "worker stopped");
    Ok(())
}

/// Owns every worker task and the token that stops them.
pub struct WorkerRegistry {
    cancel: CancellationToken,
    workers: Vec<(String, JoinHandle<Result<(), SchedulerError>>)>,
}

impl WorkerRegistry {
    pub fn spawn(
        config: &Config,
        trigger: Arc<dyn WakeTrigger>,
        cancel: CancellationToken,
    ) -> Self {
        let workers = config
            .targets()
            .map(|(_, target)| {
                let worker = run_worker(target.clone(), trigger.clone(), cancel.clone());
                let handle = tokio::spawn(worker);
                (target.name.clone(), handle)
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), "scheduler started");
        Self { cancel, workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels all workers and waits up to `grace` in total for them.
    pub async fn shutdown(self, grace: Duration) -> Vec<(String, WorkerExit)> {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;

        let mut exits = Vec::with_capacity(self.workers.len());
        for (name, mut handle) in self.workers {
            let exit = match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => WorkerExit::Stopped,
                Ok(Ok(Err(e))) => WorkerExit::Failed(e),
                Ok(Err(join)) => WorkerExit::Panicked(join.to_string()),
                Err(_) => {
                    handle.abort();
                    warn!(wake_target = %name, "worker aborted after grace period");
                    WorkerExit::Aborted
                }
            };
            exits.push((name, exit));
        }
        exits
    }
}

/// Waits for `signal`, then cancels `cancel`. Meant as the graceful shutdown
/// future of the HTTP server so workers stop as soon as shutdown starts.
pub async fn cancel_on(signal: impl Future<Output = ()>, cancel: CancellationToken) {
    signal.await;
    info!("shutdown requested");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NutSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl WakeTrigger for Counting {
        async fn request_wake(&self, _mac: &str) -> Result<Message, SchedulerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Message::woken(MSG_NOT_ALLOWED, false))
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl WakeTrigger for Failing {
        async fn request_wake(&self, mac: &str) -> Result<Message, SchedulerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SchedulerError::NotFound { mac: mac.into() })
        }
    }

    fn target(name: &str, interval: &str) -> WakeTarget {
        WakeTarget {
            name: name.into(),
            mac: "00:11:22:33:44:55".into(),
            broadcast: None,
            port: 9,
            interval: interval.into(),
            rules: vec![],
        }
    }

    fn config(targets: Vec<WakeTarget>) -> Config {
        Config {
            nut_servers: vec![NutSource {
                name: "rack".into(),
                host: "127.0.0.1".into(),
                port: 0,
                username: "u".into(),
                password: "p".into(),
                targets,
            }],
        }
    }

    #[tokio::test]
    async fn test_bad_interval_does_not_stop_other_workers() {
        let trigger = Arc::new(Counting::default());
        let cfg = config(vec![target("broken", "soon"), target("good", "20ms")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger.clone(), CancellationToken::new());
        assert_eq!(registry.len(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(trigger.calls.load(Ordering::SeqCst) >= 2);

        let exits = registry.shutdown(Duration::from_secs(1)).await;
        assert_eq!(exits[0].0, "broken");
        assert!(matches!(
            exits[0].1,
            WorkerExit::Failed(SchedulerError::InvalidInterval { ref target, .. })
                if target == "broken"
        ));
        assert_eq!(exits[1].0, "good");
        assert!(matches!(exits[1].1, WorkerExit::Stopped));
    }

    #[tokio::test]
    async fn test_huge_interval_is_rejected_without_panic() {
        let trigger = Arc::new(Counting::default());
        let cfg = config(vec![target("forever", "500000000000years")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger, CancellationToken::new());

        let exits = registry.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(
            exits[0].1,
            WorkerExit::Failed(SchedulerError::InvalidInterval { ref target, .. })
                if target == "forever"
        ));
    }

    #[tokio::test]
    async fn test_first_tick_waits_one_interval() {
        let trigger = Arc::new(Counting::default());
        let cfg = config(vec![target("slow", "1h")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger.clone(), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_requests_are_sequential_per_worker() {
        let trigger = Arc::new(Counting {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let cfg = config(vec![target("nas", "5ms")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger.clone(), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.shutdown(Duration::from_secs(1)).await;

        assert!(trigger.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(trigger.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_keep_worker_alive() {
        let trigger = Arc::new(Failing(AtomicUsize::new(0)));
        let cfg = config(vec![target("nas", "10ms")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger.clone(), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let exits = registry.shutdown(Duration::from_secs(1)).await;

        assert!(trigger.0.load(Ordering::SeqCst) >= 3);
        assert!(matches!(exits[0].1, WorkerExit::Stopped));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_request() {
        let trigger = Arc::new(Counting {
            delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let cfg = config(vec![target("nas", "10ms")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger.clone(), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(trigger.in_flight.load(Ordering::SeqCst), 1);

        let started = std::time::Instant::now();
        let exits = registry.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(exits[0].1, WorkerExit::Stopped));
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_external_token_stops_workers() {
        let cancel = CancellationToken::new();
        let cfg = config(vec![target("nas", "10ms")]);
        let registry = WorkerRegistry::spawn(&cfg, Arc::new(Counting::default()), cancel.clone());
        cancel.cancel();
        assert!(registry.cancel_token().is_cancelled());
        let exits = registry.shutdown(Duration::from_millis(500)).await;
        assert!(matches!(exits[0].1, WorkerExit::Stopped));
    }

    #[tokio::test]
    async fn test_shutdown_signal_cancels_in_flight_request() {
        let trigger = Arc::new(Counting {
            delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let cfg = config(vec![target("nas", "10ms")]);
        let registry = WorkerRegistry::spawn(&cfg, trigger.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(trigger.in_flight.load(Ordering::SeqCst), 1);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = tokio::spawn(cancel_on(
            async move {
                rx.await.ok();
            },
            cancel.clone(),
        ));
        assert!(!cancel.is_cancelled());

        tx.send(()).unwrap();
        shutdown.await.unwrap();
        assert!(cancel.is_cancelled());

        let exits = registry.shutdown(Duration::from_millis(500)).await;
        assert!(matches!(exits[0].1, WorkerExit::Stopped));
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_trigger_builds_url() {
        let trigger = HttpTrigger::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(trigger.url, "http://127.0.0.1:8080/api/upswake");
    }
}
