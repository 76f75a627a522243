//! The engine driving webhook deliveries: a single scheduler loop that picks
//! due hooks, enforces the global concurrency cap and the per-URL
//! single-flight rule, and spawns delivery tasks; plus a retention loop that
//! sweeps lapsed retired hooks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{Accounts, Suppression};
use crate::error::Error;
use crate::store::HookStore;
use crate::types::Hook;
use crate::worker;

/// Tuning of the delivery engine.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on in-flight deliveries, across all URLs.
    pub max_concurrent_deliveries: usize,
    /// Overall deadline of one HTTP POST.
    pub attempt_timeout: Duration,
    /// Wait before the first retired-hook sweep after startup.
    pub cleanup_startup_delay: Duration,
    /// Interval between retired-hook sweeps.
    pub cleanup_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 10,
            attempt_timeout: Duration::from_secs(60),
            cleanup_startup_delay: Duration::from_secs(4),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// State shared between the scheduler, delivery tasks and intake.
pub(crate) struct EngineInner {
    pub(crate) store: HookStore,
    pub(crate) accounts: Arc<dyn Accounts>,
    pub(crate) suppression: Arc<dyn Suppression>,
    pub(crate) config: DispatcherConfig,
    pub(crate) client: reqwest::Client,
    kick_tx: mpsc::Sender<()>,
    done_tx: mpsc::Sender<String>,
}

/// Handle to a running webhook delivery engine.
///
/// Intake and admin calls may come from any task; they communicate with the
/// scheduler only through the store and a coalesced kick signal.
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown: CancellationToken,
    scheduler_handle: Option<JoinHandle<()>>,
    cleanup_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start the scheduler and retention loops. Must be called within a tokio
    /// runtime.
    pub fn start(
        store: HookStore,
        accounts: Arc<dyn Accounts>,
        suppression: Arc<dyn Suppression>,
        config: DispatcherConfig,
    ) -> Result<Engine, Error> {
        // Few idle connections, short lived: webhook traffic is bursty and
        // mostly idle.
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(2)
            .build()?;

        // The kick channel is the coalesced wake-up: a second kick while one
        // is pending is dropped. The completion channel has one slot per
        // possible in-flight delivery so workers never block on it.
        let (kick_tx, kick_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(config.max_concurrent_deliveries.max(1));

        let inner = Arc::new(EngineInner {
            store,
            accounts,
            suppression,
            config,
            client,
            kick_tx,
            done_tx,
        });
        let shutdown = CancellationToken::new();

        let scheduler_handle = tokio::spawn(scheduler_loop(
            inner.clone(),
            kick_rx,
            done_rx,
            shutdown.clone(),
        ));
        let cleanup_handle = tokio::spawn(cleanup_loop(inner.clone(), shutdown.clone()));

        Ok(Engine {
            inner,
            shutdown,
            scheduler_handle: Some(scheduler_handle),
            cleanup_handle: Some(cleanup_handle),
        })
    }

    /// Wake the scheduler. Coalesced and non-blocking.
    pub fn kick(&self) {
        let _ = self.inner.kick_tx.try_send(());
    }

    /// Direct access to the underlying store.
    pub fn store(&self) -> &HookStore {
        &self.inner.store
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    pub(crate) fn accounts(&self) -> &dyn Accounts {
        self.inner.accounts.as_ref()
    }

    /// Stop launching deliveries, wait for in-flight deliveries to complete
    /// (bounded by the attempt timeout), then stop the loops.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.cleanup_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn scheduler_loop(
    inner: Arc<EngineInner>,
    mut kick_rx: mpsc::Receiver<()>,
    mut done_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    let mut busy_urls: HashSet<String> = HashSet::new();
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Drain: in-flight deliveries run to completion.
                while !busy_urls.is_empty() {
                    match done_rx.recv().await {
                        Some(url) => {
                            busy_urls.remove(&url);
                        }
                        None => break,
                    }
                }
                debug!("webhook scheduler stopped");
                return;
            }
            _ = kick_rx.recv() => {}
            Some(url) = done_rx.recv() => {
                busy_urls.remove(&url);
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if busy_urls.len() >= inner.config.max_concurrent_deliveries {
            // Nothing can launch until a delivery finishes; its completion
            // signal wakes us.
            deadline = Instant::now() + Duration::from_secs(24 * 3600);
            continue;
        }

        launch(&inner, &mut busy_urls);
        deadline = Instant::now() + next_work_delay(&inner, &busy_urls);
    }
}

/// Spawn deliveries for due hooks, one per URL, up to the concurrency cap.
fn launch(inner: &Arc<EngineInner>, busy_urls: &mut HashSet<String>) {
    let cap = inner.config.max_concurrent_deliveries;
    let hooks = match inner.store.due_hooks(Utc::now(), cap, busy_urls) {
        Ok(hooks) => hooks,
        Err(err) => {
            error!(%err, "querying for work in webhook queue");
            return;
        }
    };

    for h in hooks {
        if busy_urls.len() >= cap {
            break;
        }
        // The query excluded already-busy URLs; this also keeps two hooks
        // from the same batch off one URL.
        if busy_urls.contains(&h.url) {
            continue;
        }
        busy_urls.insert(h.url.clone());
        spawn_delivery(inner.clone(), h);
    }
}

fn spawn_delivery(inner: Arc<EngineInner>, h: Hook) {
    tokio::spawn(async move {
        let url = h.url.clone();
        let id = h.id;
        let res = std::panic::AssertUnwindSafe(worker::deliver(inner.clone(), h))
            .catch_unwind()
            .await;
        if res.is_err() {
            error!(webhookid = id, "webhook delivery panicked");
            worker::metric_panic("deliver");
        }
        // The completion signal must go out even after a panic, or the URL
        // would stay busy forever.
        let _ = inner.done_tx.send(url).await;
    });
}

/// How long the scheduler can sleep: until the earliest pending hook on a
/// non-busy URL, 24h when idle, 1m after a store error.
fn next_work_delay(inner: &Arc<EngineInner>, busy_urls: &HashSet<String>) -> Duration {
    match inner.store.next_work(busy_urls) {
        Ok(Some(t)) => (t - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        Ok(None) => Duration::from_secs(24 * 3600),
        Err(err) => {
            error!(%err, "finding time for next webhook delivery attempt");
            Duration::from_secs(60)
        }
    }
}

/// Periodically delete retired hooks whose retention has lapsed.
async fn cleanup_loop(inner: Arc<EngineInner>, shutdown: CancellationToken) {
    let mut delay = inner.config.cleanup_startup_delay;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let swept =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                inner.store.cleanup_retired(Utc::now())
            }));
        match swept {
            Ok(Ok(n)) => {
                if n > 0 {
                    debug!(count = n, "cleaned up retired webhooks");
                }
            }
            Ok(Err(err)) => error!(%err, "removing old retired webhooks"),
            Err(_) => {
                error!("panic while cleaning up retired webhooks");
                worker::metric_panic("cleanup");
            }
        }
        delay = inner.config.cleanup_interval;
    }
}
