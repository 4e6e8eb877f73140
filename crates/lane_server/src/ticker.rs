//! Named timers attached to a server.
//!
//! A non-autonomous ticker delivers each firing as a `Ticker` message, so the
//! callback runs on a dispatch loop in order with packets. An autonomous
//! ticker runs callbacks on its own task, concurrently with dispatch.

use crate::message::{MessageAttr, MessageType, TickerCaller};
use crate::server::WeakServer;
use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct TimerEntry {
    id: u64,
    token: CancellationToken,
}

pub struct Ticker {
    autonomous: bool,
    server: WeakServer,
    runtime: Handle,
    timers: Arc<DashMap<String, TimerEntry>>,
    next_id: AtomicU64,
    released: AtomicBool,
}

impl Ticker {
    pub(crate) fn new(autonomous: bool, server: WeakServer, runtime: Handle) -> Self {
        Self {
            autonomous,
            server,
            runtime,
            timers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn is_autonomous(&self) -> bool {
        self.autonomous
    }

    /// Runs `f` once after `delay`. Replaces any timer with the same name.
    pub fn after(&self, name: impl Into<String>, delay: Duration, f: impl Fn() + Send + Sync + 'static) {
        self.repeat(name, delay, Duration::ZERO, Some(1), f);
    }

    /// Runs `f` after `after`, then every `interval`, `times` times in total
    /// (`None` repeats until stopped). Replaces any timer with the same name.
    pub fn repeat(
        &self,
        name: impl Into<String>,
        after: Duration,
        interval: Duration,
        times: Option<u32>,
        f: impl Fn() + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.released.load(Ordering::Acquire) {
            warn!(timer = %name, "ticker released, timer ignored");
            return;
        }
        if times == Some(0) {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some(previous) = self.timers.insert(
            name.clone(),
            TimerEntry {
                id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let caller: TickerCaller = Arc::new(f);
        let timers = self.timers.clone();
        let server = self.server.clone();
        let autonomous = self.autonomous;
        let interval = interval.max(MIN_INTERVAL);

        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(after) => {}
            }
            let mut fired: u32 = 0;
            loop {
                if !deliver(autonomous, &server, &name, &caller).await {
                    break;
                }
                fired += 1;
                if times.is_some_and(|times| fired >= times) {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            timers.remove_if(&name, |_, entry| entry.id == id);
        });
    }

    /// Cancels the named timer if it exists.
    pub fn stop_timer(&self, name: &str) {
        if let Some((_, entry)) = self.timers.remove(name) {
            entry.token.cancel();
        }
    }

    /// Number of timers still scheduled.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Cancels every timer. Later registrations are ignored.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        let names: Vec<String> = self.timers.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.stop_timer(&name);
        }
        debug!("ticker released");
    }
}

/// Delivers one firing. Returns false when the owning server is gone.
async fn deliver(autonomous: bool, server: &WeakServer, name: &str, caller: &TickerCaller) -> bool {
    if autonomous {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| caller())) {
            error!(
                timer = %name,
                fault = ?payload.downcast_ref::<&str>(),
                "timer callback panicked"
            );
        }
        return true;
    }

    let Some(server) = server.upgrade() else {
        return false;
    };
    if let Err(e) = server
        .push_message(MessageType::Ticker, vec![MessageAttr::Caller(caller.clone())])
        .await
    {
        warn!(timer = %name, error = %e, "timer firing dropped");
    }
    true
}
