use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Parameters
/// - `header`: header string from the client (for example "10000,10000").
///   The values represent milliseconds.
///
/// Returns a tuple `(cx, cy)` where each value is the heartbeat interval in
/// milliseconds. Missing or invalid fields default to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiate the server's heartbeat intervals from the client's request.
///
/// Parameters
/// - `client_send`: how often the client offers to send heartbeats (`cx`).
/// - `client_receive`: how often the client wants to receive them (`cy`).
/// - `minimum`: the smallest interval the server accepts, in milliseconds.
///
/// Returns `(read_ms, write_ms)` for the server. A zero request stays zero
/// (that direction is disabled); anything else is raised to `minimum`.
pub fn negotiate_heartbeats(client_send: u64, client_receive: u64, minimum: u64) -> (u64, u64) {
    let clamp = |requested: u64| {
        if requested == 0 {
            0
        } else {
            requested.max(minimum)
        }
    };
    (clamp(client_send), clamp(client_receive))
}

/// Callbacks fired by a [`HeartBeatMonitor`].
#[async_trait]
pub trait HeartBeatHandler: Send + Sync {
    /// The send interval elapsed without outbound traffic.
    async fn send_heartbeat(&self);

    /// Nothing was read within 1.5x the read interval.
    async fn read_timeout(&self);
}

struct Timer {
    reset: Arc<Notify>,
    handle: JoinHandle<()>,
}

#[derive(Clone, Copy)]
enum Action {
    Send,
    Read,
}

impl Timer {
    fn spawn(interval: Duration, action: Action, handler: Arc<dyn HeartBeatHandler>) -> Self {
        let reset = Arc::new(Notify::new());
        let notified = reset.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => match action {
                        Action::Send => handler.send_heartbeat().await,
                        Action::Read => {
                            handler.read_timeout().await;
                            break;
                        }
                    },
                    _ = notified.notified() => {}
                }
            }
        });
        Self { reset, handle }
    }
}

#[derive(Default)]
struct Timers {
    read: Option<Timer>,
    send: Option<Timer>,
}

/// Per-connection liveness: a send timer emitting heartbeats and a read
/// timer declaring the peer dead.
///
/// Both timers restart whenever traffic flows in their direction. `close`
/// must run once per connection teardown; further calls do nothing.
pub struct HeartBeatMonitor {
    handler: Arc<dyn HeartBeatHandler>,
    timers: OnceLock<Timers>,
    closed: AtomicBool,
}

impl HeartBeatMonitor {
    pub fn new(handler: Arc<dyn HeartBeatHandler>) -> Self {
        Self {
            handler,
            timers: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Arm the timers. A zero interval leaves that timer off.
    pub fn start(&self, read_ms: u64, write_ms: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let timers = Timers {
            read: (read_ms > 0).then(|| {
                Timer::spawn(
                    Duration::from_millis(read_ms) * 3 / 2,
                    Action::Read,
                    self.handler.clone(),
                )
            }),
            send: (write_ms > 0).then(|| {
                Timer::spawn(
                    Duration::from_millis(write_ms),
                    Action::Send,
                    self.handler.clone(),
                )
            }),
        };
        if let Err(timers) = self.timers.set(timers) {
            warn!("heartbeat monitor already started");
            for t in [timers.read, timers.send].into_iter().flatten() {
                t.handle.abort();
            }
            return;
        }
        debug!(read_ms, write_ms, "heartbeat monitor started");
    }

    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.timers.get().is_some()
    }

    /// Inbound traffic: postpone the read deadline.
    pub fn reset_read(&self) {
        if let Some(t) = self.timers.get().and_then(|t| t.read.as_ref()) {
            t.reset.notify_one();
        }
    }

    /// Outbound traffic: postpone the next heartbeat.
    pub fn reset_send(&self) {
        if let Some(t) = self.timers.get().and_then(|t| t.send.as_ref()) {
            t.reset.notify_one();
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timers) = self.timers.get() {
            for t in [&timers.read, &timers.send].into_iter().flatten() {
                t.handle.abort();
            }
        }
    }
}

impl Drop for HeartBeatMonitor {
    fn drop(&mut self) {
        self.close();
    }
}
