//! Connection state machine: one logical upstream watch for one target.
//!
//! Transitions live in [`State::step`], a pure function from a state and a
//! [`Signal`] to the next state and an [`Action`]. The async driver in
//! [`spawn`] only performs I/O and feeds the results back in, so every
//! transition is testable without an API server.
//!
//! ```text
//! Connect ──Opened──▶ Running ──Closed──▶ ServerSideClosure ──Resume──▶ Connect
//!    │                  │
//!    │                  └─ERROR event──▶ Connect (bookmark dropped, fixed pause)
//!    └─OpenFailed × N──▶ ServerSideError
//! any ──Cancel──▶ ClientSideCancel
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::counter;
use tether_core::{ChangeEvent, EventType, WatchConfig, WatchTarget};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::source::{EventStream, WatchRequest, WatchSource};

/// What to wait for before the next open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Immediate,
    /// The fixed error pause.
    Fixed,
    /// Next step of the jittered exponential backoff.
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Connect { bookmark: Option<String>, attempt: u32, delay: Delay },
    Running { bookmark: Option<String> },
    ServerSideClosure { bookmark: Option<String> },
    ServerSideError,
    ClientSideCancel,
}

#[derive(Debug)]
pub enum Signal {
    Opened,
    OpenFailed(String),
    Event(ChangeEvent),
    /// The stream ended without an ERROR event.
    Closed,
    Resume,
    Cancel,
}

#[derive(Debug)]
pub enum Action {
    Wait,
    /// A watch was (re)established.
    Announce { resumed: bool },
    Relay(ChangeEvent),
    /// Emit one terminal ERROR downstream.
    Terminate(String),
    Stop,
}

impl State {
    pub fn initial() -> Self {
        State::Connect { bookmark: None, attempt: 0, delay: Delay::Immediate }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::ServerSideError | State::ClientSideCancel)
    }

    pub fn step(self, signal: Signal, max_attempts: u32) -> (State, Action) {
        match (self, signal) {
            (state, _) if state.is_terminal() => (state, Action::Stop),
            (_, Signal::Cancel) => (State::ClientSideCancel, Action::Stop),
            (State::Connect { bookmark, .. }, Signal::Opened) => {
                let resumed = bookmark.is_some();
                (State::Running { bookmark }, Action::Announce { resumed })
            }
            (State::Connect { bookmark, attempt, .. }, Signal::OpenFailed(reason)) => {
                let attempt = attempt.saturating_add(1);
                if attempt >= max_attempts {
                    (State::ServerSideError, Action::Terminate(reason))
                } else {
                    (State::Connect { bookmark, attempt, delay: Delay::Backoff }, Action::Wait)
                }
            }
            (State::Running { bookmark }, Signal::Event(ev)) => match ev.event_type {
                // The server rejected our position (e.g. 410 Gone): start over from a full list.
                EventType::Error => (State::Connect { bookmark: None, attempt: 0, delay: Delay::Fixed }, Action::Wait),
                _ => {
                    let bookmark = if ev.resource_version.is_empty() { bookmark } else { Some(ev.resource_version.clone()) };
                    (State::Running { bookmark }, Action::Relay(ev))
                }
            },
            (State::Running { bookmark }, Signal::Closed) => (State::ServerSideClosure { bookmark }, Action::Wait),
            (State::ServerSideClosure { bookmark }, Signal::Resume) => {
                (State::Connect { bookmark, attempt: 0, delay: Delay::Immediate }, Action::Wait)
            }
            (state, _) => (state, Action::Wait),
        }
    }
}

/// Items on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum WatchItem {
    /// A new upstream session began. `resumed` is false when the server
    /// replays current state (full resync).
    Opened { resumed: bool },
    Event(ChangeEvent),
}

/// Start a connection task. It runs until `token` is cancelled, the receiver
/// is dropped, or the upstream cannot be re-established.
pub fn spawn(
    source: Arc<dyn WatchSource>,
    target: WatchTarget,
    label_selector: Option<String>,
    cfg: WatchConfig,
    token: CancellationToken,
) -> mpsc::Receiver<WatchItem> {
    let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
    tokio::spawn(run(source, target, label_selector, cfg, token, tx));
    rx
}

async fn open_after(
    source: &dyn WatchSource,
    target: &WatchTarget,
    request: &WatchRequest,
    pause: Duration,
) -> anyhow::Result<EventStream> {
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
    source.open(target, request).await
}

async fn run(
    source: Arc<dyn WatchSource>,
    target: WatchTarget,
    label_selector: Option<String>,
    cfg: WatchConfig,
    token: CancellationToken,
    tx: mpsc::Sender<WatchItem>,
) {
    let t0 = Instant::now();
    let gvk = target.gvk.clone();
    let mut state = State::initial();
    let mut backoff = Backoff::new(cfg.backoff_base, cfg.backoff_max);
    let mut stream: Option<EventStream> = None;
    let mut relayed = 0u64;
    info!(target = %target, selector = ?label_selector, "connection started");

    while !state.is_terminal() {
        let signal = match &state {
            State::Connect { bookmark, attempt, delay } => {
                stream = None;
                let pause = match delay {
                    Delay::Immediate => Duration::ZERO,
                    Delay::Fixed => cfg.error_backoff,
                    Delay::Backoff => backoff.next_delay(),
                };
                let request = WatchRequest {
                    timeout_secs: Some(cfg.server_timeout_secs),
                    ..WatchRequest::new(label_selector.clone(), bookmark.clone())
                };
                debug!(target = %target, rv = ?bookmark, attempt, pause_ms = %pause.as_millis(), "opening watch");
                tokio::select! {
                    _ = token.cancelled() => Signal::Cancel,
                    res = open_after(source.as_ref(), &target, &request, pause) => match res {
                        Ok(s) => {
                            stream = Some(s);
                            Signal::Opened
                        }
                        Err(e) => {
                            warn!(target = %target, attempt, error = %format!("{:#}", e), "opening watch failed");
                            Signal::OpenFailed(format!("{:#}", e))
                        }
                    }
                }
            }
            State::Running { .. } => match stream.as_mut() {
                None => Signal::Closed,
                Some(s) => tokio::select! {
                    _ = token.cancelled() => Signal::Cancel,
                    next = s.next() => match next {
                        Some(Ok(ev)) => {
                            if ev.event_type == EventType::Error {
                                warn!(target = %target, message = ?ev.message, "upstream error; dropping bookmark for full resync");
                                counter!("tether_watch_resyncs_total", 1, "gvk" => gvk.clone());
                            }
                            Signal::Event(ev)
                        }
                        Some(Err(e)) => {
                            // Transport hiccup: resume from the bookmark. A stale
                            // bookmark comes back as an ERROR event on the next session.
                            warn!(target = %target, error = %format!("{:#}", e), "watch stream failed");
                            Signal::Closed
                        }
                        None => Signal::Closed,
                    }
                },
            },
            State::ServerSideClosure { bookmark } => {
                debug!(target = %target, rv = ?bookmark, "watch stream closed by server");
                stream = None;
                Signal::Resume
            }
            State::ServerSideError | State::ClientSideCancel => break,
        };

        let (next, action) = state.step(signal, cfg.connect_attempts);
        state = next;
        let item = match action {
            Action::Wait | Action::Stop => None,
            Action::Announce { resumed } => {
                backoff.reset();
                counter!("tether_watch_sessions_total", 1, "gvk" => gvk.clone());
                info!(target = %target, resumed, "watch established");
                Some(WatchItem::Opened { resumed })
            }
            Action::Relay(ev) => {
                relayed += 1;
                Some(WatchItem::Event(ev))
            }
            Action::Terminate(reason) => {
                error!(target = %target, reason = %reason, "watch cannot be re-established; giving up");
                counter!("tether_watch_terminal_errors_total", 1, "gvk" => gvk.clone());
                Some(WatchItem::Event(ChangeEvent::error(reason)))
            }
        };
        if let Some(item) = item {
            tokio::select! {
                _ = token.cancelled() => state = State::ClientSideCancel,
                sent = tx.send(item) => if sent.is_err() {
                    debug!(target = %target, "downstream dropped; stopping");
                    state = State::ClientSideCancel;
                },
            }
        }
    }
    info!(target = %target, state = ?state, relayed, ran_ms = %t0.elapsed().as_millis(), "connection stopped");
}
