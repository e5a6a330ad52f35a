//! Async driver: runs a `SessionEngine` against a `Transport`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::net::protocol::{EntityId, OutboundMsg, PeerId};
use crate::net::transport::Transport;
use crate::util::time::MonotonicClock;

use super::engine::{LocalSimulation, SessionEngine, SessionView};
use super::interaction::LocalVitals;

/// Longest wait between frames, whatever the scheduler asks for
const MAX_FRAME_DELAY_MS: f64 = 1000.0;

/// Local intents sent into a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    RequestPause(String),
    ReleasePause(String),
    Hit { target_id: EntityId, amount: f64 },
    Stun { target_id: EntityId, duration_sec: f64 },
    Vitals(LocalVitals),
    Shutdown,
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub peer_id: PeerId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    /// Queue a command; false once the session has stopped
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn request_pause(&self, reason: &str) -> bool {
        self.send(SessionCommand::RequestPause(reason.to_string()))
    }

    pub fn release_pause(&self, reason: &str) -> bool {
        self.send(SessionCommand::ReleasePause(reason.to_string()))
    }

    pub fn shutdown(&self) -> bool {
        self.send(SessionCommand::Shutdown)
    }

    /// Latest published view
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Subscribe to view updates
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }
}

/// One peer's session task
pub struct SessionRunner<T, S> {
    engine: SessionEngine,
    transport: Arc<T>,
    simulation: S,
    clock: Arc<dyn MonotonicClock>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    view_tx: watch::Sender<SessionView>,
}

impl<T, S> SessionRunner<T, S>
where
    T: Transport,
    S: LocalSimulation,
{
    /// Create a runner and its handle
    pub fn new(
        engine: SessionEngine,
        transport: Arc<T>,
        simulation: S,
        clock: Arc<dyn MonotonicClock>,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SessionView::empty(engine.local_id().clone()));

        let handle = SessionHandle {
            peer_id: engine.local_id().clone(),
            commands: commands_tx,
            view: view_rx,
        };
        let runner = Self {
            engine,
            transport,
            simulation,
            clock,
            commands_rx,
            view_tx,
        };
        (runner, handle)
    }

    /// Run until shutdown, the command handle is dropped, or the transport closes
    pub async fn run(mut self) {
        let peer_id = self.engine.local_id().clone();
        info!(peer_id = %peer_id, "Session started");

        let mut inbound = self.transport.subscribe();
        let outbound_tx = spawn_publisher(self.transport.clone(), peer_id.clone());
        let mut next_frame = Instant::now();

        loop {
            tokio::select! {
                _ = sleep_until(next_frame) => {
                    let now = self.clock.now_ms();
                    let report = self.engine.frame(now, &mut self.simulation);
                    for msg in self.engine.drain_outbound() {
                        let _ = outbound_tx.send(msg);
                    }
                    self.view_tx.send_replace(self.engine.view(now));
                    next_frame = Instant::now() + frame_delay(report.next_delay_ms);
                }
                received = inbound.recv() => match received {
                    Ok(msg) => {
                        let now = self.clock.now_ms();
                        self.engine.handle_inbound(msg, now);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(peer_id = %peer_id, lagged_count = n, "Session lagged, skipping {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(peer_id = %peer_id, "Inbound channel closed");
                        break;
                    }
                },
                command = self.commands_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.apply_command(command),
                },
            }
        }

        let now = self.clock.now_ms();
        self.engine.release_all_pauses();
        for msg in self.engine.drain_outbound() {
            let _ = outbound_tx.send(msg);
        }
        self.engine.teardown(now);
        self.view_tx.send_replace(self.engine.view(now));
        info!(peer_id = %peer_id, "Session stopped");
    }

    fn apply_command(&mut self, command: SessionCommand) {
        let now = self.clock.now_ms();
        match command {
            SessionCommand::RequestPause(reason) => self.engine.request_pause(&reason, now),
            SessionCommand::ReleasePause(reason) => self.engine.release_pause(&reason),
            SessionCommand::Hit { target_id, amount } => self.engine.record_hit(target_id, amount),
            SessionCommand::Stun {
                target_id,
                duration_sec,
            } => self.engine.record_stun(target_id, duration_sec, now),
            SessionCommand::Vitals(vitals) => self.engine.set_vitals(vitals),
            SessionCommand::Shutdown => {}
        }
    }
}

/// Clamp a requested frame delay to something `sleep_until` can take
fn frame_delay(delay_ms: f64) -> Duration {
    let clamped = if delay_ms.is_finite() {
        delay_ms.clamp(1.0, MAX_FRAME_DELAY_MS)
    } else {
        MAX_FRAME_DELAY_MS
    };
    Duration::from_secs_f64(clamped / 1000.0)
}

/// Publishes outbound messages in emission order without blocking the session
fn spawn_publisher<T: Transport>(transport: Arc<T>, peer_id: PeerId) -> mpsc::UnboundedSender<OutboundMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMsg>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let kind = msg.kind_name();
            if let Err(e) = transport.publish(msg).await {
                debug!(peer_id = %peer_id, kind, error = %e, "Publish failed");
            }
        }
    });
    tx
}
