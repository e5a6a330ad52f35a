//! Party session demo
//!
//! Runs a handful of peers against an in-process relay and a scripted
//! authority. Peers open and close menus, report hits and positions, and
//! the shared pause gate, clock and world state can be followed in the logs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use party_session::config::Config;
use party_session::net::protocol::{EntityId, EntityKind, InboundMsg, OutboundMsg, PeerId, RawRecord};
use party_session::net::transport::LoopbackHub;
use party_session::session::{
    EntityIntegrator, LocalVitals, SessionCommand, SessionEngine, SessionHandle, SessionRunner,
};
use party_session::util::time::{unix_millis, SystemClock};

/// Authority snapshot cadence
const AUTHORITY_TICK_MS: u64 = 100;
/// Enemies the scripted authority keeps alive
const ENEMY_POOL: usize = 8;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    info!(peers = config.demo_peers, duration_secs = config.demo_duration_secs, "Starting party session demo");

    let (hub, authority_rx) = LoopbackHub::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(config.demo_peers);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for _ in 0..config.demo_peers {
        let engine = SessionEngine::new(PeerId::random(), config.engine.clone());
        let (runner, handle) = SessionRunner::new(
            engine,
            Arc::new(hub.connect()),
            EntityIntegrator,
            Arc::new(SystemClock::new()),
        );
        tasks.push(tokio::spawn(runner.run()));
        handles.push(handle);
    }

    let authority = DemoAuthority::new(hub.clone(), authority_rx, config.demo_peers);
    let authority_task = tokio::spawn(authority.run(stop_rx.clone()));

    let players_task = tokio::spawn(drive_players(handles.clone(), stop_rx));

    let run_for = async {
        if config.demo_duration_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(config.demo_duration_secs)).await;
        }
    };
    tokio::select! {
        _ = run_for => info!("Demo duration elapsed"),
        _ = shutdown_signal() => {}
    }

    let _ = stop_tx.send(true);
    let _ = players_task.await;

    for handle in &handles {
        let view = handle.view();
        info!(
            peer_id = %view.local_id,
            gated = view.gated,
            elapsed_secs = view.elapsed_secs,
            clock_offset_ms = ?view.clock_offset_ms,
            enemies = view.entity_counts.get(&EntityKind::Enemies).copied().unwrap_or(0),
            snapshots = view.stats.snapshots_applied,
            forced_resumes = view.pause_stats.forced_resumes,
            "Peer summary"
        );
        handle.shutdown();
    }
    for task in tasks {
        let _ = task.await;
    }
    let _ = authority_task.await;

    info!("Demo shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}

/// Scripted stand-in for the match authority
struct DemoAuthority {
    hub: LoopbackHub,
    inbox: mpsc::UnboundedReceiver<OutboundMsg>,
    party_size: usize,
    rng: StdRng,
    enemies: BTreeMap<u64, DemoEnemy>,
    next_enemy: u64,
    received: BTreeMap<&'static str, u64>,
}

struct DemoEnemy {
    x: f64,
    y: f64,
    hp: f64,
    boss: bool,
}

impl DemoAuthority {
    fn new(hub: LoopbackHub, inbox: mpsc::UnboundedReceiver<OutboundMsg>, party_size: usize) -> Self {
        Self {
            hub,
            inbox,
            party_size,
            rng: StdRng::from_entropy(),
            enemies: BTreeMap::new(),
            next_enemy: 0,
            received: BTreeMap::new(),
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let start = unix_millis() as f64;
        self.hub.broadcast(InboundMsg::MatchStart {
            server_start_time_ms: start,
            party_size: Some(self.party_size),
        });

        let mut tick = tokio::time::interval(Duration::from_millis(AUTHORITY_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => self.step(),
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.receive(msg),
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
        info!(received = ?self.received, "Authority stopped");
    }

    fn step(&mut self) {
        self.hub.broadcast(InboundMsg::ClockSample {
            server_time_ms: unix_millis() as f64,
        });

        while self.enemies.len() < ENEMY_POOL {
            let id = self.next_enemy;
            self.next_enemy += 1;
            let boss = id % 10 == 9;
            self.enemies.insert(
                id,
                DemoEnemy {
                    x: self.rng.gen_range(0.0..800.0),
                    y: self.rng.gen_range(0.0..600.0),
                    hp: if boss { 400.0 } else { 40.0 },
                    boss,
                },
            );
        }

        let records = self
            .enemies
            .iter_mut()
            .map(|(id, enemy)| {
                enemy.x += self.rng.gen_range(-4.0..4.0);
                enemy.y += self.rng.gen_range(-4.0..4.0);
                RawRecord {
                    id: Some(EntityId::from(*id)),
                    type_name: Some(if enemy.boss { "warden" } else { "slime" }.to_string()),
                    x: Some(enemy.x),
                    y: Some(enemy.y),
                    r: Some(if enemy.boss { 32.0 } else { 12.0 }),
                    hp: Some(enemy.hp),
                    boss: Some(enemy.boss),
                    ..RawRecord::default()
                }
            })
            .collect();
        self.hub.broadcast(InboundMsg::EntitySnapshot {
            kind: EntityKind::Enemies,
            records: Some(records),
        });
    }

    fn receive(&mut self, msg: OutboundMsg) {
        *self.received.entry(msg.kind_name()).or_insert(0) += 1;
        if let OutboundMsg::Hits { hits, .. } = msg {
            for hit in hits {
                let Ok(id) = hit.target_id.as_str().parse::<u64>() else {
                    continue;
                };
                let Some(enemy) = self.enemies.get_mut(&id) else {
                    continue;
                };
                enemy.hp -= hit.amount;
                if enemy.hp <= 0.0 {
                    if let Some(dead) = self.enemies.remove(&id) {
                        debug!(id, "Enemy killed");
                        self.hub.broadcast(InboundMsg::EntityDeath {
                            id: EntityId::from(id),
                            x: dead.x,
                            y: dead.y,
                            is_boss: dead.boss,
                        });
                    }
                }
            }
        }
    }
}

/// Simulated players: hit enemies, move around, and occasionally open a menu
async fn drive_players(handles: Vec<SessionHandle>, mut stop: watch::Receiver<bool>) {
    let mut rng = StdRng::from_entropy();
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    let mut menu_open: Option<(usize, u32)> = None;
    let mut positions: Vec<(f64, f64)> = vec![(400.0, 300.0); handles.len()];

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => break,
        }

        for (i, handle) in handles.iter().enumerate() {
            if handle.view().gated {
                continue;
            }
            let (x, y) = &mut positions[i];
            *x += rng.gen_range(-3.0..3.0);
            *y += rng.gen_range(-3.0..3.0);
            handle.send(SessionCommand::Vitals(LocalVitals {
                x: *x,
                y: *y,
                hp: 100.0,
                max_hp: 100.0,
            }));
            if rng.gen_bool(0.3) {
                let target = rng.gen_range(0..ENEMY_POOL as u64 * 2);
                handle.send(SessionCommand::Hit {
                    target_id: EntityId::from(target),
                    amount: rng.gen_range(2.0..8.0),
                });
            }
        }

        menu_open = match menu_open {
            Some((peer, 0)) => {
                handles[peer].release_pause("menu");
                info!(peer_id = %handles[peer].peer_id, "Menu closed");
                None
            }
            Some((peer, left)) => Some((peer, left - 1)),
            None if rng.gen_bool(0.01) => {
                let peer = rng.gen_range(0..handles.len());
                handles[peer].request_pause("menu");
                info!(peer_id = %handles[peer].peer_id, "Menu opened");
                Some((peer, rng.gen_range(20..60)))
            }
            None => None,
        };
    }

    if let Some((peer, _)) = menu_open {
        handles[peer].release_pause("menu");
    }
}
