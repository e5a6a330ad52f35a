//! Session engine: owns every coordination component and runs the frame pipeline

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::net::protocol::{EntityId, EntityKind, InboundMsg, OutboundMsg, PeerId};
use crate::util::time::Cadence;

use super::clock::{ClockSynchronizer, MatchClock};
use super::entity::{EntityOrigin, Vec2};
use super::interaction::{InteractionBatcher, LocalVitals, VitalsReporter};
use super::pause::{PauseCoordinator, PauseStats, PauseTransition};
use super::scheduler::{SchedulerState, SimulationScheduler};
use super::snapshot::{ApplyReport, DeathOutcome, SnapshotReconciler};

/// How often stale remote pauses are swept
const CLEANUP_INTERVAL_MS: f64 = 1000.0;

/// UI query consulted by the self-echo guard
pub trait ModalQuery: Send {
    fn has_blocking_modal_open(&self) -> bool;
}

impl<F> ModalQuery for F
where
    F: Fn() -> bool + Send,
{
    fn has_blocking_modal_open(&self) -> bool {
        self()
    }
}

/// No UI attached
pub struct NoModal;

impl ModalQuery for NoModal {
    fn has_blocking_modal_open(&self) -> bool {
        false
    }
}

/// Mutable access handed to the local simulation for one slice
pub struct StepContext<'a> {
    pub dt: f64,
    pub now_ms: f64,
    /// Non-player entities must not advance while true
    pub frozen: bool,
    pub world: &'a mut SnapshotReconciler,
    pub interactions: &'a mut InteractionBatcher,
    pub vitals: &'a mut VitalsReporter,
}

/// The peer's own real-time simulation, stepped by the scheduler
pub trait LocalSimulation: Send {
    fn step(&mut self, ctx: &mut StepContext<'_>);
}

/// Minimal simulation: advances bullets and hazard timers between snapshots
#[derive(Debug, Default)]
pub struct EntityIntegrator;

impl LocalSimulation for EntityIntegrator {
    fn step(&mut self, ctx: &mut StepContext<'_>) {
        if ctx.frozen {
            return;
        }
        for kind in [EntityKind::Bullets, EntityKind::Hazards] {
            for entity in ctx.world.arena_mut(kind).iter_mut() {
                entity.integrate(ctx.dt);
            }
        }
    }
}

/// Session-wide diagnostic counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub inbound: u64,
    pub snapshots_applied: u64,
    pub entities_created: u64,
    pub entities_removed: u64,
    pub records_dropped: u64,
    pub field_fallbacks: u64,
    pub deaths_applied: u64,
    pub duplicate_deaths: u64,
    pub frames: u64,
    pub steps: u64,
    pub catchup_dropped_secs: f64,
    pub resyncs: u64,
}

impl SessionStats {
    fn record_snapshot(&mut self, report: &ApplyReport) {
        self.snapshots_applied += 1;
        self.entities_created += report.created as u64;
        self.entities_removed += report.removed as u64;
        self.records_dropped += report.dropped as u64;
        self.field_fallbacks += report.fallbacks as u64;
    }
}

/// Read-only picture of the session for UI and diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub local_id: PeerId,
    pub gated: bool,
    pub paused_peers: Vec<PeerId>,
    pub scheduler_state: SchedulerState,
    pub elapsed_secs: f64,
    pub clock_offset_ms: Option<f64>,
    pub frozen: bool,
    pub freeze_remaining_ms: f64,
    pub party_size: usize,
    pub entity_counts: BTreeMap<EntityKind, usize>,
    pub stats: SessionStats,
    pub pause_stats: PauseStats,
}

impl SessionView {
    pub fn empty(local_id: PeerId) -> Self {
        Self {
            local_id,
            gated: false,
            paused_peers: Vec::new(),
            scheduler_state: SchedulerState::Idle,
            elapsed_secs: 0.0,
            clock_offset_ms: None,
            frozen: false,
            freeze_remaining_ms: 0.0,
            party_size: 1,
            entity_counts: BTreeMap::new(),
            stats: SessionStats::default(),
            pause_stats: PauseStats::default(),
        }
    }
}

/// Summary of one `frame` call
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub state: SchedulerState,
    pub steps: usize,
    pub next_delay_ms: f64,
    pub elapsed_secs: f64,
    pub resumed: bool,
}

/// One peer's coordination engine. Single owner, no interior locking: all
/// mutation happens in `handle_inbound`, the local intent methods and `frame`.
pub struct SessionEngine {
    config: EngineConfig,
    local_id: PeerId,
    pause: PauseCoordinator,
    clock: ClockSynchronizer,
    match_clock: MatchClock,
    scheduler: SimulationScheduler,
    reconciler: SnapshotReconciler,
    interactions: InteractionBatcher,
    vitals: VitalsReporter,
    modal: Box<dyn ModalQuery>,
    party_size: Option<usize>,
    outbound: Vec<OutboundMsg>,
    cleanup: Cadence,
    elapsed_secs: f64,
    stats: SessionStats,
}

impl SessionEngine {
    pub fn new(local_id: PeerId, config: EngineConfig) -> Self {
        let pause = PauseCoordinator::new(local_id.clone(), &config);
        Self::with_coordinator(pause, config)
    }

    /// Build around an existing coordinator (custom token seed)
    pub fn with_coordinator(pause: PauseCoordinator, config: EngineConfig) -> Self {
        Self {
            local_id: pause.local_id().clone(),
            pause,
            clock: ClockSynchronizer::new(config.clock_alpha),
            match_clock: MatchClock::new(),
            scheduler: SimulationScheduler::new(&config),
            reconciler: SnapshotReconciler::new(config.death_memory),
            interactions: InteractionBatcher::new(&config),
            vitals: VitalsReporter::new(&config),
            modal: Box::new(NoModal),
            party_size: None,
            outbound: Vec::new(),
            cleanup: Cadence::new(CLEANUP_INTERVAL_MS),
            elapsed_secs: 0.0,
            stats: SessionStats::default(),
            config,
        }
    }

    pub fn with_modal_query(mut self, modal: impl ModalQuery + 'static) -> Self {
        self.modal = Box::new(modal);
        self
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_gated(&self) -> bool {
        self.pause.is_gated()
    }

    pub fn pause(&self) -> &PauseCoordinator {
        &self.pause
    }

    pub fn clock(&self) -> &ClockSynchronizer {
        &self.clock
    }

    pub fn world(&self) -> &SnapshotReconciler {
        &self.reconciler
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Party size from `match_start`, else the number of peers seen
    pub fn party_size(&self) -> usize {
        self.party_size
            .unwrap_or_else(|| self.pause.known_peers())
            .max(1)
    }

    /// Dispatch one inbound message to its component
    pub fn handle_inbound(&mut self, msg: InboundMsg, now_ms: f64) -> PauseTransition {
        self.stats.inbound += 1;
        debug!(kind = msg.kind_name(), "Inbound message");
        match msg {
            InboundMsg::Pause {
                peer_id,
                alias_id,
                token,
            } => {
                let modal_open = self.modal.has_blocking_modal_open();
                let (outcome, forced) =
                    self.pause
                        .handle_pause(&peer_id, alias_id.as_ref(), token, now_ms, modal_open);
                self.outbound.extend(forced);
                outcome.transition()
            }
            InboundMsg::Resume {
                peer_id,
                alias_id,
                token,
            } => self
                .pause
                .clear_pause(&peer_id, alias_id.as_ref(), token)
                .transition(),
            InboundMsg::ClockSample { server_time_ms } => {
                self.clock.sample(server_time_ms, now_ms);
                PauseTransition::Unchanged
            }
            InboundMsg::MatchStart {
                server_start_time_ms,
                party_size,
            } => {
                if party_size.is_some() {
                    self.party_size = party_size;
                }
                if self.match_clock.set_origin(server_start_time_ms) {
                    self.resync(now_ms);
                }
                info!(server_start_time_ms, party_size = self.party_size(), "Match started");
                PauseTransition::Unchanged
            }
            InboundMsg::EntitySnapshot { kind, records } => {
                let report = self.reconciler.apply_snapshot(kind, records.as_deref());
                self.stats.record_snapshot(&report);
                PauseTransition::Unchanged
            }
            InboundMsg::EntityDeath { id, x, y, is_boss } => {
                match self.reconciler.apply_death(&id, Vec2::new(x, y), is_boss) {
                    DeathOutcome::Removed { .. } | DeathOutcome::Unknown => self.stats.deaths_applied += 1,
                    DeathOutcome::Duplicate => self.stats.duplicate_deaths += 1,
                }
                PauseTransition::Unchanged
            }
        }
    }

    /// Open a local reason to pause (menu, shop, ...)
    pub fn request_pause(&mut self, reason: &str, now_ms: f64) {
        if let Some(msg) = self.pause.request_local_pause(reason, now_ms) {
            self.outbound.push(msg);
        }
    }

    pub fn release_pause(&mut self, reason: &str) {
        if let Some(msg) = self.pause.release_local_pause(reason) {
            self.outbound.push(msg);
        }
    }

    /// Drop every local reason; announces one resume if any was held
    pub fn release_all_pauses(&mut self) {
        let reasons: Vec<String> = self.pause.local_reasons().map(str::to_string).collect();
        for reason in reasons {
            self.release_pause(&reason);
        }
    }

    pub fn record_hit(&mut self, target_id: EntityId, amount: f64) {
        self.interactions.record(target_id, amount);
    }

    pub fn record_stun(&mut self, target_id: EntityId, duration_sec: f64, now_ms: f64) {
        if let Some(entity) = self.reconciler.arena_mut(EntityKind::Enemies).get_mut(&target_id) {
            let until = now_ms + duration_sec * 1000.0;
            entity.local.stun_until_ms = Some(entity.local.stun_until_ms.map_or(until, |u| u.max(until)));
        }
        self.interactions.record_stun(target_id, duration_sec, now_ms);
    }

    pub fn set_vitals(&mut self, vitals: LocalVitals) {
        self.vitals.update(vitals);
    }

    /// Run one scheduler invocation: housekeeping, gated check, bounded
    /// catch-up steps, then due flushes.
    pub fn frame(&mut self, now_ms: f64, simulation: &mut dyn LocalSimulation) -> FrameReport {
        self.stats.frames += 1;

        if self.cleanup.poll(now_ms) {
            self.pause.cleanup_stale(now_ms);
        }
        if let Some(msg) = self.pause.heartbeat(now_ms) {
            self.outbound.push(msg);
        }

        let plan = self
            .scheduler
            .tick(now_ms, self.pause.is_gated(), self.party_size());
        self.stats.steps += plan.steps.len() as u64;
        self.stats.catchup_dropped_secs += plan.dropped_secs;

        let frozen = self.scheduler.is_frozen(now_ms);
        for &dt in &plan.steps {
            self.match_clock.advance_local(dt);
            let mut ctx = StepContext {
                dt,
                now_ms,
                frozen,
                world: &mut self.reconciler,
                interactions: &mut self.interactions,
                vitals: &mut self.vitals,
            };
            simulation.step(&mut ctx);
        }
        self.elapsed_secs = self.match_clock.elapsed_secs(&self.clock, now_ms);

        let flushed = self.interactions.flush_due(now_ms, &self.local_id);
        self.outbound.extend(flushed);
        if let Some(msg) = self.vitals.poll(now_ms, &self.local_id) {
            self.outbound.push(msg);
        }

        FrameReport {
            state: plan.state,
            steps: plan.steps.len(),
            next_delay_ms: plan.next_delay_ms,
            elapsed_secs: self.elapsed_secs,
            resumed: plan.resumed,
        }
    }

    /// Take queued outbound messages in emission order
    pub fn drain_outbound(&mut self) -> Vec<OutboundMsg> {
        std::mem::take(&mut self.outbound)
    }

    /// Clear all shared state for a new match or reconnect
    pub fn resync(&mut self, now_ms: f64) {
        self.stats.resyncs += 1;
        info!(peer_id = %self.local_id, "Resyncing session state");
        self.reconciler.clear();
        self.interactions.clear();
        self.scheduler.reset();
        self.elapsed_secs = 0.0;
        if let Some(msg) = self.pause.reset(now_ms) {
            self.outbound.push(msg);
        }
    }

    /// Tear the session down: forget everything including the match origin
    pub fn teardown(&mut self, now_ms: f64) {
        self.resync(now_ms);
        self.match_clock.reset();
        self.clock.reset();
        self.party_size = None;
    }

    pub fn view(&self, now_ms: f64) -> SessionView {
        let entity_counts = EntityKind::ALL
            .iter()
            .map(|kind| {
                let count = self
                    .reconciler
                    .arena(*kind)
                    .iter()
                    .filter(|e| e.origin == EntityOrigin::Authority)
                    .count();
                (*kind, count)
            })
            .collect();
        let estimate = self.clock.estimate();
        SessionView {
            local_id: self.local_id.clone(),
            gated: self.pause.is_gated(),
            paused_peers: self.pause.paused_peers(),
            scheduler_state: self.scheduler.state(),
            elapsed_secs: self.elapsed_secs,
            clock_offset_ms: estimate.smoothed.then_some(estimate.offset_ms),
            frozen: self.scheduler.is_frozen(now_ms),
            freeze_remaining_ms: self.scheduler.freeze_remaining_ms(now_ms),
            party_size: self.party_size(),
            entity_counts,
            stats: self.stats.clone(),
            pause_stats: self.pause.stats().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::RawRecord;
    use crate::session::pause::TokenMinter;

    struct CountingSim {
        steps: usize,
        frozen_steps: usize,
    }

    impl LocalSimulation for CountingSim {
        fn step(&mut self, ctx: &mut StepContext<'_>) {
            self.steps += 1;
            if ctx.frozen {
                self.frozen_steps += 1;
            }
        }
    }

    fn engine() -> SessionEngine {
        let config = EngineConfig::default();
        let pause = PauseCoordinator::with_minter(PeerId::from("me"), &config, TokenMinter::starting_at(0));
        SessionEngine::with_coordinator(pause, config)
    }

    fn sim() -> CountingSim {
        CountingSim {
            steps: 0,
            frozen_steps: 0,
        }
    }

    fn pause(peer: &str, token: u64) -> InboundMsg {
        InboundMsg::Pause {
            peer_id: PeerId::from(peer),
            alias_id: None,
            token: Some(token),
        }
    }

    fn resume(peer: &str, token: u64) -> InboundMsg {
        InboundMsg::Resume {
            peer_id: PeerId::from(peer),
            alias_id: None,
            token: Some(token),
        }
    }

    #[test]
    fn remote_pause_gates_stepping() {
        let mut e = engine();
        let mut s = sim();
        e.frame(0.0, &mut s);
        assert_eq!(e.handle_inbound(pause("a", 1), 10.0), PauseTransition::Paused);

        let report = e.frame(500.0, &mut s);
        assert_eq!(report.state, SchedulerState::Gated);
        assert_eq!(report.next_delay_ms, 33.0);
        assert_eq!(s.steps, 0);

        assert_eq!(e.handle_inbound(resume("a", 1), 600.0), PauseTransition::Resumed);
        let report = e.frame(650.0, &mut s);
        assert!(report.resumed);
        assert_eq!(s.steps, 2);
        // two peers known (me + a): 500ms freeze
        assert_eq!(s.frozen_steps, 2);
        assert!(e.view(1_149.0).frozen);
        assert_eq!(e.view(1_000.0).freeze_remaining_ms, 150.0);
        assert_eq!(e.view(2_000.0).freeze_remaining_ms, 0.0);
        assert!(!e.view(1_150.0).frozen);
    }

    #[test]
    fn local_pause_is_published_and_gates() {
        let mut e = engine();
        e.request_pause("menu", 0.0);
        assert!(e.is_gated());
        e.release_pause("menu");
        assert!(!e.is_gated());
        let kinds: Vec<_> = e.drain_outbound().iter().map(|m| m.kind_name()).collect();
        assert_eq!(kinds, vec!["pause", "resume"]);
        assert!(e.drain_outbound().is_empty());
    }

    #[test]
    fn stale_self_echo_emits_forced_resume() {
        let mut e = engine();
        e.handle_inbound(pause("me", 3), 1_000.0);
        assert!(!e.is_gated());
        assert!(matches!(
            e.drain_outbound().as_slice(),
            [OutboundMsg::Resume { forced: true, .. }]
        ));
    }

    #[test]
    fn open_modal_suppresses_the_echo_guard() {
        let mut e = engine().with_modal_query(|| true);
        e.handle_inbound(pause("me", 3), 1_000.0);
        assert!(e.is_gated());
        assert!(e.drain_outbound().is_empty());
    }

    #[test]
    fn elapsed_time_follows_authority_origin() {
        let mut e = engine();
        let mut s = sim();
        e.handle_inbound(InboundMsg::ClockSample { server_time_ms: 50_000.0 }, 0.0);
        e.handle_inbound(
            InboundMsg::MatchStart {
                server_start_time_ms: 40_000.0,
                party_size: Some(2),
            },
            0.0,
        );
        let report = e.frame(2_000.0, &mut s);
        assert!((report.elapsed_secs - 12.0).abs() < 1e-9);
        assert_eq!(e.party_size(), 2);
    }

    #[test]
    fn new_match_origin_resyncs_world() {
        let mut e = engine();
        e.handle_inbound(
            InboundMsg::MatchStart {
                server_start_time_ms: 1.0,
                party_size: None,
            },
            0.0,
        );
        let record = RawRecord {
            id: Some(EntityId::from("e")),
            x: Some(0.0),
            y: Some(0.0),
            r: Some(1.0),
            hp: Some(1.0),
            ..RawRecord::default()
        };
        e.handle_inbound(
            InboundMsg::EntitySnapshot {
                kind: EntityKind::Enemies,
                records: Some(vec![record]),
            },
            0.0,
        );
        e.handle_inbound(pause("a", 1), 0.0);
        assert_eq!(e.world().total_entities(), 1);

        e.handle_inbound(
            InboundMsg::MatchStart {
                server_start_time_ms: 2.0,
                party_size: None,
            },
            0.0,
        );
        assert_eq!(e.world().total_entities(), 0);
        assert!(!e.is_gated());
        assert_eq!(e.stats().resyncs, 1);
    }

    #[test]
    fn local_pause_holds_after_own_id_is_aliased() {
        let mut e = engine();
        let mut s = sim();
        e.handle_inbound(resume("pub", 1), 0.0);
        e.handle_inbound(
            InboundMsg::Resume {
                peer_id: PeerId::from("pub"),
                alias_id: Some(PeerId::from("me")),
                token: Some(2),
            },
            0.0,
        );
        e.request_pause("menu", 0.0);

        let mut pauses_sent = 0;
        let mut now = 0.0;
        while now < 30_000.0 {
            now += 16.0;
            e.frame(now, &mut s);
            pauses_sent += e
                .drain_outbound()
                .iter()
                .filter(|m| matches!(m, OutboundMsg::Pause { .. }))
                .count();
        }
        assert!(e.is_gated());
        assert!(pauses_sent >= 6);
        assert_eq!(e.view(now).pause_stats.stale_peers_dropped, 0);
    }

    #[test]
    fn hits_and_positions_flush_during_frames() {
        let mut e = engine();
        let mut s = sim();
        e.set_vitals(LocalVitals {
            x: 1.0,
            y: 1.0,
            hp: 10.0,
            max_hp: 10.0,
        });
        e.record_hit(EntityId::from("t"), 4.0);
        e.frame(0.0, &mut s);
        let kinds: Vec<_> = e.drain_outbound().iter().map(|m| m.kind_name()).collect();
        assert_eq!(kinds, vec!["hits", "pos"]);
    }

    #[test]
    fn duplicate_deaths_are_counted_separately() {
        let mut e = engine();
        let death = InboundMsg::EntityDeath {
            id: EntityId::from("boss"),
            x: 0.0,
            y: 0.0,
            is_boss: true,
        };
        e.handle_inbound(death.clone(), 0.0);
        e.handle_inbound(death, 0.0);
        assert_eq!(e.stats().deaths_applied, 1);
        assert_eq!(e.stats().duplicate_deaths, 1);
    }

    #[test]
    fn stale_remote_pause_is_swept_by_frames() {
        let mut e = engine();
        let mut s = sim();
        e.frame(0.0, &mut s);
        e.handle_inbound(pause("ghost", 1), 0.0);
        e.frame(10_000.0, &mut s);
        assert!(e.is_gated());
        e.frame(20_500.0, &mut s);
        assert!(!e.is_gated());
        assert_eq!(e.view(20_500.0).pause_stats.stale_peers_dropped, 1);
    }
}
