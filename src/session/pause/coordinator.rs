//! Token-ordered distributed pause gate

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::net::protocol::{OutboundMsg, PeerId};
use crate::util::rate_limit::SteppedLimiter;
use crate::util::time::Cadence;

use super::token_store::{PauseTokenStore, TokenMinter, TokenOp, TokenVerdict};

/// Effect of a pause-protocol event on the shared gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTransition {
    /// The gate closed
    Paused,
    /// The gate opened
    Resumed,
    Unchanged,
}

/// What happened to one pause/resume message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Applied(PauseTransition),
    /// Superseded by a newer token
    Stale,
    /// Untokenized message from a token-capable peer
    Downgrade,
    /// Pause naming the local peer with nothing to back it
    StaleEcho,
}

impl PauseOutcome {
    pub fn transition(self) -> PauseTransition {
        match self {
            Self::Applied(transition) => transition,
            _ => PauseTransition::Unchanged,
        }
    }
}

/// Diagnostic counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PauseStats {
    pub stale_dropped: u64,
    pub downgrades_dropped: u64,
    pub stale_peers_dropped: u64,
    pub echoes_suppressed: u64,
    pub forced_resumes: u64,
}

/// Shared pause gate: simulation is gated while any peer is in the pause set
pub struct PauseCoordinator {
    local_id: PeerId,
    store: PauseTokenStore,
    /// Paused peers and the time of their last refresh
    paused: HashMap<PeerId, f64>,
    local_reasons: BTreeSet<String>,
    minter: TokenMinter,
    echo_limiter: SteppedLimiter,
    heartbeat: Cadence,
    stale_after_ms: f64,
    stats: PauseStats,
}

impl PauseCoordinator {
    pub fn new(local_id: PeerId, config: &EngineConfig) -> Self {
        Self::with_minter(local_id, config, TokenMinter::new())
    }

    pub fn with_minter(local_id: PeerId, config: &EngineConfig, minter: TokenMinter) -> Self {
        let mut store = PauseTokenStore::new();
        store.resolve_id(&local_id, None);
        Self {
            local_id,
            store,
            paused: HashMap::new(),
            local_reasons: BTreeSet::new(),
            minter,
            echo_limiter: SteppedLimiter::with_interval_ms(config.forced_resume_interval_ms),
            heartbeat: Cadence::new(config.pause_heartbeat_ms),
            stale_after_ms: config.pause_stale_ms,
            stats: PauseStats::default(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The local peer's id as currently keyed in the store. Differs from
    /// `local_id` once the local id was linked under another canonical id.
    pub fn local_canonical(&self) -> PeerId {
        self.store.canonical(&self.local_id)
    }

    /// True while any peer requests a pause
    pub fn is_gated(&self) -> bool {
        !self.paused.is_empty()
    }

    pub fn is_paused(&self, peer_id: &PeerId) -> bool {
        self.paused.contains_key(&self.store.canonical(peer_id))
    }

    /// Paused peers in id order
    pub fn paused_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.paused.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn local_reasons(&self) -> impl Iterator<Item = &str> {
        self.local_reasons.iter().map(String::as_str)
    }

    pub fn has_local_reason(&self) -> bool {
        !self.local_reasons.is_empty()
    }

    /// Peers referenced this session, the local peer included
    pub fn known_peers(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &PauseTokenStore {
        &self.store
    }

    pub fn stats(&self) -> &PauseStats {
        &self.stats
    }

    /// Canonicalize a (public, private) id pair through the alias map
    pub fn resolve_id(&mut self, public_id: &PeerId, private_id: Option<&PeerId>) -> PeerId {
        let resolved = self.store.resolve_id(public_id, private_id);
        if let Some(old) = resolved.merged {
            if let Some(seen) = self.paused.remove(&old) {
                let slot = self.paused.entry(resolved.canonical.clone()).or_insert(seen);
                *slot = slot.max(seen);
            }
        }
        resolved.canonical
    }

    /// Apply a pause request from `peer_id`
    pub fn mark_pause(
        &mut self,
        peer_id: &PeerId,
        alias_id: Option<&PeerId>,
        token: Option<u64>,
        now_ms: f64,
    ) -> PauseOutcome {
        let canonical = self.resolve_id(peer_id, alias_id);
        if let Some(rejected) = self.admit(&canonical, token, TokenOp::Pause) {
            return rejected;
        }

        let was_gated = self.is_gated();
        self.store.entry_mut(&canonical).apply(token, TokenOp::Pause);
        self.paused.insert(canonical.clone(), now_ms);

        let transition = if was_gated {
            PauseTransition::Unchanged
        } else {
            info!(peer_id = %canonical, token = ?token, "Session paused");
            PauseTransition::Paused
        };
        PauseOutcome::Applied(transition)
    }

    /// Apply a resume from `peer_id`
    pub fn clear_pause(
        &mut self,
        peer_id: &PeerId,
        alias_id: Option<&PeerId>,
        token: Option<u64>,
    ) -> PauseOutcome {
        let canonical = self.resolve_id(peer_id, alias_id);
        if let Some(rejected) = self.admit(&canonical, token, TokenOp::Resume) {
            return rejected;
        }

        self.store.entry_mut(&canonical).apply(token, TokenOp::Resume);
        let removed = self.paused.remove(&canonical).is_some();

        let transition = if removed && !self.is_gated() {
            info!(peer_id = %canonical, token = ?token, "Session resumed");
            PauseTransition::Resumed
        } else {
            PauseTransition::Unchanged
        };
        PauseOutcome::Applied(transition)
    }

    /// Inbound pause handler with the self-echo guard.
    ///
    /// A pause naming the local peer while it has no reason to be paused, no
    /// blocking modal, and is not in the pause set is a stale echo. It is not
    /// applied; instead a forced resume is returned (at most one per
    /// rate-limit interval) so remote peers waiting on it let go.
    pub fn handle_pause(
        &mut self,
        peer_id: &PeerId,
        alias_id: Option<&PeerId>,
        token: Option<u64>,
        now_ms: f64,
        modal_open: bool,
    ) -> (PauseOutcome, Option<OutboundMsg>) {
        let canonical = self.resolve_id(peer_id, alias_id);
        let is_self = canonical == self.local_canonical();
        if !is_self || self.has_local_reason() || modal_open || self.paused.contains_key(&canonical) {
            return (self.mark_pause(&canonical, None, token, now_ms), None);
        }

        self.stats.echoes_suppressed += 1;
        if !self.echo_limiter.check_at(now_ms) {
            debug!(token = ?token, "Stale self pause echo, forced resume rate limited");
            return (PauseOutcome::StaleEcho, None);
        }

        let token = self.minter.mint();
        self.store.entry_mut(&canonical).apply(Some(token), TokenOp::Resume);
        self.stats.forced_resumes += 1;
        warn!(token, "Stale self pause echo, forcing resume");
        let msg = OutboundMsg::Resume {
            peer_id: self.local_id.clone(),
            token,
            forced: true,
        };
        (PauseOutcome::StaleEcho, Some(msg))
    }

    /// Drop remote pauses that have not been refreshed within the staleness window
    pub fn cleanup_stale(&mut self, now_ms: f64) -> Vec<PeerId> {
        let cutoff = self.stale_after_ms;
        let local_id = self.local_canonical();
        let mut dropped: Vec<PeerId> = self
            .paused
            .iter()
            .filter(|(peer, seen)| **peer != local_id && !peer.is_system() && now_ms - **seen > cutoff)
            .map(|(peer, _)| peer.clone())
            .collect();
        dropped.sort();

        for peer in &dropped {
            self.paused.remove(peer);
            self.stats.stale_peers_dropped += 1;
            warn!(peer_id = %peer, "Dropping stale pause");
        }
        if !dropped.is_empty() && !self.is_gated() {
            info!("Session resumed after stale pause cleanup");
        }
        dropped
    }

    /// Add a local reason to pause. The first reason announces a pause.
    pub fn request_local_pause(&mut self, reason: &str, now_ms: f64) -> Option<OutboundMsg> {
        let first = self.local_reasons.is_empty();
        if !self.local_reasons.insert(reason.to_string()) || !first {
            return None;
        }
        Some(self.announce_local_pause(now_ms))
    }

    /// Remove a local reason. Releasing the last one announces a resume.
    pub fn release_local_pause(&mut self, reason: &str) -> Option<OutboundMsg> {
        if !self.local_reasons.remove(reason) || !self.local_reasons.is_empty() {
            return None;
        }

        let token = self.minter.mint();
        let local_id = self.local_canonical();
        self.clear_pause(&local_id, None, Some(token));
        Some(OutboundMsg::Resume {
            peer_id: self.local_id.clone(),
            token,
            forced: false,
        })
    }

    /// Re-send the active local pause so remote staleness cleanup keeps it
    pub fn heartbeat(&mut self, now_ms: f64) -> Option<OutboundMsg> {
        if !self.has_local_reason() || !self.heartbeat.poll(now_ms) {
            return None;
        }
        let local_id = self.local_canonical();
        let token = self.store.entry(&local_id).and_then(|e| e.active_token)?;
        self.paused.insert(local_id, now_ms);
        debug!(token, "Pause heartbeat");
        Some(OutboundMsg::Pause {
            peer_id: self.local_id.clone(),
            token,
        })
    }

    /// Forget all remote state (teardown / resync). Local reasons survive and
    /// are re-announced with a fresh token.
    pub fn reset(&mut self, now_ms: f64) -> Option<OutboundMsg> {
        self.store.clear();
        self.paused.clear();
        self.store.resolve_id(&self.local_id, None);
        if self.has_local_reason() {
            Some(self.announce_local_pause(now_ms))
        } else {
            None
        }
    }

    fn announce_local_pause(&mut self, now_ms: f64) -> OutboundMsg {
        let token = self.minter.mint();
        let local_id = self.local_canonical();
        self.mark_pause(&local_id, None, Some(token), now_ms);
        self.heartbeat.reset();
        self.heartbeat.poll(now_ms);
        OutboundMsg::Pause {
            peer_id: self.local_id.clone(),
            token,
        }
    }

    fn admit(&mut self, canonical: &PeerId, token: Option<u64>, op: TokenOp) -> Option<PauseOutcome> {
        let verdict = self
            .store
            .entry(canonical)
            .map(|entry| entry.check(token, op))
            .unwrap_or(TokenVerdict::Accept);

        match verdict {
            TokenVerdict::Accept => None,
            TokenVerdict::Stale { token, floor } => {
                self.stats.stale_dropped += 1;
                debug!(peer_id = %canonical, token, floor, op = ?op, "Ignoring stale pause token");
                Some(PauseOutcome::Stale)
            }
            TokenVerdict::Downgrade => {
                self.stats.downgrades_dropped += 1;
                debug!(peer_id = %canonical, op = ?op, "Ignoring untokenized message from token peer");
                Some(PauseOutcome::Downgrade)
            }
        }
    }
}
