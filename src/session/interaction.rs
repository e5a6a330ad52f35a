//! Batched outbound interaction intents (hits, stuns) and position reports

use std::collections::BTreeMap;

use tracing::trace;

use crate::config::EngineConfig;
use crate::net::protocol::{EntityId, HitEntry, OutboundMsg, PeerId, StunEntry};
use crate::util::time::{hz_to_ms, Cadence};

/// Accumulates local hit and stun intents until their flush is due.
///
/// Damage goes out on a steady cadence. Stuns use an adaptive deadline so a
/// short stun is reported before it would already have expired locally.
#[derive(Debug, Clone)]
pub struct InteractionBatcher {
    damage: BTreeMap<EntityId, f64>,
    stuns: BTreeMap<EntityId, f64>,
    damage_cadence: Cadence,
    stun_due_ms: Option<f64>,
    steady_ms: f64,
    margin_ms: f64,
    min_interval_ms: f64,
}

impl InteractionBatcher {
    pub fn new(config: &EngineConfig) -> Self {
        let steady_ms = hz_to_ms(config.damage_flush_hz);
        Self {
            damage: BTreeMap::new(),
            stuns: BTreeMap::new(),
            damage_cadence: Cadence::new(steady_ms),
            stun_due_ms: None,
            steady_ms,
            margin_ms: config.stun_safety_margin_ms,
            min_interval_ms: config.min_flush_interval_ms,
        }
    }

    /// Add damage against a target; amounts are summed until flush
    pub fn record(&mut self, target_id: EntityId, amount: f64) {
        if !amount.is_finite() || amount <= 0.0 {
            return;
        }
        *self.damage.entry(target_id).or_insert(0.0) += amount;
    }

    /// Add a stun against a target; the longest pending duration wins
    pub fn record_stun(&mut self, target_id: EntityId, duration_sec: f64, now_ms: f64) {
        if !duration_sec.is_finite() || duration_sec <= 0.0 {
            return;
        }
        let slot = self.stuns.entry(target_id).or_insert(0.0);
        *slot = slot.max(duration_sec);

        let delay = self.adaptive_delay_ms(duration_sec * 1000.0);
        let due = now_ms + delay;
        self.stun_due_ms = Some(self.stun_due_ms.map_or(due, |d| d.min(due)));
    }

    /// Delay before a stun of `duration_ms` must be reported
    pub fn adaptive_delay_ms(&self, duration_ms: f64) -> f64 {
        self.steady_ms
            .min(duration_ms - self.margin_ms)
            .max(self.min_interval_ms)
    }

    pub fn pending_hits(&self) -> usize {
        self.damage.len()
    }

    pub fn pending_stuns(&self) -> usize {
        self.stuns.len()
    }

    pub fn next_stun_flush_ms(&self) -> Option<f64> {
        self.stun_due_ms
    }

    /// Drain whatever is due at `now_ms`
    pub fn flush_due(&mut self, now_ms: f64, peer_id: &PeerId) -> Vec<OutboundMsg> {
        let mut out = Vec::new();
        if self.damage_cadence.poll(now_ms) {
            out.extend(self.flush(peer_id));
        }
        if matches!(self.stun_due_ms, Some(due) if now_ms >= due) {
            out.extend(self.flush_stuns(peer_id));
        }
        out
    }

    /// Drain pending damage into one message
    pub fn flush(&mut self, peer_id: &PeerId) -> Option<OutboundMsg> {
        if self.damage.is_empty() {
            return None;
        }
        let hits: Vec<HitEntry> = std::mem::take(&mut self.damage)
            .into_iter()
            .map(|(target_id, amount)| HitEntry { target_id, amount })
            .collect();
        trace!(count = hits.len(), "Flushing hits");
        Some(OutboundMsg::Hits {
            peer_id: peer_id.clone(),
            hits,
        })
    }

    /// Drain pending stuns into one message
    pub fn flush_stuns(&mut self, peer_id: &PeerId) -> Option<OutboundMsg> {
        self.stun_due_ms = None;
        if self.stuns.is_empty() {
            return None;
        }
        let stuns: Vec<StunEntry> = std::mem::take(&mut self.stuns)
            .into_iter()
            .map(|(target_id, duration_sec)| StunEntry {
                target_id,
                duration_sec,
            })
            .collect();
        trace!(count = stuns.len(), "Flushing stuns");
        Some(OutboundMsg::Stuns {
            peer_id: peer_id.clone(),
            stuns,
        })
    }

    pub fn clear(&mut self) {
        self.damage.clear();
        self.stuns.clear();
        self.stun_due_ms = None;
        self.damage_cadence.reset();
    }
}

/// Local player position and vitals
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalVitals {
    pub x: f64,
    pub y: f64,
    pub hp: f64,
    pub max_hp: f64,
}

/// Emits `pos` at a fixed rate when vitals changed, and at least once a second
#[derive(Debug, Clone)]
pub struct VitalsReporter {
    cadence: Cadence,
    current: Option<LocalVitals>,
    last_sent: Option<LocalVitals>,
    last_sent_ms: f64,
}

/// Unchanged vitals are still re-sent this often
const VITALS_KEEPALIVE_MS: f64 = 1000.0;

impl VitalsReporter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cadence: Cadence::from_hz(config.pos_report_hz),
            current: None,
            last_sent: None,
            last_sent_ms: f64::NEG_INFINITY,
        }
    }

    pub fn update(&mut self, vitals: LocalVitals) {
        self.current = Some(vitals);
    }

    pub fn poll(&mut self, now_ms: f64, peer_id: &PeerId) -> Option<OutboundMsg> {
        let vitals = self.current?;
        if !self.cadence.poll(now_ms) {
            return None;
        }
        let changed = self.last_sent != Some(vitals);
        if !changed && now_ms - self.last_sent_ms < VITALS_KEEPALIVE_MS {
            return None;
        }
        self.last_sent = Some(vitals);
        self.last_sent_ms = now_ms;
        Some(OutboundMsg::Pos {
            peer_id: peer_id.clone(),
            x: vitals.x,
            y: vitals.y,
            hp: vitals.hp,
            max_hp: vitals.max_hp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> PeerId {
        PeerId::from("me")
    }

    #[test]
    fn hits_are_summed_per_target_and_cleared() {
        let mut batcher = InteractionBatcher::new(&EngineConfig::default());
        batcher.record(EntityId::from("a"), 5.0);
        batcher.record(EntityId::from("a"), 7.5);
        batcher.record(EntityId::from("b"), 1.0);
        batcher.record(EntityId::from("b"), f64::NAN);

        let Some(OutboundMsg::Hits { hits, .. }) = batcher.flush(&me()) else {
            panic!("expected hits");
        };
        assert_eq!(
            hits,
            vec![
                HitEntry {
                    target_id: EntityId::from("a"),
                    amount: 12.5
                },
                HitEntry {
                    target_id: EntityId::from("b"),
                    amount: 1.0
                },
            ]
        );
        assert!(batcher.flush(&me()).is_none());
    }

    #[test]
    fn damage_flushes_at_steady_rate() {
        let mut batcher = InteractionBatcher::new(&EngineConfig::default());
        assert!(batcher.flush_due(0.0, &me()).is_empty());
        batcher.record(EntityId::from("a"), 1.0);
        assert!(batcher.flush_due(30.0, &me()).is_empty());
        assert_eq!(batcher.flush_due(67.0, &me()).len(), 1);
        assert_eq!(batcher.pending_hits(), 0);
    }

    #[test]
    fn short_stun_flushes_before_it_expires() {
        let batcher = InteractionBatcher::new(&EngineConfig::default());
        // long stun: steady cadence
        assert!((batcher.adaptive_delay_ms(2_000.0) - 1000.0 / 15.0).abs() < 1e-9);
        // 50ms stun: 50 - 25
        assert_eq!(batcher.adaptive_delay_ms(50.0), 25.0);
        // shorter than the margin: clamped to the floor
        assert_eq!(batcher.adaptive_delay_ms(10.0), 8.0);
    }

    #[test]
    fn stun_deadline_follows_shortest_pending() {
        let mut batcher = InteractionBatcher::new(&EngineConfig::default());
        batcher.record_stun(EntityId::from("a"), 2.0, 100.0);
        batcher.record_stun(EntityId::from("b"), 0.05, 110.0);
        batcher.record_stun(EntityId::from("a"), 0.5, 112.0);
        assert_eq!(batcher.next_stun_flush_ms(), Some(135.0));

        assert!(batcher.flush_stuns(&me()).is_some());
        batcher.record_stun(EntityId::from("c"), 1.0, 200.0);
        let out = batcher.flush_due(200.0 + 1000.0 / 15.0, &me());
        let stuns = out
            .iter()
            .find_map(|m| match m {
                OutboundMsg::Stuns { stuns, .. } => Some(stuns.clone()),
                _ => None,
            })
            .expect("stuns flushed");
        assert_eq!(stuns.len(), 1);
        assert_eq!(stuns[0].duration_sec, 1.0);
    }

    #[test]
    fn stuns_keep_longest_duration() {
        let mut batcher = InteractionBatcher::new(&EngineConfig::default());
        batcher.record_stun(EntityId::from("a"), 0.3, 0.0);
        batcher.record_stun(EntityId::from("a"), 1.2, 0.0);
        batcher.record_stun(EntityId::from("a"), 0.4, 0.0);
        let Some(OutboundMsg::Stuns { stuns, .. }) = batcher.flush_stuns(&me()) else {
            panic!("expected stuns");
        };
        assert_eq!(stuns[0].duration_sec, 1.2);
    }

    #[test]
    fn vitals_report_changes_and_keepalive() {
        let mut reporter = VitalsReporter::new(&EngineConfig::default());
        assert!(reporter.poll(0.0, &me()).is_none());

        let vitals = LocalVitals {
            x: 1.0,
            y: 2.0,
            hp: 90.0,
            max_hp: 100.0,
        };
        reporter.update(vitals);
        assert!(reporter.poll(0.0, &me()).is_some());
        assert!(reporter.poll(100.0, &me()).is_none());

        reporter.update(LocalVitals { x: 3.0, ..vitals });
        assert!(reporter.poll(200.0, &me()).is_some());
        assert!(reporter.poll(700.0, &me()).is_none());
        assert!(reporter.poll(1_250.0, &me()).is_some());
    }
}
