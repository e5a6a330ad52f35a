//! Identity-preserving merge of authority snapshots into local entity arenas

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::net::protocol::{EntityId, EntityKind, RawRecord};

use super::entity::{EntityOrigin, SimEntity, Vec2};

/// Entities of one kind, keyed by id. Objects live from first sighting until
/// removal, so local-only fields persist across snapshots.
#[derive(Debug, Clone, Default)]
pub struct EntityArena {
    entities: BTreeMap<EntityId, SimEntity>,
}

impl EntityArena {
    pub fn get(&self, id: &EntityId) -> Option<&SimEntity> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut SimEntity> {
        self.entities.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimEntity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SimEntity> {
        self.entities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Remove every authority-owned entity, returns how many were removed
    fn clear_authority(&mut self) -> usize {
        let before = self.entities.len();
        self.entities
            .retain(|_, e| e.origin == EntityOrigin::Predicted);
        before - self.entities.len()
    }
}

/// Counters from one `apply_snapshot` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    /// First sightings rejected for missing fields, or records without an id
    pub dropped: usize,
    /// Individual fields that kept their previous value
    pub fallbacks: usize,
    /// Bosses kept despite being absent
    pub retained_bosses: usize,
    /// Records naming an entity already reported dead
    pub suppressed_dead: usize,
}

/// Result of an out-of-band death notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathOutcome {
    Removed { kind: EntityKind, was_boss: bool },
    /// Not present locally; remembered so a late snapshot cannot revive it
    Unknown,
    Duplicate,
}

/// Bounded memory of processed death ids
#[derive(Debug, Clone)]
struct DeathLedger {
    order: VecDeque<EntityId>,
    seen: HashSet<EntityId>,
    capacity: usize,
}

impl DeathLedger {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &EntityId) -> bool {
        self.seen.contains(id)
    }

    /// Returns false if already recorded
    fn insert(&mut self, id: EntityId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Merges authority entity snapshots into per-kind arenas
pub struct SnapshotReconciler {
    enemies: EntityArena,
    bullets: EntityArena,
    hazards: EntityArena,
    items: EntityArena,
    deaths: DeathLedger,
}

impl SnapshotReconciler {
    pub fn new(death_memory: usize) -> Self {
        Self {
            enemies: EntityArena::default(),
            bullets: EntityArena::default(),
            hazards: EntityArena::default(),
            items: EntityArena::default(),
            deaths: DeathLedger::new(death_memory),
        }
    }

    pub fn arena(&self, kind: EntityKind) -> &EntityArena {
        match kind {
            EntityKind::Enemies => &self.enemies,
            EntityKind::Bullets => &self.bullets,
            EntityKind::Hazards => &self.hazards,
            EntityKind::Items => &self.items,
        }
    }

    pub fn arena_mut(&mut self, kind: EntityKind) -> &mut EntityArena {
        match kind {
            EntityKind::Enemies => &mut self.enemies,
            EntityKind::Bullets => &mut self.bullets,
            EntityKind::Hazards => &mut self.hazards,
            EntityKind::Items => &mut self.items,
        }
    }

    pub fn total_entities(&self) -> usize {
        EntityKind::ALL.iter().map(|k| self.arena(*k).len()).sum()
    }

    /// Merge one snapshot.
    ///
    /// `None` is "no update". An empty slice means the authority has nothing
    /// of this kind. Otherwise records are found-or-created by id and absent
    /// ids are removed, with bosses allowed one missing cycle.
    pub fn apply_snapshot(&mut self, kind: EntityKind, incoming: Option<&[RawRecord]>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let Some(records) = incoming else {
            return report;
        };

        if records.is_empty() {
            report.removed = self.arena_mut(kind).clear_authority();
            if report.removed > 0 {
                debug!(kind = %kind, removed = report.removed, "Authority cleared entities");
            }
            return report;
        }

        let mut present: HashSet<EntityId> = HashSet::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let Some(id) = record_id(kind, index, record) else {
                report.dropped += 1;
                debug!(kind = %kind, index, "Dropping record without id");
                continue;
            };
            if self.deaths.contains(&id) {
                report.suppressed_dead += 1;
                continue;
            }
            present.insert(id.clone());

            let arena = self.arena_mut(kind);
            match arena.entities.get_mut(&id) {
                Some(entity) => {
                    let fallbacks = entity.merge_record(record);
                    if !fallbacks.is_empty() {
                        debug!(kind = %kind, id = %id, fields = ?fallbacks, "Kept previous values");
                        report.fallbacks += fallbacks.len();
                    }
                    report.updated += 1;
                }
                None => match SimEntity::from_record(kind, id.clone(), record) {
                    Ok(entity) => {
                        arena.entities.insert(id, entity);
                        report.created += 1;
                    }
                    Err(missing) => {
                        warn!(kind = %kind, id = %id, fields = ?missing, "Dropping first sighting with missing fields");
                        report.dropped += 1;
                    }
                },
            }
        }

        let arena = self.arena_mut(kind);
        let mut gone = Vec::new();
        for (id, entity) in arena.entities.iter_mut() {
            if entity.origin == EntityOrigin::Predicted || present.contains(id) {
                continue;
            }
            entity.local.missed_cycles += 1;
            // bosses leave only through a death event or an empty snapshot
            if entity.is_boss() {
                report.retained_bosses += 1;
                continue;
            }
            gone.push(id.clone());
        }
        for id in gone {
            arena.entities.remove(&id);
            report.removed += 1;
        }

        report
    }

    /// Apply an out-of-band death notice. Idempotent per id.
    pub fn apply_death(&mut self, id: &EntityId, position: Vec2, is_boss: bool) -> DeathOutcome {
        if !self.deaths.insert(id.clone()) {
            return DeathOutcome::Duplicate;
        }

        for kind in EntityKind::ALL {
            if let Some(entity) = self.arena_mut(kind).entities.remove(id) {
                let was_boss = entity.is_boss() || is_boss;
                if was_boss {
                    info!(id = %id, x = position.x, y = position.y, "Boss died");
                } else {
                    debug!(id = %id, kind = %kind, "Entity died");
                }
                return DeathOutcome::Removed { kind, was_boss };
            }
        }
        DeathOutcome::Unknown
    }

    /// Insert a locally predicted entity. Fails if the id is already in use.
    pub fn spawn_predicted(&mut self, mut entity: SimEntity) -> bool {
        if self.deaths.contains(&entity.id) {
            return false;
        }
        entity.origin = EntityOrigin::Predicted;
        let arena = self.arena_mut(entity.kind);
        if arena.contains(&entity.id) {
            return false;
        }
        arena.entities.insert(entity.id.clone(), entity);
        true
    }

    /// Remove a predicted entity the local simulation no longer wants
    pub fn despawn_predicted(&mut self, kind: EntityKind, id: &EntityId) -> bool {
        let arena = self.arena_mut(kind);
        match arena.entities.get(id) {
            Some(e) if e.origin == EntityOrigin::Predicted => arena.entities.remove(id).is_some(),
            _ => false,
        }
    }

    /// Drop everything (teardown / resync)
    pub fn clear(&mut self) {
        for kind in EntityKind::ALL {
            self.arena_mut(kind).entities.clear();
        }
        self.deaths.clear();
    }
}

/// Hazards may come without ids; they are keyed by array position.
fn record_id(kind: EntityKind, index: usize, record: &RawRecord) -> Option<EntityId> {
    match (&record.id, kind) {
        (Some(id), _) => Some(id.clone()),
        (None, EntityKind::Hazards) => Some(EntityId::new(format!("hazard#{index}"))),
        (None, _) => None,
    }
}
