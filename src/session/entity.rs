//! Locally simulated entities mirrored from authority snapshots

use crate::net::protocol::{EntityId, EntityKind, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn lerp(self, to: Vec2, t: f64) -> Vec2 {
        let t = t.clamp(0.0, 1.0);
        Vec2::new(self.x + (to.x - self.x) * t, self.y + (to.y - self.y) * t)
    }
}

/// Previous and current position, for interpolated rendering only
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTrail {
    pub prev: Vec2,
    pub curr: Vec2,
}

impl RenderTrail {
    pub fn at(&self, t: f64) -> Vec2 {
        self.prev.lerp(self.curr, t)
    }

    pub fn is_settled(&self) -> bool {
        self.prev == self.curr
    }
}

/// Kind-specific authoritative state
#[derive(Debug, Clone, PartialEq)]
pub enum EntityBody {
    Enemy {
        hp: f64,
        max_hp: f64,
        boss: bool,
        flags: u32,
    },
    Bullet {
        vel: Vec2,
        ttl: f64,
        dmg: f64,
        arm_time: f64,
    },
    Hazard {
        ttl: f64,
        dmg: f64,
    },
    Item {
        value: f64,
    },
}

/// Render/local-only fields that must survive snapshot merges
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalStatus {
    /// Local stun prediction
    pub stun_until_ms: Option<f64>,
    /// Remaining hit flash
    pub hit_flash_ms: f64,
    /// Consecutive snapshots that omitted this entity
    pub missed_cycles: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOrigin {
    /// Sent by the authority at least once
    Authority,
    /// Spawned locally ahead of the authority; the reconciler leaves it alone
    Predicted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub type_name: String,
    pub pos: Vec2,
    pub prev_pos: Vec2,
    pub r: f64,
    pub body: EntityBody,
    pub local: LocalStatus,
    pub origin: EntityOrigin,
}

/// A usable number: present and finite
fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

impl SimEntity {
    /// Build an entity from a first-sighting record.
    /// Returns the names of the missing required fields on failure.
    pub fn from_record(
        kind: EntityKind,
        id: EntityId,
        record: &RawRecord,
    ) -> Result<Self, Vec<&'static str>> {
        let mut missing = Vec::new();
        let mut need = |name: &'static str, value: Option<f64>| {
            let v = usable(value);
            if v.is_none() {
                missing.push(name);
            }
            v.unwrap_or_default()
        };

        let x = need("x", record.x);
        let y = need("y", record.y);
        let body = match kind {
            EntityKind::Enemies => {
                let r = need("r", record.r);
                let hp = need("hp", record.hp);
                (
                    r,
                    EntityBody::Enemy {
                        hp,
                        max_hp: usable(record.max_hp).unwrap_or(hp),
                        boss: record.boss.unwrap_or(false),
                        flags: record.flags.unwrap_or(0),
                    },
                )
            }
            EntityKind::Bullets => {
                let r = need("r", record.r);
                let vx = need("vx", record.vx);
                let vy = need("vy", record.vy);
                let ttl = need("ttl", record.ttl);
                (
                    r,
                    EntityBody::Bullet {
                        vel: Vec2::new(vx, vy),
                        ttl,
                        dmg: usable(record.dmg).unwrap_or(0.0),
                        arm_time: usable(record.arm_time).unwrap_or(0.0),
                    },
                )
            }
            EntityKind::Hazards => {
                let r = need("r", record.r);
                let ttl = need("ttl", record.ttl);
                (
                    r,
                    EntityBody::Hazard {
                        ttl,
                        dmg: usable(record.dmg).unwrap_or(0.0),
                    },
                )
            }
            EntityKind::Items => (
                usable(record.r).unwrap_or(0.0),
                EntityBody::Item {
                    value: usable(record.value).unwrap_or(0.0),
                },
            ),
        };

        if !missing.is_empty() {
            return Err(missing);
        }

        let (r, body) = body;
        let pos = Vec2::new(x, y);
        Ok(Self {
            id,
            kind,
            type_name: record.type_name.clone().unwrap_or_else(|| "unknown".to_string()),
            pos,
            prev_pos: pos,
            r,
            body,
            local: LocalStatus::default(),
            origin: EntityOrigin::Authority,
        })
    }

    /// Overwrite authoritative fields from `record`, keeping the previous value
    /// of any field that is missing or not finite. The current position becomes
    /// the trail's previous position first. Returns the fields that fell back.
    pub fn merge_record(&mut self, record: &RawRecord) -> Vec<&'static str> {
        let mut fallbacks = Vec::new();
        let mut take = |name: &'static str, value: Option<f64>, slot: &mut f64| match usable(value) {
            Some(v) => *slot = v,
            None => fallbacks.push(name),
        };

        self.prev_pos = self.pos;
        take("x", record.x, &mut self.pos.x);
        take("y", record.y, &mut self.pos.y);
        take("r", record.r, &mut self.r);

        match &mut self.body {
            EntityBody::Enemy {
                hp,
                max_hp,
                boss,
                flags,
            } => {
                take("hp", record.hp, hp);
                if let Some(v) = usable(record.max_hp) {
                    *max_hp = v;
                }
                if let Some(b) = record.boss {
                    *boss = b;
                }
                if let Some(f) = record.flags {
                    *flags = f;
                }
            }
            EntityBody::Bullet {
                vel,
                ttl,
                dmg,
                arm_time,
            } => {
                take("vx", record.vx, &mut vel.x);
                take("vy", record.vy, &mut vel.y);
                take("ttl", record.ttl, ttl);
                if let Some(v) = usable(record.dmg) {
                    *dmg = v;
                }
                if let Some(v) = usable(record.arm_time) {
                    *arm_time = v;
                }
            }
            EntityBody::Hazard { ttl, dmg } => {
                take("ttl", record.ttl, ttl);
                if let Some(v) = usable(record.dmg) {
                    *dmg = v;
                }
            }
            EntityBody::Item { value } => {
                if let Some(v) = usable(record.value) {
                    *value = v;
                }
            }
        }

        if let Some(type_name) = &record.type_name {
            if *type_name != self.type_name {
                self.type_name = type_name.clone();
            }
        }
        self.local.missed_cycles = 0;
        self.origin = EntityOrigin::Authority;
        fallbacks
    }

    pub fn is_boss(&self) -> bool {
        matches!(self.body, EntityBody::Enemy { boss: true, .. })
    }

    pub fn trail(&self) -> RenderTrail {
        RenderTrail {
            prev: self.prev_pos,
            curr: self.pos,
        }
    }

    /// Advance locally between snapshots
    pub fn integrate(&mut self, dt: f64) {
        match &mut self.body {
            EntityBody::Bullet { vel, ttl, arm_time, .. } => {
                self.pos.x += vel.x * dt;
                self.pos.y += vel.y * dt;
                *ttl = (*ttl - dt).max(0.0);
                *arm_time = (*arm_time - dt).max(0.0);
            }
            EntityBody::Hazard { ttl, .. } => {
                *ttl = (*ttl - dt).max(0.0);
            }
            EntityBody::Enemy { .. } | EntityBody::Item { .. } => {}
        }
        self.local.hit_flash_ms = (self.local.hit_flash_ms - dt * 1000.0).max(0.0);
    }
}
