//! Session protocol message definitions
//! These are the wire types exchanged between peers, the relay and the authority

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque peer identifier. Compare only canonical ids (see `PauseTokenStore::resolve_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    const SYSTEM: &'static str = "system";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Pseudo-peer used for pauses the session itself imposes
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Entity identifier as sent by the authority (numbers are normalized to text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self(i.to_string()))
                } else if let Some(u) = n.as_u64() {
                    Some(Self(u.to_string()))
                } else {
                    n.as_f64()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| Self(format!("{}", f as i64)))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom("entity id must be a string or an integer"))
    }
}

/// Authority-owned entity collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Enemies,
    Bullets,
    Hazards,
    Items,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [Self::Enemies, Self::Bullets, Self::Hazards, Self::Items];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enemies => "enemies",
            Self::Bullets => "bullets",
            Self::Hazards => "hazards",
            Self::Items => "items",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authoritative record inside an entity snapshot.
///
/// Every field is optional and decoded leniently: a value of the wrong JSON
/// type reads as missing, so the reconciler can fall back field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    #[serde(rename = "type", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub r: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub hp: Option<f64>,
    #[serde(alias = "maxHp", default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<f64>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub boss: Option<bool>,
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub dmg: Option<f64>,
    #[serde(alias = "armTime", default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub arm_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Messages delivered to a peer (from other peers via the relay, or from the authority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMsg {
    /// A peer asks for the match to be paused
    Pause {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias_id: Option<PeerId>,
        /// Ordering token; malformed values read as absent
        #[serde(default, deserialize_with = "lenient_token", skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
    },

    /// A peer withdraws its pause request
    Resume {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias_id: Option<PeerId>,
        #[serde(default, deserialize_with = "lenient_token", skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
    },

    /// Authority clock reading
    ClockSample { server_time_ms: f64 },

    /// Match origin in authority time
    MatchStart {
        server_start_time_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        party_size: Option<usize>,
    },

    /// Point-in-time records for one entity kind; `null`/absent means "no update"
    EntitySnapshot {
        kind: EntityKind,
        #[serde(default)]
        records: Option<Vec<RawRecord>>,
    },

    /// Out-of-band death notice
    EntityDeath {
        id: EntityId,
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default)]
        is_boss: bool,
    },
}

impl InboundMsg {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::ClockSample { .. } => "clock_sample",
            Self::MatchStart { .. } => "match_start",
            Self::EntitySnapshot { .. } => "entity_snapshot",
            Self::EntityDeath { .. } => "entity_death",
        }
    }
}

/// Batched damage against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitEntry {
    pub target_id: EntityId,
    pub amount: f64,
}

/// Batched stun against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StunEntry {
    pub target_id: EntityId,
    pub duration_sec: f64,
}

/// Messages a peer publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMsg {
    Pause {
        peer_id: PeerId,
        token: u64,
    },

    Resume {
        peer_id: PeerId,
        token: u64,
        /// Issued by the self-echo guard rather than by a released reason
        #[serde(default)]
        forced: bool,
    },

    Hits {
        peer_id: PeerId,
        hits: Vec<HitEntry>,
    },

    Stuns {
        peer_id: PeerId,
        stuns: Vec<StunEntry>,
    },

    /// Local vitals and position
    Pos {
        peer_id: PeerId,
        x: f64,
        y: f64,
        hp: f64,
        max_hp: f64,
    },
}

impl OutboundMsg {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Hits { .. } => "hits",
            Self::Stuns { .. } => "stuns",
            Self::Pos { .. } => "pos",
        }
    }

    /// The form other peers receive this message in, if it is peer-relayed
    pub fn to_peer_inbound(&self) -> Option<InboundMsg> {
        match self {
            Self::Pause { peer_id, token } => Some(InboundMsg::Pause {
                peer_id: peer_id.clone(),
                alias_id: None,
                token: Some(*token),
            }),
            Self::Resume { peer_id, token, .. } => Some(InboundMsg::Resume {
                peer_id: peer_id.clone(),
                alias_id: None,
                token: Some(*token),
            }),
            Self::Hits { .. } | Self::Stuns { .. } | Self::Pos { .. } => None,
        }
    }
}

/// Wire codec errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decode an inbound message from its JSON text form
pub fn decode_inbound(text: &str) -> Result<InboundMsg, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Encode an outbound message to JSON text
pub fn encode_outbound(msg: &OutboundMsg) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Encode)
}

/// Normalize a wire token: non-negative integers only, anything else is "no token"
pub fn normalize_token(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        _ => None,
    }
}

fn lenient_token<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_token(&value))
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<EntityId>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(EntityId::from_value(&value))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64())
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_u64().and_then(|v| u32::try_from(v).ok()))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_tokens_read_as_absent() {
        for raw in [
            r#"{"type":"pause","peer_id":"a","token":-3}"#,
            r#"{"type":"pause","peer_id":"a","token":1.5}"#,
            r#"{"type":"pause","peer_id":"a","token":"7"}"#,
            r#"{"type":"pause","peer_id":"a","token":null}"#,
            r#"{"type":"pause","peer_id":"a"}"#,
        ] {
            match decode_inbound(raw).expect("decode") {
                InboundMsg::Pause { token, .. } => assert_eq!(token, None, "{raw}"),
                other => panic!("unexpected {other:?}"),
            }
        }

        match decode_inbound(r#"{"type":"resume","peer_id":"a","token":12.0}"#).expect("decode") {
            InboundMsg::Resume { token, .. } => assert_eq!(token, Some(12)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn snapshot_records_tolerate_bad_fields() {
        let raw = r#"{
            "type": "entity_snapshot",
            "kind": "enemies",
            "records": [{"id": 7, "type": "slime", "x": "oops", "y": 25, "maxHp": 40, "boss": 1}]
        }"#;
        let InboundMsg::EntitySnapshot { kind, records } = decode_inbound(raw).expect("decode") else {
            panic!("expected snapshot");
        };
        assert_eq!(kind, EntityKind::Enemies);
        let records = records.expect("records present");
        let record = &records[0];
        assert_eq!(record.id, Some(EntityId::from(7u64)));
        assert_eq!(record.x, None);
        assert_eq!(record.y, Some(25.0));
        assert_eq!(record.max_hp, Some(40.0));
        assert_eq!(record.boss, Some(true));
    }

    #[test]
    fn null_records_differ_from_empty_records() {
        let none = decode_inbound(r#"{"type":"entity_snapshot","kind":"bullets","records":null}"#)
            .expect("decode");
        let empty = decode_inbound(r#"{"type":"entity_snapshot","kind":"bullets","records":[]}"#)
            .expect("decode");
        assert!(matches!(none, InboundMsg::EntitySnapshot { records: None, .. }));
        assert!(matches!(empty, InboundMsg::EntitySnapshot { records: Some(ref r), .. } if r.is_empty()));
    }

    #[test]
    fn relayed_pause_keeps_token() {
        let msg = OutboundMsg::Pause {
            peer_id: PeerId::from("p1"),
            token: 42,
        };
        let text = encode_outbound(&msg).expect("encode");
        assert!(text.contains(r#""type":"pause""#));
        assert_eq!(
            msg.to_peer_inbound(),
            Some(InboundMsg::Pause {
                peer_id: PeerId::from("p1"),
                alias_id: None,
                token: Some(42),
            })
        );
    }
}
