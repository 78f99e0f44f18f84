//! Record model

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names owned by the sync layer; domain fields never use them.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "lastModified", "deleted"];

fn is_reserved_field(key: &str) -> bool {
    RESERVED_FIELDS.contains(&key)
}

/// Identifier of a record, unique within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// A versioned domain record.
///
/// `last_modified` is the version stamp compared by the merge resolver. It is
/// only assigned by the replica store's write path. Domain fields are kept as
/// an opaque JSON map so fields written by newer clients survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    /// Unix ms of the last create, update or delete.
    pub last_modified: i64,
    /// Soft delete tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Build a record, dropping any domain field that shadows a reserved name.
    #[must_use]
    pub fn new(id: RecordId, last_modified: i64, fields: Map<String, Value>) -> Self {
        let mut record = Self {
            id,
            last_modified,
            deleted: None,
            fields,
        };
        record.strip_reserved_fields();
        record
    }

    /// Drop domain fields that shadow `id`, `lastModified` or `deleted`.
    pub fn strip_reserved_fields(&mut self) {
        self.fields.retain(|key, _| !is_reserved_field(key));
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted == Some(true)
    }

    /// Canonical byte encoding: compact JSON with object keys sorted at every
    /// depth. Used as the deterministic tie-break between equal timestamps.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut object = Map::new();
        object.insert("id".to_string(), Value::from(self.id.value()));
        object.insert("lastModified".to_string(), Value::from(self.last_modified));
        if let Some(deleted) = self.deleted {
            object.insert("deleted".to_string(), Value::Bool(deleted));
        }
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }

        let mut out = String::new();
        write_canonical(&Value::Object(object), &mut out);
        out.into_bytes()
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Milliseconds are counted from 2024-01-01T00:00:00Z so 41 bits last until
/// the 2090s.
const ID_EPOCH_MS: i64 = 1_704_067_200_000;
const DEVICE_TAG_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;
/// Random starts stay below this, leaving at least 3840 ids per millisecond.
const SEQUENCE_START_SPAN: u16 = 256;

/// Generates record ids as `millis << 22 | device_tag << 12 | sequence`.
///
/// Ids from one generator are strictly increasing. Two devices only collide
/// when their 10-bit device tags match and they draw the same sequence value
/// within the same millisecond.
#[derive(Debug)]
pub struct IdGenerator {
    device_tag: i64,
    state: Mutex<IdState>,
}

#[derive(Debug)]
struct IdState {
    millis: i64,
    sequence: u16,
}

impl IdGenerator {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_tag: device_tag(device_id),
            state: Mutex::new(IdState {
                millis: 0,
                sequence: 0,
            }),
        }
    }

    /// The 10-bit tag mixed into every id from this generator.
    pub const fn device_tag(&self) -> i64 {
        self.device_tag
    }

    pub fn next_id(&self) -> RecordId {
        self.next_id_at(chrono::Utc::now().timestamp_millis())
    }

    fn next_id_at(&self, now_ms: i64) -> RecordId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_ms.saturating_sub(ID_EPOCH_MS).max(0);

        if now > state.millis {
            state.millis = now;
            state.sequence = random_sequence_start();
        } else if state.sequence >= SEQUENCE_MASK {
            // Sequence space for this millisecond is exhausted; borrow the next one.
            state.millis += 1;
            state.sequence = random_sequence_start();
        } else {
            state.sequence += 1;
        }

        let value = (state.millis << (DEVICE_TAG_BITS + SEQUENCE_BITS))
            | (self.device_tag << SEQUENCE_BITS)
            | i64::from(state.sequence);
        RecordId::new(value)
    }
}

fn random_sequence_start() -> u16 {
    rand::thread_rng().gen_range(0..SEQUENCE_START_SPAN)
}

/// FNV-1a over the device id, folded to 10 bits.
fn device_tag(device_id: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in device_id.trim().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    #[allow(clippy::cast_possible_wrap)]
    let tag = (hash & ((1 << DEVICE_TAG_BITS) - 1)) as i64;
    tag
}
