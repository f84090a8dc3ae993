//! Periodic view state snapshots with optional delta compression.
//!
//! A snapshot is the field vector an [`Observed`](crate::view::Observed) object writes. In
//! `ReliableDeltaCompressed` mode, fields approximately equal to the last sent vector are nulled
//! out, and fields whose new value really is null are listed separately so the receiver can tell
//! "unchanged" from "changed to null".

use std::collections::BTreeMap;

use crate::consts::{DEFAULT_ANGLE_PRECISION_DEG, DEFAULT_FLOAT_PRECISION, DEFAULT_VECTOR_PRECISION};
use crate::error::{Error, Result};
use crate::value::{Table, Value};
use crate::view::{SyncMode, View, ViewId};

const KEY_VIEW_ID: i16 = 0;
const KEY_FULL: i16 = 1;
const KEY_COMPRESSED: i16 = 2;
const KEY_NULL_INDICES: i16 = 3;

const KEY_BATCH_TIMESTAMP: i16 = 0;
const KEY_BATCH_PREFIX: i16 = 1;
const FIRST_BATCH_ENTRY: i16 = 2;

/// Tolerances used to decide whether a field changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPrecision {
    pub float: f32,
    /// Squared distance.
    pub vector: f32,
    pub angle_degrees: f32,
}

impl Default for SyncPrecision {
    fn default() -> Self {
        Self {
            float: DEFAULT_FLOAT_PRECISION,
            vector: DEFAULT_VECTOR_PRECISION,
            angle_degrees: DEFAULT_ANGLE_PRECISION_DEG,
        }
    }
}

pub fn approx_equal(a: &Value, b: &Value, precision: &SyncPrecision) -> bool {
    match (a, b) {
        (Value::Float(a), Value::Float(b)) => (a - b).abs() <= precision.float,
        (Value::Double(a), Value::Double(b)) => (a - b).abs() <= f64::from(precision.float),
        (Value::Vector3(a), Value::Vector3(b)) => a.distance_squared(b) <= precision.vector,
        (Value::Quaternion(a), Value::Quaternion(b)) => {
            a.angle_degrees(b) <= precision.angle_degrees
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(a, b)| approx_equal(a, b, precision))
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotFields {
    Full(Vec<Value>),
    Compressed {
        fields: Vec<Value>,
        null_indices: Vec<i32>,
    },
}

/// One view's entry in a serialization batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub view_id: ViewId,
    pub fields: SnapshotFields,
}

impl ViewSnapshot {
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.insert(KEY_VIEW_ID, Value::Int(self.view_id));
        match &self.fields {
            SnapshotFields::Full(fields) => {
                table.insert(KEY_FULL, Value::Array(fields.clone()));
            }
            SnapshotFields::Compressed {
                fields,
                null_indices,
            } => {
                table.insert(KEY_COMPRESSED, Value::Array(fields.clone()));
                if !null_indices.is_empty() {
                    table.insert(KEY_NULL_INDICES, Value::IntArray(null_indices.clone()));
                }
            }
        }
        table
    }

    pub fn from_table(table: &Table) -> Result<Self> {
        let malformed = |reason| Error::MalformedEvent {
            code: crate::protocol::event::SEND_SERIALIZE,
            reason,
        };
        let view_id = table
            .get(&KEY_VIEW_ID)
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("snapshot without view id"))?;
        let fields = match (table.get(&KEY_FULL), table.get(&KEY_COMPRESSED)) {
            (Some(Value::Array(full)), None) => SnapshotFields::Full(full.clone()),
            (None, Some(Value::Array(compressed))) => SnapshotFields::Compressed {
                fields: compressed.clone(),
                null_indices: table
                    .get(&KEY_NULL_INDICES)
                    .and_then(Value::as_int_array)
                    .map(<[i32]>::to_vec)
                    .unwrap_or_default(),
            },
            _ => return Err(malformed("snapshot needs exactly one field vector")),
        };
        Ok(Self { view_id, fields })
    }
}

/// Encodes `current` against the last sent vector.
///
/// Returns `None` if compression removed every field, i.e. nothing changed.
pub fn encode(
    view_id: ViewId,
    current: &[Value],
    last_sent: Option<&[Value]>,
    compress: bool,
    precision: &SyncPrecision,
) -> Option<ViewSnapshot> {
    let previous = match last_sent {
        Some(previous) if compress && previous.len() == current.len() => previous,
        _ => {
            return Some(ViewSnapshot {
                view_id,
                fields: SnapshotFields::Full(current.to_vec()),
            })
        }
    };
    let mut compressed_count = 0;
    let mut fields = Vec::with_capacity(current.len());
    let mut null_indices = Vec::new();
    for (i, (new, old)) in current.iter().zip(previous).enumerate() {
        if approx_equal(new, old, precision) {
            compressed_count += 1;
            fields.push(Value::Null);
        } else {
            if new.is_null() {
                null_indices.push(i as i32);
            }
            fields.push(new.clone());
        }
    }
    if compressed_count == current.len() {
        return None;
    }
    Some(ViewSnapshot {
        view_id,
        fields: SnapshotFields::Compressed {
            fields,
            null_indices,
        },
    })
}

/// Reconstructs the full field vector of a received snapshot.
pub fn decode(snapshot: &ViewSnapshot, last_received: Option<&[Value]>) -> Result<Vec<Value>> {
    let (fields, null_indices) = match &snapshot.fields {
        SnapshotFields::Full(fields) => return Ok(fields.clone()),
        SnapshotFields::Compressed {
            fields,
            null_indices,
        } => (fields, null_indices),
    };
    let Some(previous) = last_received else {
        return Err(Error::SnapshotNotReady(snapshot.view_id));
    };
    if previous.len() != fields.len() {
        return Err(Error::SnapshotLengthMismatch {
            view_id: snapshot.view_id,
            expected: previous.len(),
            actual: fields.len(),
        });
    }
    let full = fields
        .iter()
        .zip(previous)
        .enumerate()
        .map(|(i, (new, old))| {
            if new.is_null() && !null_indices.contains(&(i as i32)) {
                old.clone()
            } else {
                new.clone()
            }
        })
        .collect();
    Ok(full)
}

/// Gathers and encodes the view's current state. Returns the snapshot and whether it goes
/// out reliably, or `None` if there is nothing to send this tick.
pub(crate) fn serialize_view(
    view: &mut View,
    precision: &SyncPrecision,
) -> Option<(bool, ViewSnapshot)> {
    let reliable = match view.sync_mode {
        SyncMode::Off => return None,
        SyncMode::Unreliable => false,
        SyncMode::ReliableDeltaCompressed => true,
    };
    let current = view.observed.as_mut()?.write_fields();
    let snapshot = encode(
        view.id,
        &current,
        view.last_sent.as_deref(),
        reliable,
        precision,
    )?;
    view.last_sent = Some(current);
    Some((reliable, snapshot))
}

/// Decodes a received snapshot and applies it to the view's observed object.
pub(crate) fn apply_snapshot(view: &mut View, snapshot: &ViewSnapshot) -> Result<()> {
    let full = decode(snapshot, view.last_received.as_deref())?;
    if let Some(observed) = view.observed.as_mut() {
        observed.read_fields(&full);
    }
    view.last_received = Some(full);
    Ok(())
}

#[derive(Debug, Default)]
struct GroupBatch {
    reliable: Vec<ViewSnapshot>,
    unreliable: Vec<ViewSnapshot>,
}

/// One outgoing serialization message.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMessage {
    pub group: u8,
    pub reliable: bool,
    pub content: Table,
}

/// Collects one serialization pass, split per interest group and reliability.
#[derive(Debug)]
pub struct SerializationBatch {
    timestamp: i32,
    level_prefix: i16,
    groups: BTreeMap<u8, GroupBatch>,
}

impl SerializationBatch {
    pub fn new(timestamp: i32, level_prefix: i16) -> Self {
        Self {
            timestamp,
            level_prefix,
            groups: BTreeMap::new(),
        }
    }
    pub fn push(&mut self, group: u8, reliable: bool, snapshot: ViewSnapshot) {
        let batch = self.groups.entry(group).or_default();
        if reliable {
            batch.reliable.push(snapshot);
        } else {
            batch.unreliable.push(snapshot);
        }
    }
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
    fn message(&self, group: u8, reliable: bool, snapshots: &[ViewSnapshot]) -> BatchMessage {
        let mut content = Table::new();
        content.insert(KEY_BATCH_TIMESTAMP, Value::Int(self.timestamp));
        if self.level_prefix > 0 {
            content.insert(KEY_BATCH_PREFIX, Value::Short(self.level_prefix));
        }
        for (key, snapshot) in (FIRST_BATCH_ENTRY..).zip(snapshots) {
            content.insert(key, Value::Table(snapshot.to_table()));
        }
        BatchMessage {
            group,
            reliable,
            content,
        }
    }
    pub fn into_messages(self) -> Vec<BatchMessage> {
        let mut messages = Vec::new();
        for (&group, batch) in &self.groups {
            if !batch.reliable.is_empty() {
                messages.push(self.message(group, true, &batch.reliable));
            }
            if !batch.unreliable.is_empty() {
                messages.push(self.message(group, false, &batch.unreliable));
            }
        }
        messages
    }
}

/// A received serialization batch.
#[derive(Debug)]
pub struct ReceivedBatch {
    pub timestamp: i32,
    pub level_prefix: i16,
    /// Entries that failed to parse are reported individually.
    pub snapshots: Vec<Result<ViewSnapshot>>,
}

pub fn parse_batch(content: &Table) -> Result<ReceivedBatch> {
    let timestamp = content
        .get(&KEY_BATCH_TIMESTAMP)
        .and_then(Value::as_int)
        .ok_or(Error::MalformedEvent {
            code: crate::protocol::event::SEND_SERIALIZE,
            reason: "batch without timestamp",
        })?;
    let level_prefix = content
        .get(&KEY_BATCH_PREFIX)
        .and_then(Value::as_short)
        .unwrap_or(0);
    let snapshots = content
        .range(FIRST_BATCH_ENTRY..)
        .map(|(_, entry)| match entry.as_table() {
            Some(table) => ViewSnapshot::from_table(table),
            None => Err(Error::MalformedEvent {
                code: crate::protocol::event::SEND_SERIALIZE,
                reason: "batch entry is not a table",
            }),
        })
        .collect();
    Ok(ReceivedBatch {
        timestamp,
        level_prefix,
        snapshots,
    })
}
