//! Rich-text deltas: the canonical content and edit representation.
//!
//! A delta is an ordered sequence of three op kinds over a position cursor:
//!
//! ```text
//! {"retain": 3}                          advance 3 units
//! {"retain": 2, "attributes": {…}}       advance 2 units, restyle them
//! {"insert": "hi", "attributes": {…}}    insert text
//! {"insert": {"image": "…"}}             insert an embed (length 1)
//! {"delete": 4}                          remove 4 units
//! ```
//!
//! Length units are Unicode scalar values. A document is a delta made of
//! inserts only; edits are deltas applied against a document. Construction
//! through [`Delta::push`] normalizes: adjacent ops of the same kind and
//! identical attributes merge, zero-length ops vanish, inserts slide in
//! front of a preceding delete (the two orders are equivalent, the
//! normalized form picks one), and a trailing bare retain is chopped.
//! Equality is structural on the normalized form.

use crate::attributes::AttrMap;
use serde::{Deserialize, Serialize};

/// Payload of an insert op: text or an opaque embed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertContent {
    /// A run of text; length is its count of Unicode scalar values.
    Text(String),
    /// An embedded object (image, mention, …); length is always 1.
    Embed(serde_json::Map<String, serde_json::Value>),
}

impl InsertContent {
    /// Length in document units.
    pub fn len(&self) -> usize {
        match self {
            InsertContent::Text(s) => s.chars().count(),
            InsertContent::Embed(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, InsertContent::Text(s) if s.is_empty())
    }
}

/// One op of a delta. Serializes to the classic rich-text JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaOp {
    Retain {
        retain: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<AttrMap>,
    },
    Delete {
        delete: usize,
    },
    Insert {
        insert: InsertContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<AttrMap>,
    },
}

impl DeltaOp {
    /// Length of this op in document units.
    pub fn len(&self) -> usize {
        match self {
            DeltaOp::Retain { retain, .. } => *retain,
            DeltaOp::Delete { delete } => *delete,
            DeltaOp::Insert { insert, .. } => insert.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> OpKind {
        match self {
            DeltaOp::Retain { .. } => OpKind::Retain,
            DeltaOp::Delete { .. } => OpKind::Delete,
            DeltaOp::Insert { .. } => OpKind::Insert,
        }
    }
}

/// Discriminant used by the compose/transform loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Retain,
    Delete,
    Insert,
}

/// An ordered, normalized sequence of ops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta {
    ops: Vec<DeltaOp>,
}

impl Delta {
    /// The empty delta (identity for compose and transform).
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from raw ops, normalizing as it goes. Use for ops that
    /// arrived over the wire and may carry zero-length or mergeable runs.
    pub fn from_ops(ops: Vec<DeltaOp>) -> Self {
        let mut delta = Delta::new();
        for op in ops {
            delta.push(op);
        }
        delta
    }

    /// Re-normalize in place (wire deltas deserialize without passing
    /// through [`Delta::push`]).
    pub fn normalize(&mut self) {
        let ops = std::mem::take(&mut self.ops);
        *self = Delta::from_ops(ops).chop();
    }

    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<DeltaOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // ─── Builder ──────────────────────────────────────────────────────

    pub fn retain(mut self, n: usize) -> Self {
        self.push(DeltaOp::Retain {
            retain: n,
            attributes: None,
        });
        self
    }

    pub fn retain_attr(mut self, n: usize, attributes: AttrMap) -> Self {
        self.push(DeltaOp::Retain {
            retain: n,
            attributes: Some(attributes),
        });
        self
    }

    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.push(DeltaOp::Insert {
            insert: InsertContent::Text(text.into()),
            attributes: None,
        });
        self
    }

    pub fn insert_attr(mut self, text: impl Into<String>, attributes: AttrMap) -> Self {
        self.push(DeltaOp::Insert {
            insert: InsertContent::Text(text.into()),
            attributes: Some(attributes),
        });
        self
    }

    pub fn insert_embed(mut self, embed: serde_json::Map<String, serde_json::Value>) -> Self {
        self.push(DeltaOp::Insert {
            insert: InsertContent::Embed(embed),
            attributes: None,
        });
        self
    }

    pub fn delete(mut self, n: usize) -> Self {
        self.push(DeltaOp::Delete { delete: n });
        self
    }

    /// Append one op, merging into the tail where the normalized form
    /// allows it.
    pub fn push(&mut self, op: DeltaOp) {
        if op.is_empty() {
            return;
        }
        let mut op = op;
        // Drop empty attribute maps so equality is structural.
        match &mut op {
            DeltaOp::Retain { attributes, .. } | DeltaOp::Insert { attributes, .. } => {
                if attributes.as_ref().is_some_and(|a| a.is_empty()) {
                    *attributes = None;
                }
            }
            DeltaOp::Delete { .. } => {}
        }

        let mut index = self.ops.len();
        // Inserts slide in front of a trailing delete: "delete then insert
        // here" and "insert here then delete after" are the same edit.
        if matches!(op, DeltaOp::Insert { .. })
            && matches!(self.ops.last(), Some(DeltaOp::Delete { .. }))
        {
            index -= 1;
        }

        if index > 0 {
            if let Some(merged) = merge(&self.ops[index - 1], &op) {
                self.ops[index - 1] = merged;
                return;
            }
        }
        self.ops.insert(index, op);
    }

    /// Drop a trailing bare retain (it has no effect).
    pub fn chop(mut self) -> Self {
        if let Some(DeltaOp::Retain {
            attributes: None, ..
        }) = self.ops.last()
        {
            self.ops.pop();
        }
        self
    }

    // ─── Lengths ──────────────────────────────────────────────────────

    /// Length of the state this delta applies to (retains + deletes).
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Insert { .. } => 0,
                other => other.len(),
            })
            .sum()
    }

    /// Length of the state this delta produces (retains + inserts).
    pub fn target_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Delete { .. } => 0,
                other => other.len(),
            })
            .sum()
    }

    /// Document length. Meaningful for insert-only deltas, where it equals
    /// the total inserted length.
    pub fn len(&self) -> usize {
        self.target_len()
    }

    /// Whether this delta is a document: inserts only.
    pub fn is_document(&self) -> bool {
        self.ops
            .iter()
            .all(|op| matches!(op, DeltaOp::Insert { .. }))
    }

    // ─── Projections ──────────────────────────────────────────────────

    /// Sub-sequence covering positions `[start, end)` of this delta's own
    /// op lengths. On a document this is the content slice.
    pub fn slice(&self, start: usize, end: usize) -> Delta {
        let mut cursor = OpCursor::new(&self.ops);
        let mut out = Delta::new();
        let mut position = 0;
        while position < end && cursor.has_next() {
            let take = if position < start {
                start - position
            } else {
                end - position
            };
            let len = cursor.peek_len().min(take);
            let op = cursor.next_slice(len);
            let advanced = op.len();
            if position >= start {
                out.push(op);
            }
            position += advanced;
        }
        out
    }

    /// Plain-text projection: concatenated text inserts, embeds skipped.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            if let DeltaOp::Insert {
                insert: InsertContent::Text(s),
                ..
            } = op
            {
                out.push_str(s);
            }
        }
        out
    }
}

impl FromIterator<DeltaOp> for Delta {
    fn from_iter<I: IntoIterator<Item = DeltaOp>>(iter: I) -> Self {
        Delta::from_ops(iter.into_iter().collect())
    }
}

fn merge(prev: &DeltaOp, next: &DeltaOp) -> Option<DeltaOp> {
    match (prev, next) {
        (DeltaOp::Delete { delete: a }, DeltaOp::Delete { delete: b }) => {
            Some(DeltaOp::Delete { delete: a + b })
        }
        (
            DeltaOp::Retain {
                retain: a,
                attributes: attrs_a,
            },
            DeltaOp::Retain {
                retain: b,
                attributes: attrs_b,
            },
        ) if attrs_a == attrs_b => Some(DeltaOp::Retain {
            retain: a + b,
            attributes: attrs_a.clone(),
        }),
        (
            DeltaOp::Insert {
                insert: InsertContent::Text(a),
                attributes: attrs_a,
            },
            DeltaOp::Insert {
                insert: InsertContent::Text(b),
                attributes: attrs_b,
            },
        ) if attrs_a == attrs_b => Some(DeltaOp::Insert {
            insert: InsertContent::Text(format!("{a}{b}")),
            attributes: attrs_a.clone(),
        }),
        _ => None,
    }
}

/// Substring by scalar-value offsets.
fn substr(s: &str, start: usize, len: usize) -> String {
    s.chars().skip(start).take(len).collect()
}

/// Streaming cursor over a delta's ops that can split an op at any unit
/// boundary. Once the underlying ops are exhausted it yields implicit bare
/// retains, which lets the compose/transform loops treat a shorter operand
/// as if it were padded.
pub(crate) struct OpCursor<'a> {
    ops: &'a [DeltaOp],
    index: usize,
    /// Units of the current op already consumed.
    offset: usize,
}

impl<'a> OpCursor<'a> {
    pub(crate) fn new(ops: &'a [DeltaOp]) -> Self {
        let mut cursor = Self {
            ops,
            index: 0,
            offset: 0,
        };
        cursor.skip_empty();
        cursor
    }

    fn skip_empty(&mut self) {
        while self.index < self.ops.len() && self.offset >= self.ops[self.index].len() {
            self.index += 1;
            self.offset = 0;
        }
    }

    /// Whether real (non-implicit) ops remain.
    pub(crate) fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    /// Remaining length of the current op, or `usize::MAX` once exhausted.
    pub(crate) fn peek_len(&self) -> usize {
        if self.index < self.ops.len() {
            self.ops[self.index].len() - self.offset
        } else {
            usize::MAX
        }
    }

    /// Kind of the current op; exhausted cursors read as retains.
    pub(crate) fn peek_kind(&self) -> OpKind {
        if self.index < self.ops.len() {
            self.ops[self.index].kind()
        } else {
            OpKind::Retain
        }
    }

    /// Consume up to `max` units of the current op and return that piece.
    pub(crate) fn next_slice(&mut self, max: usize) -> DeltaOp {
        if self.index >= self.ops.len() {
            return DeltaOp::Retain {
                retain: max,
                attributes: None,
            };
        }
        let op = &self.ops[self.index];
        let available = op.len() - self.offset;
        let take = available.min(max);
        let piece = match op {
            DeltaOp::Retain { attributes, .. } => DeltaOp::Retain {
                retain: take,
                attributes: attributes.clone(),
            },
            DeltaOp::Delete { .. } => DeltaOp::Delete { delete: take },
            DeltaOp::Insert { insert, attributes } => {
                let content = match insert {
                    InsertContent::Text(s) => InsertContent::Text(substr(s, self.offset, take)),
                    InsertContent::Embed(map) => InsertContent::Embed(map.clone()),
                };
                DeltaOp::Insert {
                    insert: content,
                    attributes: attributes.clone(),
                }
            }
        };
        self.offset += take;
        self.skip_empty();
        piece
    }
}
