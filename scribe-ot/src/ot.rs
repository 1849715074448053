//! Compose, transform, and invert over deltas.
//!
//! These are the concurrency workhorses: `compose` merges sequential edits,
//! `transform` re-bases one of two concurrent edits over the other, and
//! `invert` produces the undo of an edit against its base document. The
//! pair satisfies the diamond property
//!
//! ```text
//!            S
//!          a/ \b
//!          ▼   ▼
//!          •   •
//!  b'=t(a,b)\ /a'=t(b,a)
//!            ▼
//!            S'
//! ```
//!
//! `compose(a, a.transform(b, false)) == compose(b, b.transform(a, true))`
//! for any two deltas `a`, `b` over the same base, so every peer reaches
//! the same state no matter which order the concurrent edits arrive in.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use crate::attributes;
use crate::delta::{Delta, DeltaOp, OpCursor, OpKind};

/// Errors for structurally invalid input. The algebra itself is total over
/// well-formed deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// An edit's base length exceeds the document it is applied to.
    BaseLengthMismatch { base_len: usize, doc_len: usize },
    /// A document operation was handed a delta containing retains/deletes.
    NotADocument,
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::BaseLengthMismatch { base_len, doc_len } => write!(
                f,
                "delta base length {base_len} exceeds document length {doc_len}"
            ),
            OtError::NotADocument => write!(f, "expected an insert-only document delta"),
        }
    }
}

impl std::error::Error for OtError {}

impl Delta {
    /// Merge `other` applied after `self` into one equivalent delta.
    ///
    /// Associative, normalizing, and length-preserving:
    /// `compose(a, b).base_len() == a.base_len()` whenever `b` fits `a`'s
    /// target.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut a = OpCursor::new(self.ops());
        let mut b = OpCursor::new(other.ops());
        let mut out = Delta::new();

        while a.has_next() || b.has_next() {
            if b.peek_kind() == OpKind::Insert {
                // New content from `other` lands untouched.
                out.push(b.next_slice(b.peek_len()));
            } else if a.peek_kind() == OpKind::Delete {
                // Deletions from `self` act on state `other` never saw.
                out.push(a.next_slice(a.peek_len()));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let a_op = a.next_slice(len);
                let b_op = b.next_slice(len);
                match b_op {
                    DeltaOp::Delete { .. } => {
                        // `other` deletes what `self` retained: keep the
                        // delete. If `self` inserted it, both cancel.
                        if matches!(a_op, DeltaOp::Retain { .. }) {
                            out.push(DeltaOp::Delete { delete: len });
                        }
                    }
                    DeltaOp::Retain {
                        attributes: b_attrs,
                        ..
                    } => match a_op {
                        DeltaOp::Insert { insert, attributes } => {
                            out.push(DeltaOp::Insert {
                                insert,
                                attributes: attributes::compose(
                                    attributes.as_ref(),
                                    b_attrs.as_ref(),
                                    false,
                                ),
                            });
                        }
                        DeltaOp::Retain { attributes, .. } => {
                            out.push(DeltaOp::Retain {
                                retain: len,
                                attributes: attributes::compose(
                                    attributes.as_ref(),
                                    b_attrs.as_ref(),
                                    true,
                                ),
                            });
                        }
                        DeltaOp::Delete { .. } => unreachable!("deletes drained above"),
                    },
                    DeltaOp::Insert { .. } => unreachable!("inserts drained above"),
                }
            }
        }

        out.chop()
    }

    /// Re-base `other` so it applies after `self`, where both were made
    /// against the same base state.
    ///
    /// `a_wins` breaks ties at identical insertion positions: when `true`,
    /// `self`'s insertion ends up first in the final text.
    pub fn transform(&self, other: &Delta, a_wins: bool) -> Delta {
        let mut a = OpCursor::new(self.ops());
        let mut b = OpCursor::new(other.ops());
        let mut out = Delta::new();

        while a.has_next() || b.has_next() {
            if a.peek_kind() == OpKind::Insert && (a_wins || b.peek_kind() != OpKind::Insert) {
                // Step over `self`'s insertion; `other` must skip it.
                let skipped = a.next_slice(a.peek_len()).len();
                out.push(DeltaOp::Retain {
                    retain: skipped,
                    attributes: None,
                });
            } else if b.peek_kind() == OpKind::Insert {
                out.push(b.next_slice(b.peek_len()));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let a_op = a.next_slice(len);
                let b_op = b.next_slice(len);
                match (a_op, b_op) {
                    // `self` already deleted this range; nothing left for
                    // `other` to retain or delete.
                    (DeltaOp::Delete { .. }, _) => {}
                    (_, DeltaOp::Delete { .. }) => out.push(DeltaOp::Delete { delete: len }),
                    (
                        DeltaOp::Retain {
                            attributes: a_attrs,
                            ..
                        },
                        DeltaOp::Retain {
                            attributes: b_attrs,
                            ..
                        },
                    ) => out.push(DeltaOp::Retain {
                        retain: len,
                        attributes: attributes::transform(
                            a_attrs.as_ref(),
                            b_attrs.as_ref(),
                            a_wins,
                        ),
                    }),
                    _ => unreachable!("inserts drained above"),
                }
            }
        }

        out.chop()
    }

    /// The delta that undoes `self` on a document that was `base` before
    /// `self` applied.
    pub fn invert(&self, base: &Delta) -> Delta {
        let mut inverted = Delta::new();
        let mut position = 0;
        for op in self.ops() {
            match op {
                DeltaOp::Insert { insert, .. } => {
                    inverted.push(DeltaOp::Delete {
                        delete: insert.len(),
                    });
                }
                DeltaOp::Retain {
                    retain,
                    attributes: None,
                } => {
                    inverted.push(DeltaOp::Retain {
                        retain: *retain,
                        attributes: None,
                    });
                    position += retain;
                }
                DeltaOp::Retain {
                    retain,
                    attributes: Some(attrs),
                } => {
                    // Restore the formatting each underlying run carried.
                    for base_op in base.slice(position, position + retain).into_ops() {
                        let base_attrs = match &base_op {
                            DeltaOp::Insert { attributes, .. } => attributes.as_ref(),
                            _ => None,
                        };
                        inverted.push(DeltaOp::Retain {
                            retain: base_op.len(),
                            attributes: attributes::invert(Some(attrs), base_attrs),
                        });
                    }
                    position += retain;
                }
                DeltaOp::Delete { delete } => {
                    // Resurrect the deleted content verbatim.
                    for base_op in base.slice(position, position + delete).into_ops() {
                        inverted.push(base_op);
                    }
                    position += delete;
                }
            }
        }
        inverted.chop()
    }

    /// Apply an edit to this document, checking that the edit fits.
    pub fn apply(&self, change: &Delta) -> Result<Delta, OtError> {
        if !self.is_document() {
            return Err(OtError::NotADocument);
        }
        if change.base_len() > self.len() {
            return Err(OtError::BaseLengthMismatch {
                base_len: change.base_len(),
                doc_len: self.len(),
            });
        }
        Ok(self.compose(change))
    }
}

/// Thread one incoming op through a run of already-committed ops, oldest
/// first. Each committed op is the earlier one and wins positional ties,
/// so the result is safe to apply after the entire run.
pub fn transform_through(incoming: &Delta, committed: &[Delta]) -> Delta {
    let mut acc = incoming.clone();
    for earlier in committed {
        acc = earlier.transform(&acc, true);
    }
    if !committed.is_empty() {
        log::trace!("transformed op through {} committed ops", committed.len());
    }
    acc
}
