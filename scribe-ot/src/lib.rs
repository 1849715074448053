//! # scribe-ot — Operational Transformation engine for rich text
//!
//! Pure delta algebra: no I/O, no async, no clocks. The service crate
//! (`scribe-collab`) layers persistence, locking, and transport on top.
//!
//! ## Model
//!
//! ```text
//! Document  = Delta of inserts only        [{insert:"Hello"}]
//! Edit      = Delta over a base document   [{retain:5},{insert:"!"}]
//!
//! compose   : sequential merge             doc ∘ edit → doc'
//! transform : concurrent re-base           t(a, b) applies b after a
//! invert    : undo against a base          d ∘ invert(d, base) ≡ identity
//! ```
//!
//! ## Modules
//!
//! - [`delta`] — the `Delta`/`DeltaOp` model, normalization, slicing
//! - [`attributes`] — formatting-map compose/transform/invert
//! - [`ot`] — compose, transform, invert, and the catch-up fold

pub mod attributes;
pub mod delta;
pub mod ot;

pub use attributes::AttrMap;
pub use delta::{Delta, DeltaOp, InsertContent};
pub use ot::{transform_through, OtError};
