//! Shared leaf crate for the Shrike search coordinator.
//!
//! Holds the pieces every other crate needs: core identifiers and slot
//! hashing (`types`), the scalar value model (`value`), the error taxonomy
//! (`error`), and configuration (`config`).

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::CoordConfig;
pub use error::{CoordError, CoordResult};
pub use types::{slot_for_key, NodeRole, ShardId, SLOT_COUNT};
pub use value::Value;
