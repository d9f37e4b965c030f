//! Connection peek matching
//!
//! This module provides:
//! - Filter construction from prefix and regex signatures
//! - The incremental matching loop over a shared, growing buffer
//! - Readers that keep peeked bytes visible to later consumers

pub mod filter;
pub mod matcher;
pub mod source;

pub use filter::{BuildError, Filter, FilterChain, FilterKind, PatternSpec, DEFAULT_MAX_READ};
pub use matcher::{MatchOutcome, PartialRead, PeekMatcher};
pub use source::{read_full, Fill, Recorder, Snapshot};
