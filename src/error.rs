//! Error taxonomy for the navigation core.
//!
//! Three classes are distinguished so callers can branch on failure kind
//! rather than string-matching: a precondition error means the caller asked
//! for something impossible and the command is dropped as a no-op; a soft
//! navigation failure means the request was well-formed but no path exists
//! right now; a transient resource failure means an allocator/worker-slot
//! was exhausted and the caller should retry (the core itself falls back to
//! inline execution rather than surfacing these to scripts).

use thiserror::Error;

/// Errors surfaced by the internal, fallible corners of the core.
///
/// Command-boundary precondition errors are *not* routed through this type —
/// they are dropped silently and never reach a caller. This enum covers the
/// internal operations (tile conversion, routing, save/load) that do need a
/// typed `Result`.
#[derive(Debug, Error)]
pub enum NavError {
    /// A world-space point or tile descriptor falls outside the map bounds.
    #[error("position {x}, {z} is outside the map bounds")]
    OutOfBounds {
        /// World-space X coordinate.
        x: f32,
        /// World-space Z coordinate.
        z: f32,
    },

    /// The caller referenced an agent UID the core has no `Movestate` for.
    #[error("unknown agent uid {0}")]
    UnknownAgent(u32),

    /// No pathable route exists between the source and destination chunk at
    /// snapshot time. Recoverable: the agent enters `Waiting` and retries.
    #[error("no path from chunk {from:?} to {to:?}")]
    NoPath {
        /// Source chunk coordinate.
        from: (u32, u32),
        /// Destination chunk coordinate.
        to: (u32, u32),
    },

    /// A field build could not reach any finite-cost cell (debug-asserted
    /// upstream; surfaced here only to tests that want to observe it).
    #[error("integration field for {0:?} never reached a target cell")]
    UnreachableField(crate::field::FieldId),

    /// A fixed-capacity resource (worker slot, task queue) was exhausted.
    /// Functional correctness is preserved by the caller running the work
    /// inline; this variant exists for observability/tests.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Savefile I/O or (de)serialization failure.
    #[error("save/load failed: {0}")]
    Save(#[from] SaveError),
}

/// Savefile-specific failure, kept distinct from [`NavError`] so `save.rs`
/// can stay free of the wider error enum's variants.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Underlying file I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `bincode` (de)serialization error.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Convenience alias used throughout the crate.
pub type NavResult<T> = Result<T, NavError>;
