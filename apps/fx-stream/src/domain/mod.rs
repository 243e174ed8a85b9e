//! Domain Layer - Core tick types and stream state.
//!
//! Pure types and state machines for FX tick ingestion. Nothing here
//! performs I/O; the application layer drives these types from the
//! receive loop.

/// Currency pairs, ticks and sequence gaps.
pub mod tick;

/// Provider payload to tick normalization.
pub mod normalizer;

/// Active pair set and provider channel mapping.
pub mod subscription;

/// Connection lifecycle state machine.
pub mod connection;

/// Bounded drop-oldest tick buffers and consumer fan-out.
pub mod buffer;
