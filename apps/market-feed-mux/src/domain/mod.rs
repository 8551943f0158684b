//! Domain Layer - Core event and interest types.
//!
//! This layer contains the event records and the interest table with no
//! I/O. Everything here is plain data plus the bookkeeping that keeps the
//! upstream subscription in step with local interest.

/// Event records, subscription kinds and time normalisation.
pub mod event;

/// Interest tracking and outbound subscription messages.
pub mod subscription;
