//! Worker registry and placement for Hangar.
//!
//! Provides an in-memory [`InMemoryPool`] that tracks registered workers and
//! their load, and places containers according to a
//! [`PlacementStrategy`](hangar_core::worker::PlacementStrategy).

pub mod pool;

pub use pool::{InMemoryPool, WorkerInfo};
