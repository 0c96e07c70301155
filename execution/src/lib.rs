//! Dataflow graph compiler and runtime.
//!
//! A [`Map`] holds kernels and streams wired port to port. It validates the
//! graph, places kernels on the device's core grid, allocates DRAM buffers
//! and per-core circular buffers, generates device programs and runs them
//! with host↔device transfers.

mod config;
mod error;
mod graph;
mod map;
mod placement;
mod program_cache;

pub use config::{ConfigError, MapConfig};
pub use error::MapError;
pub use graph::{Endpoint, KernelId, PortRef, StreamId};
pub use map::Map;
pub use placement::KernelPlacement;
pub use program_cache::ProgramCache;
