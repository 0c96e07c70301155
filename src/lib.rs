//! Stream/kernel dataflow graphs compiled onto a tiled multi-core accelerator.
//!
//! Re-exports the workspace members under one roof.

pub use core_types;
pub use execution;
pub use memory;
pub use stream;
pub use ts_core;
pub use ts_kernel;

pub use core_types::DataFormat;
pub use execution::{Map, MapConfig, MapError};
pub use stream::Stream;
pub use ts_core::{Device, GpuContext, SimConfig, SimDevice};
pub use ts_kernel::Kernel;
