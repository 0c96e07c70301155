use std::path::PathBuf;

use core_types::CoreCoord;
use memory::MemoryError;
use thiserror::Error;
use ts_core::DeviceError;
use ts_kernel::{CodegenError, KernelError};

/// Everything that can go wrong building, compiling or running a `Map`
#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("kernel `{kernel}` has no port `{port}` in that direction")]
    UnknownPort { kernel: String, port: String },

    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    #[error("incomplete graph: `{element}` has {edges} connection(s), expected exactly one")]
    IncompleteGraph { element: String, edges: usize },

    #[error("cycle detected through kernel `{kernel}`")]
    CycleDetected { kernel: String },

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error("core grid exhausted placing `{kernel}`: needs {needed} core(s), {available} left")]
    GridExhausted { kernel: String, needed: usize, available: usize },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("transfer of `{stream}` failed")]
    TransferFailure { stream: String, #[source] source: MemoryError },

    #[error("dispatch of `{kernel}` failed on core {core}: {reason}")]
    DispatchFailure { kernel: String, core: CoreCoord, reason: String },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to write {path}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}
