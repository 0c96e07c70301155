use std::fmt;

use core_types::{ChannelId, DataFormat};
use thiserror::Error;

use crate::parse::ParseError;

/// Which way data flows through a port
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Named, typed attachment point of a kernel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub name:      String,
    pub format:    DataFormat,
    pub direction: Direction,
    /// Position within its direction
    pub index:     usize,
}

impl Port {
    /// Circular-buffer channel carrying this port's tiles on a core
    pub fn channel(&self) -> ChannelId {
        match self.direction {
            Direction::Input => ChannelId::input(self.index),
            Direction::Output => ChannelId::output(self.index),
        }
    }
}

/// Errors while describing a kernel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("kernel `{kernel}` already has an {direction} port named `{port}`")]
    DuplicatePort { kernel: String, port: String, direction: Direction },

    #[error("kernel `{kernel}` cannot take more than {max} {direction} ports")]
    TooManyPorts { kernel: String, direction: Direction, max: usize },
}

/// Errors while turning a kernel into a device program
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodegenError {
    #[error("kernel `{kernel}`: invalid body: {source}")]
    Parse { kernel: String, #[source] source: ParseError },

    #[error("kernel `{kernel}`: `{port}` is not a declared {direction} port")]
    UndeclaredPort { kernel: String, port: String, direction: Direction },

    #[error("kernel `{kernel}`: unknown intrinsic `{name}`")]
    UnknownIntrinsic { kernel: String, name: String },

    #[error("kernel `{kernel}`: `{name}` takes {expected} argument(s), {found} given")]
    Arity { kernel: String, name: String, expected: usize, found: usize },

    #[error("kernel `{kernel}`: cannot assign to input port `{port}`")]
    AssignToInput { kernel: String, port: String },

    #[error("kernel `{kernel}`: output port `{port}` is never assigned")]
    UnassignedOutput { kernel: String, port: String },

    #[error("kernel `{kernel}`: output port `{port}` is assigned more than once")]
    DuplicateAssignment { kernel: String, port: String },

    #[error("kernel `{kernel}`: port `{port}` carries {found} tiles, expected {expected}")]
    TileCountMismatch { kernel: String, port: String, expected: usize, found: usize },

    #[error("kernel `{kernel}`: port `{port}` has no connection")]
    UnboundPort { kernel: String, port: String },

    #[error("kernel `{kernel}`: failed to render {stage} source: {message}")]
    Render { kernel: String, stage: &'static str, message: String },
}
