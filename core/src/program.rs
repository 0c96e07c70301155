use std::fmt;
use std::sync::Arc;

use core_types::{BufferId, ChannelId, DataFormat};

/// Element-wise unary operators available to compute stages
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
}

/// Element-wise binary operators available to compute stages
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

/// Compute expression over the front tiles of input channels.
///
/// Evaluated element by element, in `f32`, on matching positions of every
/// referenced tile.
#[derive(Clone, Debug, PartialEq)]
pub enum TileExpr {
    Channel(ChannelId),
    Const(f32),
    Unary(UnaryOp, Box<TileExpr>),
    Binary(BinaryOp, Box<TileExpr>, Box<TileExpr>),
}

impl TileExpr {
    pub fn eval(&self, read: &impl Fn(ChannelId) -> f32) -> f32 {
        match self {
            TileExpr::Channel(c) => read(*c),
            TileExpr::Const(v) => *v,
            TileExpr::Unary(op, x) => {
                let x = x.eval(read);
                match op {
                    UnaryOp::Neg => -x,
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Relu => x.max(0.0),
                }
            }
            TileExpr::Binary(op, a, b) => {
                let (a, b) = (a.eval(read), b.eval(read));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Max => a.max(b),
                    BinaryOp::Min => a.min(b),
                }
            }
        }
    }

    /// Channels read by this expression, in first-use order
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut out = Vec::new();
        self.collect_channels(&mut out);
        out
    }

    fn collect_channels(&self, out: &mut Vec<ChannelId>) {
        match self {
            TileExpr::Channel(c) => {
                if !out.contains(c) {
                    out.push(*c);
                }
            }
            TileExpr::Const(_) => {}
            TileExpr::Unary(_, x) => x.collect_channels(out),
            TileExpr::Binary(_, a, b) => {
                a.collect_channels(out);
                b.collect_channels(out);
            }
        }
    }
}

/// Generated sources for the three per-core stages, plus the single-shader
/// variant used by the wgpu backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelSources {
    pub reader: String,
    pub compute: String,
    pub writer: String,
    pub wgsl: String,
}

/// A compiled kernel, independent of the buffers it is bound to.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelBinary {
    pub name: String,
    pub format: DataFormat,
    /// Input channels, in port order
    pub inputs: Vec<ChannelId>,
    /// Output channels, in port order
    pub outputs: Vec<ChannelId>,
    /// One expression per output channel
    pub compute: Vec<(ChannelId, TileExpr)>,
    /// Circular-buffer depth the sources were generated for
    pub cb_depth_tiles: usize,
    pub sources: KernelSources,
}

impl KernelBinary {
    /// WGSL binding slot of the per-workgroup work table.
    /// Inputs come first, then the work table, then outputs.
    pub fn wgsl_work_binding(&self) -> u32 {
        self.inputs.len() as u32
    }
}

/// DRAM buffer a reader or writer stage streams through a channel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: ChannelId,
    pub buffer: BufferId,
}

impl fmt::Display for ChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.channel, self.buffer)
    }
}

/// A kernel binary bound to concrete buffers, ready for dispatch.
///
/// Binaries are shared between identical kernels, so the program carries
/// the name of the kernel instance it was bound for.
#[derive(Clone, Debug)]
pub struct DeviceProgram {
    pub kernel: String,
    pub binary: Arc<KernelBinary>,
    pub inputs: Vec<ChannelBinding>,
    pub outputs: Vec<ChannelBinding>,
}

impl DeviceProgram {
    pub fn name(&self) -> &str {
        &self.kernel
    }
}
