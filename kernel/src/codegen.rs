//! Lowering of kernel bodies into device programs.
//!
//! A body is resolved against the kernel's ports and lowered into tile IR
//! ([`TileExpr`]). The same IR is rendered three ways: the vendor-style
//! reader / compute / writer sources, and a single WGSL shader that runs
//! all three stages in one workgroup per core.

use std::collections::HashSet;

use minijinja::{context, Environment};
use serde::Serialize;
use tracing::debug;

use core_types::{ChannelId, DataFormat, TILE_ELEMENTS};
use ts_core::{BinaryOp, KernelBinary, KernelSources, TileExpr, UnaryOp};

use crate::parse::{parse_body, Expr};
use crate::types::{CodegenError, Direction};
use crate::{IntrinsicRegistry, Kernel};

/// Invocations per WGSL workgroup
pub const WGSL_WORKGROUP_SIZE: u32 = 64;

/// u32 words holding one bf16 tile
const TILE_WORDS: usize = TILE_ELEMENTS / 2;

/// Work of a kernel, in tiles, from the tile counts carried by its ports.
///
/// `inputs` / `outputs` are in port order, `None` for an unconnected port.
/// Every port of a kernel must carry the same number of tiles.
pub fn port_tile_count(
    kernel: &Kernel,
    inputs: &[Option<usize>],
    outputs: &[Option<usize>],
) -> Result<usize, CodegenError> {
    let ports = kernel
        .inputs()
        .iter()
        .zip(inputs.iter().chain(std::iter::repeat(&None)))
        .chain(kernel.outputs().iter().zip(outputs.iter().chain(std::iter::repeat(&None))));

    let mut expected: Option<usize> = None;
    for (port, tiles) in ports {
        let Some(found) = *tiles else {
            return Err(CodegenError::UnboundPort { kernel: kernel.name().into(), port: port.name.clone() });
        };
        match expected {
            None => expected = Some(found),
            Some(expected) if expected != found => {
                return Err(CodegenError::TileCountMismatch {
                    kernel: kernel.name().into(),
                    port: port.name.clone(),
                    expected,
                    found,
                });
            }
            Some(_) => {}
        }
    }
    Ok(expected.unwrap_or(0))
}

struct Lowering<'a> {
    kernel: &'a Kernel,
    registry: &'a IntrinsicRegistry,
}

impl Lowering<'_> {
    fn err_port(&self, port: &str, direction: Direction) -> CodegenError {
        CodegenError::UndeclaredPort { kernel: self.kernel.name().into(), port: port.into(), direction }
    }

    fn lower(&self, expr: &Expr) -> Result<TileExpr, CodegenError> {
        Ok(match expr {
            Expr::Port(name) => match self.kernel.input(name) {
                Some(port) => TileExpr::Channel(port.channel()),
                None => return Err(self.err_port(name, Direction::Input)),
            },
            Expr::Literal(v) => TileExpr::Const(*v),
            Expr::Neg(x) => TileExpr::Unary(UnaryOp::Neg, Box::new(self.lower(x)?)),
            Expr::Binary(op, a, b) => TileExpr::Binary(*op, Box::new(self.lower(a)?), Box::new(self.lower(b)?)),
            Expr::Call { name, args } => {
                let kernel = self.kernel.name().to_string();
                let intrinsic = self
                    .registry
                    .get(name)
                    .ok_or_else(|| CodegenError::UnknownIntrinsic { kernel: kernel.clone(), name: name.clone() })?;
                let arity = CodegenError::Arity {
                    kernel,
                    name: name.clone(),
                    expected: intrinsic.arity(),
                    found: args.len(),
                };
                if args.len() != intrinsic.arity() {
                    return Err(arity);
                }
                let args = args.iter().map(|a| self.lower(a)).collect::<Result<Vec<_>, _>>()?;
                intrinsic.lower(args).ok_or(arity)?
            }
        })
    }
}

/// Resolve a kernel body: one expression per output port, in port order.
pub fn lower_body(kernel: &Kernel, registry: &IntrinsicRegistry) -> Result<Vec<(ChannelId, TileExpr)>, CodegenError> {
    let name = || kernel.name().to_string();
    let body = parse_body(kernel.body()).map_err(|source| CodegenError::Parse { kernel: name(), source })?;
    let lowering = Lowering { kernel, registry };

    let mut assigned: Vec<Option<TileExpr>> = vec![None; kernel.outputs().len()];
    for stmt in &body.statements {
        let Some(port) = kernel.output(&stmt.target) else {
            if kernel.input(&stmt.target).is_some() {
                return Err(CodegenError::AssignToInput { kernel: name(), port: stmt.target.clone() });
            }
            return Err(lowering.err_port(&stmt.target, Direction::Output));
        };
        if assigned[port.index].is_some() {
            return Err(CodegenError::DuplicateAssignment { kernel: name(), port: port.name.clone() });
        }
        assigned[port.index] = Some(lowering.lower(&stmt.value)?);
    }

    kernel
        .outputs()
        .iter()
        .zip(assigned)
        .map(|(port, expr)| match expr {
            Some(expr) => Ok((port.channel(), expr)),
            None => Err(CodegenError::UnassignedOutput { kernel: name(), port: port.name.clone() }),
        })
        .collect()
}

/* ------------------------------------------------------------------------- */
/*                              Expression text                              */
/* ------------------------------------------------------------------------- */

fn float_literal(v: f32) -> String {
    // `{:?}` always keeps a decimal point or an exponent
    format!("{v:?}")
}

/// SFPI (vendor compute) rendering over `v_in{i}` locals
fn device_expr(expr: &TileExpr) -> String {
    match expr {
        TileExpr::Channel(c) => format!("v_in{}", c.index()),
        TileExpr::Const(v) => format!("{}f", float_literal(*v)),
        TileExpr::Unary(op, x) => {
            let x = device_expr(x);
            match op {
                UnaryOp::Neg => format!("-({x})"),
                UnaryOp::Abs => format!("sfpi::abs({x})"),
                UnaryOp::Relu => format!("ts_relu({x})"),
            }
        }
        TileExpr::Binary(op, a, b) => {
            let (a, b) = (device_expr(a), device_expr(b));
            match op {
                BinaryOp::Add => format!("({a} + {b})"),
                BinaryOp::Sub => format!("({a} - {b})"),
                BinaryOp::Mul => format!("({a} * {b})"),
                BinaryOp::Div => format!("ts_div({a}, {b})"),
                BinaryOp::Max => format!("ts_max({a}, {b})"),
                BinaryOp::Min => format!("ts_min({a}, {b})"),
            }
        }
    }
}

fn wgsl_expr(expr: &TileExpr) -> String {
    match expr {
        TileExpr::Channel(c) => format!("v_in{}", c.index()),
        TileExpr::Const(v) => float_literal(*v),
        TileExpr::Unary(op, x) => {
            let x = wgsl_expr(x);
            match op {
                UnaryOp::Neg => format!("-({x})"),
                UnaryOp::Abs => format!("abs({x})"),
                UnaryOp::Relu => format!("max({x}, 0.0)"),
            }
        }
        TileExpr::Binary(op, a, b) => {
            let (a, b) = (wgsl_expr(a), wgsl_expr(b));
            match op {
                BinaryOp::Add => format!("({a} + {b})"),
                BinaryOp::Sub => format!("({a} - {b})"),
                BinaryOp::Mul => format!("({a} * {b})"),
                BinaryOp::Div => format!("({a} / {b})"),
                BinaryOp::Max => format!("max({a}, {b})"),
                BinaryOp::Min => format!("min({a}, {b})"),
            }
        }
    }
}

/* ------------------------------------------------------------------------- */
/*                                 Templates                                 */
/* ------------------------------------------------------------------------- */

#[derive(Serialize)]
struct InputCtx<'a> {
    index: usize,
    name: &'a str,
    channel_id: u8,
    binding: usize,
}

#[derive(Serialize)]
struct OutputCtx<'a> {
    index: usize,
    name: &'a str,
    channel_id: u8,
    binding: usize,
    /// dst register slot in the compute stage
    slot: usize,
    expr: String,
}

const TEMPLATES: [(&str, &str); 4] = [
    ("reader", include_str!("../templates/reader.cpp.jinja")),
    ("compute", include_str!("../templates/compute.cpp.jinja")),
    ("writer", include_str!("../templates/writer.cpp.jinja")),
    ("wgsl", include_str!("../templates/kernel.wgsl.jinja")),
];

fn output_ctx<'a>(
    kernel: &'a Kernel,
    compute: &[(ChannelId, TileExpr)],
    render: fn(&TileExpr) -> String,
) -> Vec<OutputCtx<'a>> {
    let n_in = kernel.inputs().len();
    kernel
        .outputs()
        .iter()
        .zip(compute)
        .map(|(p, (_, expr))| OutputCtx {
            index: p.index,
            name: &p.name,
            channel_id: p.channel().0,
            binding: n_in + 1 + p.index,
            slot: n_in + p.index,
            expr: render(expr),
        })
        .collect()
}

fn render_sources(
    kernel: &Kernel,
    compute: &[(ChannelId, TileExpr)],
    format: DataFormat,
    depth: usize,
) -> Result<KernelSources, CodegenError> {
    let n_in = kernel.inputs().len();
    let inputs: Vec<InputCtx> = kernel
        .inputs()
        .iter()
        .map(|p| InputCtx { index: p.index, name: &p.name, channel_id: p.channel().0, binding: p.index })
        .collect();
    let device_outputs = output_ctx(kernel, compute, device_expr);
    let wgsl_outputs = output_ctx(kernel, compute, wgsl_expr);

    let mut env = Environment::new();
    for (name, src) in TEMPLATES {
        env.add_template(name, src).map_err(|e| CodegenError::Render {
            kernel: kernel.name().into(),
            stage: name,
            message: e.to_string(),
        })?;
    }
    let render = |stage: &'static str, ctx: minijinja::Value| -> Result<String, CodegenError> {
        env.get_template(stage)
            .and_then(|t| t.render(ctx))
            .map_err(|e| CodegenError::Render { kernel: kernel.name().into(), stage, message: e.to_string() })
    };

    let format = format.vendor_name();
    let kernel_name = kernel.name();
    Ok(KernelSources {
        reader: render("reader", context! { kernel => kernel_name, format, inputs => &inputs })?,
        compute: render("compute", context! { kernel => kernel_name, depth, inputs => &inputs, outputs => &device_outputs })?,
        writer: render("writer", context! { kernel => kernel_name, format, outputs => &device_outputs })?,
        wgsl: render(
            "wgsl",
            context! {
                kernel => kernel_name,
                depth,
                inputs => &inputs,
                outputs => &wgsl_outputs,
                work_binding => n_in,
                tile_words => TILE_WORDS,
                cb_words => depth * TILE_WORDS,
                workgroup_size => WGSL_WORKGROUP_SIZE,
            },
        )?,
    })
}

/// Generate the device program of `kernel` for channels `cb_depth_tiles` deep.
pub fn compile(kernel: &Kernel, registry: &IntrinsicRegistry, cb_depth_tiles: usize) -> Result<KernelBinary, CodegenError> {
    let compute = lower_body(kernel, registry)?;
    let format = kernel
        .inputs()
        .iter()
        .chain(kernel.outputs())
        .map(|p| p.format)
        .next()
        .unwrap_or(DataFormat::Float16B);
    let sources = render_sources(kernel, &compute, format, cb_depth_tiles)?;

    let used: HashSet<ChannelId> = compute.iter().flat_map(|(_, e)| e.channels()).collect();
    debug!(
        kernel = kernel.name(),
        outputs = compute.len(),
        unused_inputs = kernel.inputs().iter().filter(|p| !used.contains(&p.channel())).count(),
        "kernel lowered"
    );

    Ok(KernelBinary {
        name: kernel.name().to_string(),
        format,
        inputs: kernel.inputs().iter().map(|p| p.channel()).collect(),
        outputs: kernel.outputs().iter().map(|p| p.channel()).collect(),
        compute,
        cb_depth_tiles,
        sources,
    })
}
