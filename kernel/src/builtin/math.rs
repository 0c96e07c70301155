use ts_core::{BinaryOp, TileExpr, UnaryOp};

use crate::intrinsic::{Intrinsic, RegistrationInfo};
use crate::register_intrinsic;

fn unary(op: UnaryOp, args: Vec<TileExpr>) -> Option<TileExpr> {
    let [x]: [TileExpr; 1] = args.try_into().ok()?;
    Some(TileExpr::Unary(op, Box::new(x)))
}

fn binary(op: BinaryOp, args: Vec<TileExpr>) -> Option<TileExpr> {
    let [a, b]: [TileExpr; 2] = args.try_into().ok()?;
    Some(TileExpr::Binary(op, Box::new(a), Box::new(b)))
}


/// `max(a, b)`, element-wise
#[derive(Default)]
pub struct MaxIntrinsic;

impl MaxIntrinsic {
    pub fn new() -> Self { Self }
}

impl RegistrationInfo for MaxIntrinsic {
    const NAME: &'static str = "max";
}

impl Intrinsic for MaxIntrinsic {
    fn name(&self) -> &'static str { Self::NAME }
    fn arity(&self) -> usize { 2 }
    fn lower(&self, args: Vec<TileExpr>) -> Option<TileExpr> { binary(BinaryOp::Max, args) }
}


/// `min(a, b)`, element-wise
#[derive(Default)]
pub struct MinIntrinsic;

impl MinIntrinsic {
    pub fn new() -> Self { Self }
}

impl RegistrationInfo for MinIntrinsic {
    const NAME: &'static str = "min";
}

impl Intrinsic for MinIntrinsic {
    fn name(&self) -> &'static str { Self::NAME }
    fn arity(&self) -> usize { 2 }
    fn lower(&self, args: Vec<TileExpr>) -> Option<TileExpr> { binary(BinaryOp::Min, args) }
}


/// `abs(x)`
#[derive(Default)]
pub struct AbsIntrinsic;

impl AbsIntrinsic {
    pub fn new() -> Self { Self }
}

impl RegistrationInfo for AbsIntrinsic {
    const NAME: &'static str = "abs";
}

impl Intrinsic for AbsIntrinsic {
    fn name(&self) -> &'static str { Self::NAME }
    fn arity(&self) -> usize { 1 }
    fn lower(&self, args: Vec<TileExpr>) -> Option<TileExpr> { unary(UnaryOp::Abs, args) }
}


/// `relu(x)` = `max(x, 0)`
#[derive(Default)]
pub struct ReluIntrinsic;

impl ReluIntrinsic {
    pub fn new() -> Self { Self }
}

impl RegistrationInfo for ReluIntrinsic {
    const NAME: &'static str = "relu";
}

impl Intrinsic for ReluIntrinsic {
    fn name(&self) -> &'static str { Self::NAME }
    fn arity(&self) -> usize { 1 }
    fn lower(&self, args: Vec<TileExpr>) -> Option<TileExpr> { unary(UnaryOp::Relu, args) }
}

register_intrinsic!(MaxIntrinsic);
register_intrinsic!(MinIntrinsic);
register_intrinsic!(AbsIntrinsic);
register_intrinsic!(ReluIntrinsic);
