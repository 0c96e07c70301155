use ts_core::TileExpr;


/// A function callable from kernel bodies, e.g. `max(in0, in1)`
pub trait Intrinsic: Send + Sync {
    /// Name used at call sites
    fn name(&self) -> &'static str;

    /// Number of arguments taken
    fn arity(&self) -> usize;

    /// Lower already-lowered arguments into tile IR.
    /// `None` when `args` does not match `arity()`.
    fn lower(&self, args: Vec<TileExpr>) -> Option<TileExpr>;
}


/// Static name of an intrinsic, used by `register_intrinsic!`
pub trait RegistrationInfo {
    const NAME: &'static str;
}


/// Wrapper for intrinsic factory functions
pub struct IntrinsicFactory {
    pub name: &'static str,
    pub factory: fn() -> Box<dyn Intrinsic>,
}

// Collect all registered intrinsics
inventory::collect!(IntrinsicFactory);
