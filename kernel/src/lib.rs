pub mod builtin;
pub mod codegen;
pub mod intrinsic;
pub mod parse;
pub mod types;

use std::collections::HashMap;

use core_types::{DataFormat, MAX_PORTS};

pub use codegen::{compile, port_tile_count};
pub use intrinsic::{Intrinsic, IntrinsicFactory, RegistrationInfo};
pub use types::{CodegenError, Direction, KernelError, Port};


/// Register an intrinsic with the inventory system
#[macro_export]
macro_rules! register_intrinsic {
    ($ty:ident) => {
        inventory::submit! {
            $crate::IntrinsicFactory {
                name: <$ty as $crate::RegistrationInfo>::NAME,
                factory: || Box::new($ty::new()),
            }
        }
    };
}


/// A compute node: typed input and output ports plus a body over them.
///
/// Port `i` of a direction is carried by channel `c_in{i}` / `c_out{i}` on
/// every core the kernel is placed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Kernel {
    name:    String,
    inputs:  Vec<Port>,
    outputs: Vec<Port>,
    body:    String,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), inputs: Vec::new(), outputs: Vec::new(), body: String::new() }
    }

    pub fn add_input_port(&mut self, name: impl Into<String>, format: DataFormat) -> Result<&mut Self, KernelError> {
        self.add_port(name.into(), format, Direction::Input)
    }

    pub fn add_output_port(&mut self, name: impl Into<String>, format: DataFormat) -> Result<&mut Self, KernelError> {
        self.add_port(name.into(), format, Direction::Output)
    }

    fn add_port(&mut self, name: String, format: DataFormat, direction: Direction) -> Result<&mut Self, KernelError> {
        let kernel = self.name.clone();
        let ports = match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        };
        if ports.iter().any(|p| p.name == name) {
            return Err(KernelError::DuplicatePort { kernel, port: name, direction });
        }
        if ports.len() == MAX_PORTS {
            return Err(KernelError::TooManyPorts { kernel, direction, max: MAX_PORTS });
        }
        let index = ports.len();
        ports.push(Port { name, format, direction, index });
        Ok(self)
    }

    /// Store the compute body. It is parsed when device code is generated.
    pub fn set_compute_kernel(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn input(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }
}


/// Holds every intrinsic callable from kernel bodies
pub struct IntrinsicRegistry {
    map: HashMap<&'static str, Box<dyn Intrinsic>>,
}

impl Default for IntrinsicRegistry {
    fn default() -> Self {
        let mut reg = Self::new();
        reg.collect_inventory();
        reg
    }
}

impl IntrinsicRegistry {
    /// Empty registry; see `Default` for one holding the builtins
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn collect_inventory(&mut self) {
        for factory in inventory::iter::<IntrinsicFactory> {
            self.register_boxed(factory.name, (factory.factory)());
        }
    }

    /// Register a new intrinsic under its own name
    pub fn register<I: Intrinsic + 'static>(&mut self, intrinsic: I) {
        let name = intrinsic.name();
        self.map.insert(name, Box::new(intrinsic));
    }

    pub fn register_boxed(&mut self, name: &'static str, intrinsic: Box<dyn Intrinsic>) {
        self.map.insert(name, intrinsic);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Intrinsic> {
        self.map.get(name).map(|b| b.as_ref())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use ts_core::{BinaryOp, TileExpr};

    const F: DataFormat = DataFormat::Float16B;

    #[test]
    fn ports_get_channels_in_declaration_order() {
        let mut k = Kernel::new("saxpy");
        k.add_input_port("in0", F).unwrap()
            .add_input_port("in1", F).unwrap()
            .add_output_port("out0", F).unwrap();
        assert_eq!(k.inputs().len(), 2);
        assert_eq!(k.input("in1").unwrap().channel().to_string(), "c_in1");
        assert_eq!(k.output("out0").unwrap().channel().to_string(), "c_out0");
        assert!(k.output("in0").is_none());
    }

    #[test]
    fn duplicate_port_names_are_rejected_per_direction() {
        let mut k = Kernel::new("k");
        k.add_input_port("x", F).unwrap();
        assert_eq!(
            k.add_input_port("x", F).unwrap_err(),
            KernelError::DuplicatePort { kernel: "k".into(), port: "x".into(), direction: Direction::Input }
        );
        // same name in the other direction is a different port
        assert!(k.add_output_port("x", F).is_ok());
    }

    #[test]
    fn at_most_eight_ports_per_direction() {
        let mut k = Kernel::new("wide");
        for i in 0..MAX_PORTS {
            k.add_input_port(format!("in{i}"), F).unwrap();
        }
        assert!(matches!(k.add_input_port("in8", F), Err(KernelError::TooManyPorts { max: 8, .. })));
        assert!(k.add_output_port("out0", F).is_ok());
    }

    #[test]
    fn body_is_stored_verbatim() {
        let mut k = Kernel::new("k");
        k.set_compute_kernel("\n  out0 = in2;\n");
        assert_eq!(k.body(), "\n  out0 = in2;\n");
    }

    struct Square;

    impl Intrinsic for Square {
        fn name(&self) -> &'static str { "square" }
        fn arity(&self) -> usize { 1 }
        fn lower(&self, args: Vec<TileExpr>) -> Option<TileExpr> {
            let [x]: [TileExpr; 1] = args.try_into().ok()?;
            Some(TileExpr::Binary(BinaryOp::Mul, Box::new(x.clone()), Box::new(x)))
        }
    }

    #[test]
    fn registry_collects_builtins() {
        let mut reg = IntrinsicRegistry::default();
        for name in ["max", "min", "abs", "relu"] {
            assert!(reg.get(name).is_some(), "missing builtin {name}");
        }
        assert_eq!(reg.get("max").map(|i| i.arity()), Some(2));
        assert!(reg.get("extremely_strange_op").is_none());

        reg.register(Square);
        assert_eq!(reg.len(), 5);
        assert!(IntrinsicRegistry::new().is_empty());
    }
}
