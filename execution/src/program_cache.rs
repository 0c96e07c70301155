use std::{
    collections::HashMap,
    sync::Arc,
};
use parking_lot::Mutex;
use tracing::debug;

use core_types::DataFormat;
use ts_core::KernelBinary;
use ts_kernel::{compile, CodegenError, IntrinsicRegistry, Kernel};

/// Everything generated code depends on: body, port layout, channel depth
#[derive(Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    body:    Arc<str>,
    inputs:  Vec<(String, DataFormat)>,
    outputs: Vec<(String, DataFormat)>,
    depth:   usize,
}

impl ProgramKey {
    fn new(kernel: &Kernel, depth: usize) -> Self {
        let ports = |ports: &[ts_kernel::Port]| ports.iter().map(|p| (p.name.clone(), p.format)).collect();
        Self {
            body: Arc::from(kernel.body()),
            inputs: ports(kernel.inputs()),
            outputs: ports(kernel.outputs()),
            depth,
        }
    }
}

/// Generated kernel binaries, shared between identical kernels.
///
/// A shared binary keeps the name of the first kernel it was generated for;
/// dispatch reports use the name bound in each `DeviceProgram`.
pub struct ProgramCache {
    registry: IntrinsicRegistry,
    enabled:  bool,
    cache:    Mutex<HashMap<ProgramKey, Arc<KernelBinary>>>,
}

impl ProgramCache {
    pub fn new(enabled: bool) -> Self {
        Self { registry: IntrinsicRegistry::default(), enabled, cache: Mutex::new(HashMap::new()) }
    }

    /// Cached programs were generated against the old registry and are dropped
    pub fn registry_mut(&mut self) -> &mut IntrinsicRegistry {
        self.cache.get_mut().clear();
        &mut self.registry
    }

    pub fn get(&self, kernel: &Kernel, depth: usize) -> Result<Arc<KernelBinary>, CodegenError> {
        if !self.enabled {
            return Ok(Arc::new(compile(kernel, &self.registry, depth)?));
        }
        let key = ProgramKey::new(kernel, depth);

        // cache lookup
        if let Some(b) = self.cache.lock().get(&key) {
            debug!(kernel = kernel.name(), shared_with = %b.name, "program cache hit");
            return Ok(b.clone());
        }

        let binary = Arc::new(compile(kernel, &self.registry, depth)?);
        debug!(kernel = kernel.name(), wgsl = %binary.sources.wgsl, "program generated");
        self.cache.lock().insert(key, binary.clone());
        Ok(binary)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
