use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use core_types::{BufferId, MemoryTier};
use memory::{CircularBufferManager, MemoryManager};
use stream::Stream;
use ts_core::{ChannelBinding, Device, DeviceError, DeviceProgram, KernelBinary};
use ts_kernel::{port_tile_count, CodegenError, IntrinsicRegistry, Kernel};

use crate::graph::{Dst, Src};
use crate::placement::{CoreAllocator, KernelPlacement};
use crate::{KernelId, MapConfig, MapError, ProgramCache, StreamId};

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(0);

struct Launch {
    kernel: usize,
    program: DeviceProgram,
    placement: KernelPlacement,
}

/// Device-side state of a generated map
struct Compiled {
    /// Handle the allocations are released through when the map drops
    device: Box<dyn Device>,
    stream_buffers: Vec<BufferId>,
    launches: Vec<Launch>,
}

/// A dataflow graph of kernels and streams, and its compiled form on a device.
///
/// The device is passed to every operation that touches it. Device memory
/// is held from [`Map::generate_device_kernels`] until [`Map::release`], the
/// next generation, or the map being dropped.
pub struct Map {
    pub(crate) id: u64,
    config: MapConfig,
    pub(crate) kernels: Vec<Kernel>,
    pub(crate) streams: Vec<Stream>,
    pub(crate) labels: Vec<Option<String>>,
    pub(crate) edges: Vec<crate::graph::Edge>,
    programs: ProgramCache,
    memory: MemoryManager,
    cbs: CircularBufferManager,
    compiled: Option<Compiled>,
    stale: bool,
}

impl Map {
    pub fn new(config: MapConfig) -> Self {
        Self {
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            programs: ProgramCache::new(config.program_cache),
            config,
            kernels: Vec::new(),
            streams: Vec::new(),
            labels: Vec::new(),
            edges: Vec::new(),
            memory: MemoryManager::new(core_types::DataFormat::Float16B),
            cbs: CircularBufferManager::new(),
            compiled: None,
            stale: false,
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Intrinsics available to kernel bodies; register custom ones here.
    ///
    /// Generated programs may depend on any intrinsic, so this drops them
    /// and the next execution regenerates.
    pub fn registry_mut(&mut self) -> &mut IntrinsicRegistry {
        self.invalidate();
        self.programs.registry_mut()
    }

    pub fn add_kernel(&mut self, kernel: Kernel) -> KernelId {
        self.kernels.push(kernel);
        self.invalidate();
        KernelId { map: self.id, index: self.kernels.len() - 1 }
    }

    pub fn add_stream(&mut self, stream: Stream) -> StreamId {
        self.streams.push(stream);
        self.labels.push(None);
        self.invalidate();
        StreamId { map: self.id, index: self.streams.len() - 1 }
    }

    /// Like [`Map::add_stream`], with a label used in errors, logs and DOT
    pub fn add_named_stream(&mut self, name: impl Into<String>, stream: Stream) -> StreamId {
        let id = self.add_stream(stream);
        self.labels[id.index] = Some(name.into());
        id
    }

    pub(crate) fn invalidate(&mut self) {
        if self.compiled.is_some() {
            self.stale = true;
        }
    }

    pub fn kernel(&self, id: KernelId) -> Option<&Kernel> {
        (id.map == self.id).then(|| self.kernels.get(id.index)).flatten()
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        (id.map == self.id).then(|| self.streams.get(id.index)).flatten()
    }

    /// Move a stream's data out, leaving an empty stream of the same shape
    pub fn take_stream(&mut self, id: StreamId) -> Option<Stream> {
        if id.map != self.id {
            return None;
        }
        let slot = self.streams.get_mut(id.index)?;
        let empty = Stream::new(Vec::new(), slot.element_count(), slot.format());
        Some(std::mem::replace(slot, empty))
    }

    pub fn is_generated(&self) -> bool {
        self.compiled.is_some() && !self.stale
    }

    /// Cores and work split of a generated kernel
    pub fn placement(&self, id: KernelId) -> Option<&KernelPlacement> {
        if id.map != self.id {
            return None;
        }
        let compiled = self.compiled.as_ref()?;
        compiled.launches.iter().find(|l| l.kernel == id.index).map(|l| &l.placement)
    }

    /// DRAM buffer backing a stream once generated
    pub fn stream_buffer(&self, id: StreamId) -> Option<BufferId> {
        let compiled = self.compiled.as_ref()?;
        (id.map == self.id).then(|| compiled.stream_buffers.get(id.index).copied()).flatten()
    }

    /// Number of distinct generated programs
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /* --------------------------------------------------------------------- */
    /* Generation                                                            */
    /* --------------------------------------------------------------------- */

    /// Tiles processed by kernel `k`; producers of `k` must already be known.
    fn kernel_tiles(&self, k: usize, tiles: &[usize]) -> Result<usize, MapError> {
        let kernel = &self.kernels[k];
        let inputs: Vec<Option<usize>> = (0..kernel.inputs().len())
            .map(|i| {
                self.input_edge(k, i).map(|e| match self.edges[e].src {
                    Src::Stream(s) => self.streams[s].tile_count(),
                    Src::Output { kernel: producer, .. } => tiles[producer],
                })
            })
            .collect();
        // outputs into streams are fixed by the stream; outputs into kernels
        // carry whatever this kernel produces
        let outputs: Vec<Option<Option<usize>>> = (0..kernel.outputs().len())
            .map(|j| {
                self.output_edge(k, j).map(|e| match self.edges[e].dst {
                    Dst::Stream(s) => Some(self.streams[s].tile_count()),
                    Dst::Input { .. } => None,
                })
            })
            .collect();
        let own = inputs
            .iter()
            .flatten()
            .chain(outputs.iter().flatten().flatten())
            .next()
            .copied()
            .unwrap_or(0);
        let outputs: Vec<Option<usize>> = outputs.into_iter().map(|o| o.map(|t| t.unwrap_or(own))).collect();
        Ok(port_tile_count(kernel, &inputs, &outputs)?)
    }

    /// Validate, place, allocate and generate device programs.
    ///
    /// Releases whatever a previous generation held. On failure nothing stays
    /// allocated.
    pub fn generate_device_kernels(&mut self, device: &dyn Device) -> Result<(), MapError> {
        self.release(device);
        let order = self.topological_order()?;
        info!(kernels = self.kernels.len(), streams = self.streams.len(), device = %device.info().name, "generating device kernels");
        for (s, stream) in self.streams.iter().enumerate() {
            info!(stream = %self.stream_name(s), count = stream.element_count(), n_tiles = stream.tile_count());
        }

        let mut tiles = vec![0usize; self.kernels.len()];
        for &k in &order {
            tiles[k] = self.kernel_tiles(k, &tiles)?;
        }

        let mut cores = CoreAllocator::new(device.info().grid);
        let mut placements = Vec::with_capacity(order.len());
        for &k in &order {
            let placement = cores.place(self.kernels[k].name(), tiles[k], self.config.cores_per_kernel)?;
            placements.push((k, placement));
        }

        let depth = self.config.cb_depth_tiles;
        let binaries = order
            .iter()
            .map(|&k| self.programs.get(&self.kernels[k], depth))
            .collect::<Result<Vec<Arc<KernelBinary>>, CodegenError>>()?;

        match self.allocate(device, &tiles, placements, binaries) {
            Ok(compiled) => {
                info!(
                    buffers = self.memory.live(),
                    dram = self.memory.used(MemoryTier::Dram),
                    circular_buffers = self.cbs.len(),
                    programs = self.programs.len(),
                    "device kernels generated"
                );
                self.compiled = Some(compiled);
                self.stale = false;
                Ok(())
            }
            Err(e) => {
                self.memory.release_all(device);
                self.cbs.release_all(device);
                Err(e)
            }
        }
    }

    fn allocate(
        &self,
        device: &dyn Device,
        tiles: &[usize],
        placements: Vec<(usize, KernelPlacement)>,
        binaries: Vec<Arc<KernelBinary>>,
    ) -> Result<Compiled, MapError> {
        let dram = |n_tiles: usize| {
            self.memory
                .allocate_tiles(device, n_tiles.max(1), core_types::DataFormat::Float16B, MemoryTier::Dram)
        };

        let stream_buffers = self
            .streams
            .iter()
            .map(|s| dram(s.tile_count()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut edge_buffers = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            let buffer = match (edge.src, edge.dst) {
                (Src::Stream(s), _) | (_, Dst::Stream(s)) => stream_buffers[s],
                (Src::Output { kernel, .. }, Dst::Input { .. }) => dram(tiles[kernel])?,
            };
            edge_buffers.push(buffer);
        }

        let depth = self.config.cb_depth_tiles;
        let mut launches = Vec::with_capacity(placements.len());
        for ((k, placement), binary) in placements.into_iter().zip(binaries) {
            let kernel = &self.kernels[k];
            for port in kernel.inputs().iter().chain(kernel.outputs()) {
                self.cbs.create(device, &placement.cores, port.channel(), depth, port.format)?;
            }

            let unbound = |port: &str| CodegenError::UnboundPort { kernel: kernel.name().into(), port: port.into() };
            let mut inputs = Vec::with_capacity(kernel.inputs().len());
            for port in kernel.inputs() {
                let e = self.input_edge(k, port.index).ok_or_else(|| unbound(&port.name))?;
                inputs.push(ChannelBinding { channel: port.channel(), buffer: edge_buffers[e] });
            }
            let mut outputs = Vec::with_capacity(kernel.outputs().len());
            for port in kernel.outputs() {
                let e = self.output_edge(k, port.index).ok_or_else(|| unbound(&port.name))?;
                outputs.push(ChannelBinding { channel: port.channel(), buffer: edge_buffers[e] });
            }
            debug!(kernel = kernel.name(), ?inputs, ?outputs, "program bound");

            let program = DeviceProgram { kernel: kernel.name().to_string(), binary, inputs, outputs };
            launches.push(Launch { kernel: k, program, placement });
        }

        Ok(Compiled { device: device.share(), stream_buffers, launches })
    }

    /* --------------------------------------------------------------------- */
    /* Execution                                                             */
    /* --------------------------------------------------------------------- */

    /// Upload sources, run every kernel, download sinks.
    ///
    /// Generates first if the graph changed since the last generation.
    /// The first failure aborts the run.
    pub fn execute(&mut self, device: &dyn Device) -> Result<(), MapError> {
        if !self.is_generated() {
            self.generate_device_kernels(device)?;
        }
        let Some(compiled) = self.compiled.as_ref() else {
            return Err(MapError::InvalidConnection("map holds no generated program".into()));
        };

        // 1) sources
        for (s, stream) in self.streams.iter().enumerate() {
            if stream.element_count() > 0 && matches!(self.stream_edge(s).map(|e| e.src), Some(Src::Stream(_))) {
                let buffer = compiled.stream_buffers[s];
                self.memory
                    .write(device, buffer, &stream.padded_bytes())
                    .map_err(|source| MapError::TransferFailure { stream: self.stream_name(s), source })?;
                debug!(stream = %self.stream_name(s), %buffer, "source uploaded");
            }
        }

        // 2) kernels, producers first
        for launch in &compiled.launches {
            let first = launch.placement.cores.first().copied().unwrap_or_default();
            device.run(&launch.program, &launch.placement.work).map_err(|e| match e {
                DeviceError::Dispatch { kernel, core, reason } => MapError::DispatchFailure { kernel, core, reason },
                other => MapError::DispatchFailure {
                    kernel: launch.program.name().to_string(),
                    core: first,
                    reason: other.to_string(),
                },
            })?;
            debug!(kernel = launch.program.name(), cores = launch.placement.cores.len(), "kernel dispatched");
        }

        // 3) wait
        device.finish()?;

        // 4) sinks
        for s in 0..self.streams.len() {
            if self.streams[s].element_count() == 0
                || !matches!(self.stream_edge(s).map(|e| e.dst), Some(Dst::Stream(_)))
            {
                continue;
            }
            let buffer = compiled.stream_buffers[s];
            let mut bytes = vec![0u8; self.streams[s].byte_size() as usize];
            self.memory
                .read(device, buffer, &mut bytes)
                .map_err(|source| MapError::TransferFailure { stream: self.stream_name(s), source })?;
            self.streams[s].store_download(&bytes);
            debug!(stream = %self.stream_name(s), %buffer, "sink downloaded");
        }
        info!(kernels = compiled.launches.len(), "execution complete");
        Ok(())
    }

    /// Free every buffer and circular buffer held on `device`
    pub fn release(&mut self, device: &dyn Device) {
        self.memory.release_all(device);
        self.cbs.release_all(device);
        self.compiled = None;
        self.stale = false;
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if let Some(compiled) = self.compiled.take() {
            let device = compiled.device.as_ref();
            self.memory.release_all(device);
            self.cbs.release_all(device);
            debug!(map = self.id, device = %device.info().name, "device memory released on drop");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{CoreCoord, DataFormat, GridSize};
    use half::bf16;
    use memory::MemoryError;
    use ts_core::{Fault, SimConfig, SimDevice};

    const F: DataFormat = DataFormat::Float16B;

    fn kernel(name: &str, n_in: usize, body: &str) -> Kernel {
        let mut k = Kernel::new(name);
        for i in 0..n_in {
            k.add_input_port(format!("in{i}"), F).unwrap();
        }
        k.add_output_port("out0", F).unwrap();
        k.set_compute_kernel(body);
        k
    }

    /// Three constant sources into `body`, one sink
    fn reference(config: MapConfig, count: usize, body: &str) -> (Map, KernelId, [StreamId; 4]) {
        let mut map = Map::new(config);
        let k = map.add_kernel(kernel("saxpy", 3, body));
        let s0 = map.add_stream(Stream::constant(1.0, count));
        let s1 = map.add_stream(Stream::constant(2.0, count));
        let s2 = map.add_stream(Stream::constant(4.0, count));
        let sink = map.add_stream(Stream::constant(-9.0, count));
        map.add_connection(s0, k.port("in0")).unwrap();
        map.add_connection(s1, k.port("in1")).unwrap();
        map.add_connection(s2, k.port("in2")).unwrap();
        map.add_connection(k.port("out0"), sink).unwrap();
        (map, k, [s0, s1, s2, sink])
    }

    #[test]
    fn reference_graph_selects_third_input() {
        let dev = SimDevice::new(0);
        let (mut map, _, [.., sink]) = reference(MapConfig::default(), 2048, "\n        out0 = in2;\n    ");
        map.execute(&dev).unwrap();
        let out = map.stream(sink).unwrap();
        assert_eq!(out.data().len(), 2048);
        assert!(out.values().iter().all(|v| *v == bf16::from_f32(4.0)));
        assert_eq!(dev.launches(), 1);
        // 4 stream buffers, 4 channels on one core
        assert_eq!(dev.live_buffers(), 4);
        assert_eq!(dev.live_circular_buffers(), 4);
    }

    #[test]
    fn arithmetic_bodies() {
        let dev = SimDevice::new(0);
        let (mut map, _, [.., sink]) = reference(MapConfig::default(), 1024, "out0 = in0 + in1 * in2 - max(in1, 3) / 2;");
        map.execute(&dev).unwrap();
        // 1 + 8 - 1.5
        assert_eq!(map.stream(sink).unwrap().to_f32(), vec![7.5; 1024]);
    }

    #[test]
    fn identity_returns_padded_source() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let k = map.add_kernel(kernel("id", 1, "out0 = in0;"));
        let ramp: Vec<f32> = (0..1500).map(|i| (i % 256) as f32).collect();
        let src = map.add_stream(Stream::from_f32(&ramp));
        let dst = map.add_stream(Stream::constant(-1.0, 1500));
        map.add_connection(src, k.port("in0")).unwrap();
        map.add_connection(k.port("out0"), dst).unwrap();
        map.execute(&dev).unwrap();

        let expected: Vec<bf16> = bytemuck_cast(&map.stream(src).unwrap().padded_bytes());
        let out = map.take_stream(dst).unwrap();
        assert_eq!(out.data(), &expected[..]);
        assert_eq!(out.to_f32(), ramp);
        assert!(out.data()[1500..].iter().all(|v| *v == bf16::ZERO));
        assert!(map.stream(dst).unwrap().data().is_empty());
    }

    fn bytemuck_cast(bytes: &[u8]) -> Vec<bf16> {
        bytes.chunks_exact(2).map(|c| bf16::from_le_bytes([c[0], c[1]])).collect()
    }

    #[test]
    fn chained_kernels_use_an_intermediate_buffer() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let double = map.add_kernel(kernel("double", 1, "out0 = in0 * 2;"));
        let inc = map.add_kernel(kernel("inc", 1, "out0 = in0 + 1;"));
        let src = map.add_stream(Stream::constant(3.0, 3000));
        let dst = map.add_stream(Stream::zeros(3000));
        map.add_connection(inc.port("out0"), dst).unwrap();
        map.add_connection(double.port("out0"), inc.port("in0")).unwrap();
        map.add_connection(src, double.port("in0")).unwrap();
        map.execute(&dev).unwrap();

        assert_eq!(map.stream(dst).unwrap().to_f32(), vec![7.0; 3000]);
        assert_eq!(dev.live_buffers(), 3);
        assert_eq!(map.placement(double).unwrap().cores, vec![CoreCoord::new(0, 0)]);
        assert_eq!(map.placement(inc).unwrap().cores, vec![CoreCoord::new(1, 0)]);
    }

    #[test]
    fn work_is_split_over_cores() {
        let dev = SimDevice::new(0);
        let config = MapConfig { cores_per_kernel: 4, ..MapConfig::default() };
        let (mut map, k, [.., sink]) = reference(config, 10 * 1024, "out0 = in0 + in2;");
        map.execute(&dev).unwrap();

        let placement = map.placement(k).unwrap();
        let split: Vec<(usize, usize)> = placement.work.iter().map(|w| (w.start_tile, w.num_tiles)).collect();
        assert_eq!(split, vec![(0, 2), (2, 2), (4, 2), (6, 4)]);
        assert_eq!(map.stream(sink).unwrap().to_f32(), vec![5.0; 10 * 1024]);
    }

    #[test]
    fn identical_kernels_share_a_program() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let a = map.add_kernel(kernel("a", 1, "out0 = in0 * 2;"));
        let b = map.add_kernel(kernel("b", 1, "out0 = in0 * 2;"));
        let s: Vec<StreamId> = (0..4).map(|_| map.add_stream(Stream::constant(1.5, 100))).collect();
        map.add_connection(s[0], a.port("in0")).unwrap();
        map.add_connection(a.port("out0"), s[1]).unwrap();
        map.add_connection(s[2], b.port("in0")).unwrap();
        map.add_connection(b.port("out0"), s[3]).unwrap();
        map.execute(&dev).unwrap();
        assert_eq!(map.program_count(), 1);
        assert_eq!(map.stream(s[3]).unwrap().to_f32(), vec![3.0; 100]);
    }

    #[test]
    fn structural_errors_prevent_allocation() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let k = map.add_kernel(kernel("k", 2, "out0 = in0;"));
        let src = map.add_stream(Stream::zeros(10));
        let dst = map.add_stream(Stream::zeros(10));
        map.add_connection(src, k.port("in0")).unwrap();
        map.add_connection(k.port("out0"), dst).unwrap();
        assert!(matches!(
            map.generate_device_kernels(&dev),
            Err(MapError::IncompleteGraph { element, .. }) if element == "k.in1"
        ));
        assert!(matches!(map.execute(&dev), Err(MapError::IncompleteGraph { .. })));
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.launches(), 0);
    }

    #[test]
    fn tile_count_mismatch_is_a_codegen_error() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let k = map.add_kernel(kernel("k", 2, "out0 = in0 + in1;"));
        let a = map.add_stream(Stream::zeros(1024));
        let b = map.add_stream(Stream::zeros(2048));
        let out = map.add_stream(Stream::zeros(1024));
        map.add_connection(a, k.port("in0")).unwrap();
        map.add_connection(b, k.port("in1")).unwrap();
        map.add_connection(k.port("out0"), out).unwrap();
        assert!(matches!(
            map.generate_device_kernels(&dev),
            Err(MapError::Codegen(CodegenError::TileCountMismatch { port, expected: 1, found: 2, .. })) if port == "in1"
        ));
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn bad_body_is_reported_before_allocation() {
        let dev = SimDevice::new(0);
        let (mut map, ..) = reference(MapConfig::default(), 1024, "out0 = in3;");
        assert!(matches!(map.generate_device_kernels(&dev), Err(MapError::Codegen(CodegenError::UndeclaredPort { .. }))));
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn dram_exhaustion_leaves_nothing_allocated() {
        let dev = SimDevice::with_config(0, SimConfig { dram_bytes: 5 * 2048, ..SimConfig::default() });
        let (mut map, ..) = reference(MapConfig::default(), 2048, "out0 = in2;");
        match map.generate_device_kernels(&dev) {
            Err(MapError::Memory(MemoryError::CapacityExceeded { tier: MemoryTier::Dram, .. })) => {}
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.used(MemoryTier::Dram), 0);
    }

    #[test]
    fn on_chip_exhaustion_names_the_channel() {
        // three 2-tile channels fit, the fourth does not
        let dev = SimDevice::with_config(0, SimConfig { l1_bytes_per_core: 6 * 2048, ..SimConfig::default() });
        let (mut map, ..) = reference(MapConfig::default(), 2048, "out0 = in2;");
        match map.generate_device_kernels(&dev) {
            Err(MapError::Memory(MemoryError::InsufficientOnChipCapacity { core, channel, .. })) => {
                assert_eq!(core, CoreCoord::new(0, 0));
                assert_eq!(channel.to_string(), "c_out0");
            }
            other => panic!("expected InsufficientOnChipCapacity, got {other:?}"),
        }
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.live_circular_buffers(), 0);
    }

    #[test]
    fn grid_exhaustion() {
        let dev = SimDevice::with_config(0, SimConfig { grid: GridSize::new(1, 1), ..SimConfig::default() });
        let mut map = Map::new(MapConfig::default());
        let a = map.add_kernel(kernel("a", 1, "out0 = in0;"));
        let b = map.add_kernel(kernel("b", 1, "out0 = in0;"));
        let src = map.add_stream(Stream::zeros(1));
        let dst = map.add_stream(Stream::zeros(1));
        map.add_connection(src, a.port("in0")).unwrap();
        map.add_connection(a.port("out0"), b.port("in0")).unwrap();
        map.add_connection(b.port("out0"), dst).unwrap();
        assert!(matches!(
            map.generate_device_kernels(&dev),
            Err(MapError::GridExhausted { kernel, needed: 1, available: 0 }) if kernel == "b"
        ));
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn upload_failure_names_the_stream() {
        let dev = SimDevice::new(0);
        let (mut map, _, [_, s1, ..]) = reference(MapConfig::default(), 1024, "out0 = in2;");
        map.generate_device_kernels(&dev).unwrap();
        dev.inject_fault(Fault::Write(map.stream_buffer(s1).unwrap()));
        assert!(matches!(
            map.execute(&dev),
            Err(MapError::TransferFailure { stream, .. }) if stream == "stream1"
        ));
        // aborted before any launch
        assert_eq!(dev.launches(), 0);
    }

    #[test]
    fn download_failure_names_the_sink() {
        let dev = SimDevice::new(0);
        let (mut map, _, [.., sink]) = reference(MapConfig::default(), 1024, "out0 = in2;");
        map.generate_device_kernels(&dev).unwrap();
        dev.inject_fault(Fault::Read(map.stream_buffer(sink).unwrap()));
        assert!(matches!(
            map.execute(&dev),
            Err(MapError::TransferFailure { stream, .. }) if stream == "stream3"
        ));
        assert_eq!(dev.launches(), 1);
    }

    #[test]
    fn dispatch_failure_names_kernel_and_core() {
        let dev = SimDevice::new(0);
        let config = MapConfig { cores_per_kernel: 2, ..MapConfig::default() };
        let (mut map, ..) = reference(config, 2048, "out0 = in2;");
        dev.inject_fault(Fault::Dispatch(CoreCoord::new(1, 0)));
        match map.execute(&dev) {
            Err(MapError::DispatchFailure { kernel, core, .. }) => {
                assert_eq!(kernel, "saxpy");
                assert_eq!(core, CoreCoord::new(1, 0));
            }
            other => panic!("expected DispatchFailure, got {other:?}"),
        }
    }

    #[test]
    fn graph_changes_trigger_regeneration() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let a = map.add_kernel(kernel("a", 1, "out0 = -in0;"));
        let src = map.add_stream(Stream::constant(2.0, 10));
        let dst = map.add_stream(Stream::zeros(10));
        map.add_connection(src, a.port("in0")).unwrap();
        map.add_connection(a.port("out0"), dst).unwrap();
        map.execute(&dev).unwrap();
        assert!(map.is_generated());
        assert_eq!(dev.live_buffers(), 2);

        let b = map.add_kernel(kernel("b", 1, "out0 = abs(in0);"));
        let src2 = map.add_stream(Stream::constant(-3.0, 10));
        let dst2 = map.add_stream(Stream::zeros(10));
        assert!(!map.is_generated());
        map.add_connection(src2, b.port("in0")).unwrap();
        map.add_connection(b.port("out0"), dst2).unwrap();
        map.execute(&dev).unwrap();

        assert_eq!(dev.live_buffers(), 4);
        assert_eq!(map.stream(dst).unwrap().to_f32(), vec![-2.0; 10]);
        assert_eq!(map.stream(dst2).unwrap().to_f32(), vec![3.0; 10]);

        map.release(&dev);
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.live_circular_buffers(), 0);
    }

    #[test]
    fn empty_streams_still_get_a_tile() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let k = map.add_kernel(kernel("k", 1, "out0 = in0 + 1;"));
        let src = map.add_stream(Stream::zeros(0));
        let dst = map.add_stream(Stream::zeros(0));
        map.add_connection(src, k.port("in0")).unwrap();
        map.add_connection(k.port("out0"), dst).unwrap();
        map.execute(&dev).unwrap();
        assert_eq!(dev.used(MemoryTier::Dram), 2 * 2048);
        assert_eq!(map.placement(k).unwrap().work[0].num_tiles, 0);
        assert!(map.stream(dst).unwrap().values().is_empty());
    }

    #[test]
    fn dropping_a_map_frees_the_device() {
        let dev = SimDevice::new(0);
        {
            let (mut map, _, [.., sink]) = reference(MapConfig::default(), 2048, "out0 = in2;");
            map.execute(&dev).unwrap();
            assert_eq!(map.stream(sink).unwrap().to_f32(), vec![4.0; 2048]);
            assert_eq!(dev.live_buffers(), 4);
        }
        assert_eq!(dev.live_buffers(), 0);
        assert_eq!(dev.live_circular_buffers(), 0);
        assert_eq!(dev.used(MemoryTier::Dram), 0);

        // same channels on the same core are free again
        let (mut map, _, [.., sink]) = reference(MapConfig::default(), 2048, "out0 = in0 + in1;");
        map.execute(&dev).unwrap();
        assert_eq!(map.stream(sink).unwrap().to_f32(), vec![3.0; 2048]);
        drop(map);
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn two_live_maps_report_the_channel_clash() {
        let dev = SimDevice::new(0);
        let (mut first, ..) = reference(MapConfig::default(), 1024, "out0 = in2;");
        first.execute(&dev).unwrap();
        let (mut second, ..) = reference(MapConfig::default(), 1024, "out0 = in2;");
        assert!(matches!(
            second.generate_device_kernels(&dev),
            Err(MapError::Memory(MemoryError::ChannelInUse { core, .. })) if core == CoreCoord::new(0, 0)
        ));
        // the failed map left the first one intact
        assert_eq!(dev.live_buffers(), 4);
        first.execute(&dev).unwrap();
    }

    #[test]
    fn deeply_nested_body_is_a_parse_error() {
        let dev = SimDevice::new(0);
        let body = format!("out0 = {}in2{};", "(".repeat(5000), ")".repeat(5000));
        let (mut map, ..) = reference(MapConfig::default(), 1024, &body);
        match map.generate_device_kernels(&dev) {
            Err(MapError::Codegen(CodegenError::Parse { kernel, source })) => {
                assert_eq!(kernel, "saxpy");
                assert!(source.message.contains("nested too deeply"));
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
        assert_eq!(dev.live_buffers(), 0);
    }

    struct DoubledRelu;

    impl ts_kernel::Intrinsic for DoubledRelu {
        fn name(&self) -> &'static str { "relu" }
        fn arity(&self) -> usize { 1 }
        fn lower(&self, args: Vec<ts_core::TileExpr>) -> Option<ts_core::TileExpr> {
            let [x]: [ts_core::TileExpr; 1] = args.try_into().ok()?;
            Some(ts_core::TileExpr::Binary(
                ts_core::BinaryOp::Mul,
                Box::new(x),
                Box::new(ts_core::TileExpr::Const(2.0)),
            ))
        }
    }

    #[test]
    fn registering_an_intrinsic_regenerates() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let k = map.add_kernel(kernel("k", 1, "out0 = relu(in0);"));
        let src = map.add_stream(Stream::constant(-2.0, 10));
        let dst = map.add_stream(Stream::zeros(10));
        map.add_connection(src, k.port("in0")).unwrap();
        map.add_connection(k.port("out0"), dst).unwrap();
        map.execute(&dev).unwrap();
        assert_eq!(map.stream(dst).unwrap().to_f32(), vec![0.0; 10]);
        assert_eq!(map.program_count(), 1);

        map.registry_mut().register(DoubledRelu);
        assert!(!map.is_generated());
        assert_eq!(map.program_count(), 0);
        map.execute(&dev).unwrap();
        assert_eq!(map.stream(dst).unwrap().to_f32(), vec![-4.0; 10]);
    }

    #[test]
    fn labelled_stream_names_transfer_failures() {
        let dev = SimDevice::new(0);
        let mut map = Map::new(MapConfig::default());
        let k = map.add_kernel(kernel("k", 1, "out0 = in0;"));
        let src = map.add_stream(Stream::constant(1.0, 10));
        let dst = map.add_named_stream("result", Stream::zeros(10));
        map.add_connection(src, k.port("in0")).unwrap();
        map.add_connection(k.port("out0"), dst).unwrap();
        map.generate_device_kernels(&dev).unwrap();
        dev.inject_fault(Fault::Read(map.stream_buffer(dst).unwrap()));
        assert!(matches!(
            map.execute(&dev),
            Err(MapError::TransferFailure { stream, .. }) if stream == "result"
        ));
    }

    #[test]
    fn end_to_end_on_gpu() {
        let Ok(gpu) = pollster::block_on(ts_core::GpuContext::new()) else { return };
        let (mut map, _, [.., sink]) = reference(MapConfig::default(), 2048, "out0 = in2;");
        map.execute(&gpu).unwrap();
        assert!(map.stream(sink).unwrap().values().iter().all(|v| *v == bf16::from_f32(4.0)));
        drop(map);

        let config = MapConfig { cores_per_kernel: 3, ..MapConfig::default() };
        let (mut map, _, [.., sink]) = reference(config, 5000, "out0 = relu(in0 - in2) + min(in1, 1.5) * 2;");
        map.execute(&gpu).unwrap();
        assert_eq!(map.stream(sink).unwrap().to_f32(), vec![3.0; 5000]);
        map.release(&gpu);

        // a 2x1 grid holds one 2-core kernel and nothing more
        let small = gpu.with_grid(GridSize::new(2, 1));
        let config = MapConfig { cores_per_kernel: 2, ..MapConfig::default() };
        let (mut map, ..) = reference(config, 4096, "out0 = in2;");
        map.execute(&small).unwrap();
        map.release(&small);
        let mut chain = Map::new(MapConfig::default());
        let a = chain.add_kernel(kernel("a", 1, "out0 = in0;"));
        let b = chain.add_kernel(kernel("b", 1, "out0 = in0;"));
        let c = chain.add_kernel(kernel("c", 1, "out0 = in0;"));
        let src = chain.add_stream(Stream::zeros(1));
        let dst = chain.add_stream(Stream::zeros(1));
        chain.add_connection(src, a.port("in0")).unwrap();
        chain.add_connection(a.port("out0"), b.port("in0")).unwrap();
        chain.add_connection(b.port("out0"), c.port("in0")).unwrap();
        chain.add_connection(c.port("out0"), dst).unwrap();
        assert!(matches!(chain.generate_device_kernels(&small), Err(MapError::GridExhausted { .. })));
    }
}
