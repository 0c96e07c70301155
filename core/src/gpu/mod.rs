mod pipeline;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use wgpu::{
    util::DeviceExt, BindGroupLayoutDescriptor, BindGroupLayoutEntry, ShaderStages, Backends,
    CommandEncoder, CommandEncoderDescriptor, Device, Instance, PollType, ComputePipelineDescriptor,
    PipelineLayoutDescriptor, Queue, ShaderModule, ShaderModuleDescriptor, ShaderSource, ErrorFilter,
    PipelineCompilationOptions, BindGroup, BindGroupEntry, BindGroupDescriptor, ComputePassDescriptor,
};

use core_types::{BufferId, CbHandle, CoreCoord, GridSize, MemoryTier};

use crate::types::{RawBuffer, ChannelLayout, TilePipeline, BufferRole};
use crate::{BufferDesc, CbConfig, CoreWork, DeviceError, DeviceInfo, DeviceProgram};
use pipeline::PipelineCache;

/// Entry point every generated WGSL kernel exposes
pub const WGSL_ENTRY_POINT: &str = "main";

struct GpuBuffer {
    buffer: Arc<RawBuffer>,
    tier: MemoryTier,
}

#[derive(Default)]
struct GpuState {
    next_id: u64,
    buffers: HashMap<BufferId, GpuBuffer>,
    cbs: HashMap<CbHandle, (Vec<CoreCoord>, CbConfig)>,
    used_dram: u64,
    used_l1: u64,
}

/// Context for GPU operations.
///
/// Each placed core becomes one workgroup; circular buffers become
/// workgroup memory, so the per-core L1 budget is the workgroup storage limit.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<Device>,
    pub queue:  Arc<Queue>,
    index: usize,
    name: String,
    grid: GridSize,
    state: Arc<Mutex<GpuState>>,
    pipelines: Arc<PipelineCache>,
}

impl GpuContext {
    /* ------------------------------------------------------------------ */
    /* Construction                                                       */
    /* ------------------------------------------------------------------ */
    pub async fn new() -> Result<Self> {
        Self::with_adapter_index(0).await
    }

    /// Open the `index`-th adapter reported by the instance.
    pub async fn with_adapter_index(index: usize) -> Result<Self> {
        let instance = Instance::default();
        let adapter = match instance.enumerate_adapters(Backends::all()).into_iter().nth(index) {
            Some(adapter) => adapter,
            None if index == 0 => {
                warn!("adapter enumeration is empty, requesting the default adapter");
                instance
                    .request_adapter(&wgpu::RequestAdapterOptions::default())
                    .await
                    .map_err(|e| anyhow::anyhow!("No suitable adapter found: {}", e))?
            }
            None => anyhow::bail!("no adapter with index {index}"),
        };
        let name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await?;
        info!(adapter = %name, index, "gpu device opened");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            index,
            name,
            grid: GridSize::new(8, 8),
            state: Arc::new(Mutex::new(GpuState::default())),
            pipelines: Arc::new(PipelineCache::new()),
        })
    }

    /// Override the virtual core grid (one workgroup per core)
    pub fn with_grid(mut self, grid: GridSize) -> Self {
        self.grid = grid;
        self
    }

    /* ------------------------------------------------------------------ */
    /* Buffers                                                            */
    /* ------------------------------------------------------------------ */

    /// Allocate an uninitialised GPU buffer.
    fn create_raw_buffer(&self, size: u64, role: BufferRole) -> RawBuffer {
        RawBuffer(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: role.into(),
            mapped_at_creation: false,
        }))
    }

    /// Allocate and initialise a GPU buffer from host data.
    fn create_buffer_with_data(&self, data: &[u8], role: BufferRole) -> RawBuffer {
        RawBuffer(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: data,
            usage: role.into(),
        }))
    }

    fn lookup(&self, id: BufferId) -> Result<Arc<RawBuffer>, DeviceError> {
        self.state
            .lock()
            .buffers
            .get(&id)
            .map(|b| b.buffer.clone())
            .ok_or(DeviceError::UnknownBuffer(id))
    }

    /// Map a staging buffer and wait for the mapping to land.
    fn map_blocking(&self, buffer: &RawBuffer, mode: wgpu::MapMode) -> Result<(), String> {
        let (tx, rx) = mpsc::channel();
        buffer.raw().slice(..).map_async(mode, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(PollType::Wait).map_err(|e| e.to_string())?;
        rx.recv().map_err(|e| e.to_string())?.map_err(|e| e.to_string())
    }

    /* ------------------------------------------------------------------ */
    /* Encoder helpers                                                    */
    /* ------------------------------------------------------------------ */
    fn create_encoder(&self, label: &str) -> CommandEncoder {
        self.device
            .create_command_encoder(&CommandEncoderDescriptor { label: Some(label) })
    }

    fn submit_encoder(&self, encoder: CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
    }

    fn copy_buffer_to_buffer(&self, src: &RawBuffer, dst: &RawBuffer, size: u64) {
        let mut enc = self.create_encoder("copy-b2b");
        enc.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, size);
        self.submit_encoder(enc);
    }

    /* ------------------------------------------------------------------ */
    /* Shaders Preprocessing                                              */
    /* ------------------------------------------------------------------ */

    /// Create a storage buffer layout for a compute shader.
    pub(crate) fn create_storage_layout(&self, n_in: usize, n_out: usize) -> Arc<ChannelLayout> {
        let total = n_in + n_out;
        let mut entries: Vec<BindGroupLayoutEntry> = Vec::with_capacity(total);

        for i in 0..total {
            entries.push(BindGroupLayoutEntry {
                binding: i as u32,
                visibility: ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: i < n_in },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let bgl = self.device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("storage-layout"),
            entries: &entries,
        });
        Arc::new(ChannelLayout(bgl))
    }

    /// Create a compute pipeline from WGSL source code.
    pub(crate) fn create_compute_pipeline(
        &self,
        src: &str,
        entry: &str,
        layout: &ChannelLayout,
    ) -> Result<Arc<TilePipeline>, String> {
        self.device.push_error_scope(ErrorFilter::Validation);
        let module: ShaderModule = self.device.create_shader_module(ShaderModuleDescriptor {
            label: Some("wgsl-module"),
            source: ShaderSource::Wgsl(src.into()),
        });
        let pipeline_layout = self.device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("compute-pl-layout"),
            bind_group_layouts: &[layout.raw()],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("compute-pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(entry),
            compilation_options: PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(err.to_string());
        }
        Ok(Arc::new(TilePipeline(pipeline)))
    }

    /* ------------------------------------------------------------------ */
    /* Dispatch                                                           */
    /* ------------------------------------------------------------------ */

    fn create_storage_bind_group(
        &self,
        layout: &ChannelLayout,
        buffers: &[&RawBuffer],
    ) -> BindGroup {
        let entries: Vec<BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| BindGroupEntry {
                binding: i as u32,
                resource: b.raw().as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("storage-bg"),
            layout: layout.raw(),
            entries: &entries,
        })
    }

    fn dispatch_workgroups(
        &self,
        pipeline: &TilePipeline,
        layout: &ChannelLayout,
        buffers: &[&RawBuffer],
        groups: u32,
    ) -> Result<(), String> {
        self.device.push_error_scope(ErrorFilter::Validation);
        let bg = self.create_storage_bind_group(layout, buffers);
        let mut enc = self.create_encoder("dispatch-cores");
        {
            let mut pass = enc.begin_compute_pass(&ComputePassDescriptor::default());
            pass.set_pipeline(pipeline.raw());
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.submit_encoder(enc);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(()),
        }
    }
}

impl crate::Device for GpuContext {
    fn info(&self) -> DeviceInfo {
        let limits = self.device.limits();
        DeviceInfo {
            id: self.index,
            name: self.name.clone(),
            grid: self.grid,
            dram_capacity: limits.max_buffer_size,
            l1_capacity_per_core: limits.max_compute_workgroup_storage_size as u64,
        }
    }

    fn share(&self) -> Box<dyn crate::Device> {
        Box::new(self.clone())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, DeviceError> {
        if desc.size == 0 || desc.page_size == 0 || desc.size % desc.page_size != 0 || desc.size % 4 != 0 {
            return Err(DeviceError::Backend(format!(
                "invalid buffer geometry: {} bytes in pages of {}",
                desc.size, desc.page_size
            )));
        }
        let capacity = crate::Device::info(self).tier_capacity(desc.tier);
        let mut state = self.state.lock();
        let used = match desc.tier {
            MemoryTier::Dram => state.used_dram,
            MemoryTier::L1 => state.used_l1,
        };
        if used + desc.size > capacity {
            return Err(DeviceError::OutOfMemory { tier: desc.tier, requested: desc.size, available: capacity - used });
        }
        let buffer = Arc::new(self.create_raw_buffer(desc.size, BufferRole::Dram));
        match desc.tier {
            MemoryTier::Dram => state.used_dram += desc.size,
            MemoryTier::L1 => state.used_l1 += desc.size,
        }
        let id = BufferId(state.next_id);
        state.next_id += 1;
        state.buffers.insert(id, GpuBuffer { buffer, tier: desc.tier });
        debug!(%id, size = desc.size, tier = %desc.tier, "gpu buffer created");
        Ok(id)
    }

    fn release_buffer(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.buffers.remove(&id) {
            let size = entry.buffer.size();
            match entry.tier {
                MemoryTier::Dram => state.used_dram -= size,
                MemoryTier::L1 => state.used_l1 -= size,
            }
        }
    }

    fn create_circular_buffer(&self, cores: &[CoreCoord], config: &CbConfig) -> Result<CbHandle, DeviceError> {
        let budget = self.device.limits().max_compute_workgroup_storage_size as u64;
        let mut state = self.state.lock();
        for core in cores {
            let mut used = 0;
            for (_, cfg) in state.cbs.values().filter(|(c, _)| c.contains(core)) {
                if cfg.channel == config.channel {
                    return Err(DeviceError::ChannelInUse { core: *core, channel: config.channel });
                }
                used += cfg.total_size;
            }
            if used + config.total_size > budget {
                return Err(DeviceError::OutOfMemory {
                    tier: MemoryTier::L1,
                    requested: config.total_size,
                    available: budget - used,
                });
            }
        }
        let handle = CbHandle(state.next_id);
        state.next_id += 1;
        state.cbs.insert(handle, (cores.to_vec(), *config));
        Ok(handle)
    }

    fn release_circular_buffer(&self, handle: CbHandle) {
        self.state.lock().cbs.remove(&handle);
    }

    /// Raw upload: CPU → staging → GPU.
    fn write_buffer(&self, id: BufferId, data: &[u8], _blocking: bool) -> Result<(), DeviceError> {
        let dst = self.lookup(id)?;
        let size = data.len() as u64;
        if size > dst.size() || size % 4 != 0 {
            return Err(DeviceError::SizeMismatch { buffer: id, buffer_size: dst.size(), transfer_size: size });
        }
        if size == 0 {
            return Ok(());
        }

        // 1) staging upload: map-write, copy, unmap
        let staging = self.create_raw_buffer(size, BufferRole::StagingIn);
        self.map_blocking(&staging, wgpu::MapMode::Write)
            .map_err(|reason| DeviceError::Transfer { buffer: id, reason })?;
        staging.raw().slice(..).get_mapped_range_mut().copy_from_slice(data);
        staging.raw().unmap();

        // 2) copy staging → main, wait for completion
        self.copy_buffer_to_buffer(&staging, &dst, size);
        self.device
            .poll(PollType::Wait)
            .map_err(|e| DeviceError::Transfer { buffer: id, reason: e.to_string() })?;
        Ok(())
    }

    /// Raw download: GPU → staging → CPU.
    fn read_buffer(&self, id: BufferId, out: &mut [u8], _blocking: bool) -> Result<(), DeviceError> {
        let src = self.lookup(id)?;
        let size = out.len() as u64;
        if size > src.size() || size % 4 != 0 {
            return Err(DeviceError::SizeMismatch { buffer: id, buffer_size: src.size(), transfer_size: size });
        }
        if size == 0 {
            return Ok(());
        }

        let staging = self.create_raw_buffer(size, BufferRole::StagingOut);
        self.copy_buffer_to_buffer(&src, &staging, size);
        self.map_blocking(&staging, wgpu::MapMode::Read)
            .map_err(|reason| DeviceError::Transfer { buffer: id, reason })?;
        out.copy_from_slice(&staging.raw().slice(..).get_mapped_range());
        staging.raw().unmap();
        Ok(())
    }

    fn run(&self, program: &DeviceProgram, work: &[CoreWork]) -> Result<(), DeviceError> {
        let Some(first) = work.first() else { return Ok(()) };
        let fail = |core: CoreCoord, reason: String| DeviceError::Dispatch {
            kernel: program.name().to_string(),
            core,
            reason,
        };
        let binary = &program.binary;
        if binary.sources.wgsl.is_empty() {
            return Err(fail(first.core, "program carries no WGSL source".into()));
        }

        // every channel the kernel uses must exist on every placed core
        {
            let state = self.state.lock();
            for w in work {
                for ch in binary.inputs.iter().chain(binary.outputs.iter()) {
                    let present = state.cbs.values().any(|(cores, cfg)| cfg.channel == *ch && cores.contains(&w.core));
                    if !present {
                        return Err(fail(w.core, format!("no circular buffer for {ch}")));
                    }
                }
            }
        }

        let n_in = program.inputs.len() + 1;
        let n_out = program.outputs.len();
        let max_bindings = self.device.limits().max_storage_buffers_per_shader_stage as usize;
        if n_in + n_out > max_bindings {
            return Err(fail(first.core, format!("{} storage bindings exceed the limit of {max_bindings}", n_in + n_out)));
        }

        let (pipeline, layout) = self
            .pipelines
            .get(self, &binary.sources.wgsl, WGSL_ENTRY_POINT, n_in, n_out)
            .map_err(|e| fail(first.core, format!("failed to get kernel: {e}")))?;

        // work table: [start_tile, num_tiles] per workgroup
        let table: Vec<u32> = work
            .iter()
            .flat_map(|w| [w.start_tile as u32, w.num_tiles as u32])
            .collect();
        let params = self.create_buffer_with_data(bytemuck::cast_slice(&table), BufferRole::WorkTable);

        let mut bound: Vec<Arc<RawBuffer>> = Vec::with_capacity(n_in + n_out);
        for b in &program.inputs {
            bound.push(self.lookup(b.buffer).map_err(|e| fail(first.core, e.to_string()))?);
        }
        let params = Arc::new(params);
        bound.push(params);
        for b in &program.outputs {
            bound.push(self.lookup(b.buffer).map_err(|e| fail(first.core, e.to_string()))?);
        }
        let refs: Vec<&RawBuffer> = bound.iter().map(|b| b.as_ref()).collect();

        self.dispatch_workgroups(&pipeline, &layout, &refs, work.len() as u32)
            .map_err(|reason| fail(first.core, reason))?;
        debug!(kernel = program.name(), workgroups = work.len(), "gpu dispatch submitted");
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.device
            .poll(PollType::Wait)
            .map(|_| ())
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelBinding, Device as _, KernelBinary, KernelSources};
    use core_types::{ChannelId, DataFormat};
    use pollster::block_on;

    fn gpu() -> Option<GpuContext> {
        // no adapter on this machine: nothing to test
        block_on(GpuContext::new()).ok()
    }

    #[test]
    fn test_gpu_context_creation() {
        let Some(ctx) = gpu() else { return };
        let info = ctx.info();
        assert!(info.l1_capacity_per_core > 0);
        assert_eq!(info.grid, GridSize::new(8, 8));
    }

    #[test]
    fn test_upload_download_roundtrip() {
        let Some(ctx) = gpu() else { return };
        let id = ctx
            .create_buffer(&BufferDesc { size: 16, page_size: 16, tier: MemoryTier::Dram })
            .unwrap();
        let data = [10u32, 20, 30, 40];
        ctx.write_buffer(id, bytemuck::cast_slice(&data), true).unwrap();
        let mut back = [0u8; 16];
        ctx.read_buffer(id, &mut back, true).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&back), &data);
        ctx.release_buffer(id);
        assert!(ctx.read_buffer(id, &mut back, true).is_err());
    }

    #[test]
    fn test_copy_kernel_dispatch() {
        let Some(ctx) = gpu() else { return };
        let (i, o) = (ChannelId::input(0), ChannelId::output(0));
        let wgsl = r#"
            @group(0) @binding(0) var<storage, read> in0: array<u32>;
            @group(0) @binding(1) var<storage, read> work: array<u32>;
            @group(0) @binding(2) var<storage, read_write> out0: array<u32>;
            @compute @workgroup_size(64)
            fn main(@builtin(workgroup_id) wg: vec3<u32>, @builtin(local_invocation_index) lid: u32) {
                let start = work[wg.x * 2u];
                let count = work[wg.x * 2u + 1u];
                for (var w = start * 512u + lid; w < (start + count) * 512u; w = w + 64u) {
                    out0[w] = in0[w];
                }
            }
        "#;
        let binary = KernelBinary {
            name: "copy".into(),
            format: DataFormat::Float16B,
            inputs: vec![i],
            outputs: vec![o],
            compute: vec![(o, crate::TileExpr::Channel(i))],
            cb_depth_tiles: 1,
            sources: KernelSources { wgsl: wgsl.into(), ..KernelSources::default() },
        };
        let tile = DataFormat::Float16B.tile_size() as u64;
        let desc = BufferDesc { size: 2 * tile, page_size: 2 * tile, tier: MemoryTier::Dram };
        let (src, dst) = (ctx.create_buffer(&desc).unwrap(), ctx.create_buffer(&desc).unwrap());
        let data: Vec<u32> = (0..(2 * tile / 4) as u32).collect();
        ctx.write_buffer(src, bytemuck::cast_slice(&data), true).unwrap();

        let cores = [CoreCoord::new(0, 0), CoreCoord::new(1, 0)];
        for ch in [i, o] {
            let cfg = CbConfig { channel: ch, format: DataFormat::Float16B, total_size: tile, page_size: tile };
            ctx.create_circular_buffer(&cores, &cfg).unwrap();
        }
        let program = DeviceProgram {
            kernel: "copy".into(),
            binary: Arc::new(binary),
            inputs: vec![ChannelBinding { channel: i, buffer: src }],
            outputs: vec![ChannelBinding { channel: o, buffer: dst }],
        };
        let work = [
            CoreWork { core: cores[0], start_tile: 0, num_tiles: 1 },
            CoreWork { core: cores[1], start_tile: 1, num_tiles: 1 },
        ];
        ctx.run(&program, &work).unwrap();
        ctx.finish().unwrap();

        let mut back = vec![0u8; 2 * tile as usize];
        ctx.read_buffer(dst, &mut back, true).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&back), &data[..]);
    }
}
