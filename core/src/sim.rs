//! In-process simulator of a tiled accelerator.
//!
//! Memory is plain host vectors with per-tier accounting. A dispatch runs the
//! reader → compute → writer pipeline of every core through bounded rings
//! sized from the circular buffers created on that core, so an under-sized
//! or missing channel shows up exactly as it would on hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use core_types::{BufferId, CbHandle, ChannelId, CoreCoord, GridSize, MemoryTier, TILE_ELEMENTS};
use half::bf16;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{BufferDesc, CbConfig, CoreWork, Device, DeviceError, DeviceInfo, DeviceProgram};

/// Shape and capacities of the simulated device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimConfig {
    pub grid: GridSize,
    pub dram_bytes: u64,
    pub l1_bytes_per_core: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            grid: GridSize::new(8, 8),
            dram_bytes: 1 << 30,
            l1_bytes_per_core: 1 << 20,
        }
    }
}

/// One-shot failure to inject into the next matching operation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Write(BufferId),
    Read(BufferId),
    Dispatch(CoreCoord),
}

struct SimBuffer {
    bytes: Vec<u8>,
    tier: MemoryTier,
}

struct SimCb {
    cores: Vec<CoreCoord>,
    config: CbConfig,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    buffers: HashMap<BufferId, SimBuffer>,
    cbs: HashMap<CbHandle, SimCb>,
    used_dram: u64,
    used_l1: u64,
    faults: Vec<Fault>,
    launches: usize,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }

    fn l1_used_on(&self, core: CoreCoord) -> u64 {
        self.cbs
            .values()
            .filter(|cb| cb.cores.contains(&core))
            .map(|cb| cb.config.total_size)
            .sum()
    }

    fn channel_depth(&self, core: CoreCoord, channel: ChannelId) -> Option<usize> {
        self.cbs
            .values()
            .find(|cb| cb.config.channel == channel && cb.cores.contains(&core))
            .map(|cb| (cb.config.total_size / cb.config.page_size) as usize)
    }

    fn read_tile(&self, id: BufferId, index: usize, tile_bytes: usize) -> Result<Vec<bf16>, String> {
        let buf = self.buffers.get(&id).ok_or_else(|| format!("unknown buffer {id}"))?;
        let start = index * tile_bytes;
        let bytes = buf
            .bytes
            .get(start..start + tile_bytes)
            .ok_or_else(|| format!("tile {index} is out of range of {id}"))?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    fn write_tile(&mut self, id: BufferId, index: usize, tile: &[bf16]) -> Result<(), String> {
        let buf = self.buffers.get_mut(&id).ok_or_else(|| format!("unknown buffer {id}"))?;
        let bytes: &[u8] = bytemuck::cast_slice(tile);
        let start = index * bytes.len();
        let dst = buf
            .bytes
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| format!("tile {index} is out of range of {id}"))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

/// Bounded tile queue standing in for an on-chip circular buffer
struct Ring {
    capacity: usize,
    tiles: VecDeque<Vec<bf16>>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self { capacity, tiles: VecDeque::with_capacity(capacity) }
    }

    fn has_space(&self) -> bool {
        self.tiles.len() < self.capacity
    }

    fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Simulated tiled accelerator. Clones share one device state.
#[derive(Clone)]
pub struct SimDevice {
    id: usize,
    config: SimConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new(id: usize) -> Self {
        Self::with_config(id, SimConfig::default())
    }

    pub fn with_config(id: usize, config: SimConfig) -> Self {
        Self { id, config, state: Arc::new(Mutex::new(SimState::default())) }
    }

    /// Make the next matching operation fail
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_circular_buffers(&self) -> usize {
        self.state.lock().cbs.len()
    }

    /// Number of completed program launches
    pub fn launches(&self) -> usize {
        self.state.lock().launches
    }

    /// Bytes currently allocated in a tier
    pub fn used(&self, tier: MemoryTier) -> u64 {
        let state = self.state.lock();
        match tier {
            MemoryTier::Dram => state.used_dram,
            MemoryTier::L1 => state.used_l1,
        }
    }

    fn run_core(state: &mut SimState, program: &DeviceProgram, work: &CoreWork) -> Result<(), String> {
        let binary = &program.binary;
        let tile_bytes = binary.format.tile_size();

        let mut rings: HashMap<ChannelId, Ring> = HashMap::new();
        for channel in binary.inputs.iter().chain(binary.outputs.iter()) {
            let depth = state
                .channel_depth(work.core, *channel)
                .ok_or_else(|| format!("no circular buffer for {channel}"))?;
            if depth == 0 {
                return Err(format!("circular buffer {channel} has no pages"));
            }
            rings.insert(*channel, Ring::new(depth));
        }
        for (_, expr) in &binary.compute {
            if let Some(c) = expr.channels().into_iter().find(|c| !binary.inputs.contains(c)) {
                return Err(format!("compute reads {c}, which is not an input channel"));
            }
        }

        let (mut read, mut computed, mut written) = (0, 0, 0);
        while written < work.num_tiles {
            let mut progressed = false;

            // reader: DRAM → input channels
            while read < work.num_tiles && program.inputs.iter().all(|b| rings[&b.channel].has_space()) {
                for b in &program.inputs {
                    let tile = state.read_tile(b.buffer, work.start_tile + read, tile_bytes)?;
                    if let Some(ring) = rings.get_mut(&b.channel) {
                        ring.tiles.push_back(tile);
                    }
                }
                read += 1;
                progressed = true;
            }

            // compute: input channels → output channels
            while computed < read && binary.outputs.iter().all(|c| rings[c].has_space()) {
                let mut fronts: HashMap<ChannelId, Vec<bf16>> = HashMap::new();
                for c in &binary.inputs {
                    if let Some(tile) = rings.get_mut(c).and_then(|r| r.tiles.pop_front()) {
                        fronts.insert(*c, tile);
                    }
                }
                for (out, expr) in &binary.compute {
                    let tile: Vec<bf16> = (0..TILE_ELEMENTS)
                        .map(|i| {
                            let load = |c: ChannelId| fronts.get(&c).map_or(0.0, |t| t[i].to_f32());
                            bf16::from_f32(expr.eval(&load))
                        })
                        .collect();
                    if let Some(ring) = rings.get_mut(out) {
                        ring.tiles.push_back(tile);
                    }
                }
                computed += 1;
                progressed = true;
            }

            // writer: output channels → DRAM
            while written < computed && binary.outputs.iter().all(|c| !rings[c].is_empty()) {
                for b in &program.outputs {
                    let tile = rings
                        .get_mut(&b.channel)
                        .and_then(|r| r.tiles.pop_front())
                        .ok_or_else(|| format!("{} has no bound output stage", b.channel))?;
                    state.write_tile(b.buffer, work.start_tile + written, &tile)?;
                }
                written += 1;
                progressed = true;
            }

            if !progressed {
                return Err(format!("pipeline stalled after {written} of {} tiles", work.num_tiles));
            }
        }
        trace!(core = %work.core, tiles = work.num_tiles, "core finished");
        Ok(())
    }
}

impl Device for SimDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: format!("sim{}", self.id),
            grid: self.config.grid,
            dram_capacity: self.config.dram_bytes,
            l1_capacity_per_core: self.config.l1_bytes_per_core,
        }
    }

    fn share(&self) -> Box<dyn Device> {
        Box::new(self.clone())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, DeviceError> {
        if desc.size == 0 || desc.page_size == 0 || desc.size % desc.page_size != 0 {
            return Err(DeviceError::Backend(format!(
                "invalid buffer geometry: {} bytes in pages of {}",
                desc.size, desc.page_size
            )));
        }
        let capacity = self.info().tier_capacity(desc.tier);
        let mut state = self.state.lock();
        let used = match desc.tier {
            MemoryTier::Dram => &mut state.used_dram,
            MemoryTier::L1 => &mut state.used_l1,
        };
        if *used + desc.size > capacity {
            return Err(DeviceError::OutOfMemory {
                tier: desc.tier,
                requested: desc.size,
                available: capacity - *used,
            });
        }
        *used += desc.size;
        let id = BufferId(state.next_id());
        state.buffers.insert(id, SimBuffer { bytes: vec![0; desc.size as usize], tier: desc.tier });
        debug!(%id, size = desc.size, page = desc.page_size, tier = %desc.tier, "sim buffer created");
        Ok(id)
    }

    fn release_buffer(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Some(buf) = state.buffers.remove(&id) {
            let size = buf.bytes.len() as u64;
            match buf.tier {
                MemoryTier::Dram => state.used_dram -= size,
                MemoryTier::L1 => state.used_l1 -= size,
            }
        }
    }

    fn create_circular_buffer(&self, cores: &[CoreCoord], config: &CbConfig) -> Result<CbHandle, DeviceError> {
        if config.page_size == 0 || config.total_size % config.page_size != 0 {
            return Err(DeviceError::Backend(format!(
                "circular buffer {} of {} bytes is not a whole number of {}-byte pages",
                config.channel, config.total_size, config.page_size
            )));
        }
        let mut state = self.state.lock();
        for core in cores {
            if state.channel_depth(*core, config.channel).is_some() {
                return Err(DeviceError::ChannelInUse { core: *core, channel: config.channel });
            }
            let used = state.l1_used_on(*core);
            if used + config.total_size > self.config.l1_bytes_per_core {
                return Err(DeviceError::OutOfMemory {
                    tier: MemoryTier::L1,
                    requested: config.total_size,
                    available: self.config.l1_bytes_per_core - used,
                });
            }
        }
        let handle = CbHandle(state.next_id());
        state.cbs.insert(handle, SimCb { cores: cores.to_vec(), config: *config });
        debug!(%handle, channel = %config.channel, bytes = config.total_size, cores = cores.len(), "sim circular buffer created");
        Ok(handle)
    }

    fn release_circular_buffer(&self, handle: CbHandle) {
        self.state.lock().cbs.remove(&handle);
    }

    fn write_buffer(&self, id: BufferId, data: &[u8], _blocking: bool) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::Write(id)) {
            return Err(DeviceError::Transfer { buffer: id, reason: "injected write fault".into() });
        }
        let buf = state.buffers.get_mut(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        if data.len() > buf.bytes.len() {
            return Err(DeviceError::SizeMismatch {
                buffer: id,
                buffer_size: buf.bytes.len() as u64,
                transfer_size: data.len() as u64,
            });
        }
        buf.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, id: BufferId, out: &mut [u8], _blocking: bool) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::Read(id)) {
            return Err(DeviceError::Transfer { buffer: id, reason: "injected read fault".into() });
        }
        let buf = state.buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        if out.len() > buf.bytes.len() {
            return Err(DeviceError::SizeMismatch {
                buffer: id,
                buffer_size: buf.bytes.len() as u64,
                transfer_size: out.len() as u64,
            });
        }
        out.copy_from_slice(&buf.bytes[..out.len()]);
        Ok(())
    }

    fn run(&self, program: &DeviceProgram, work: &[CoreWork]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        for w in work {
            let fail = |reason: String| DeviceError::Dispatch {
                kernel: program.name().to_string(),
                core: w.core,
                reason,
            };
            if state.take_fault(Fault::Dispatch(w.core)) {
                return Err(fail("injected dispatch fault".into()));
            }
            Self::run_core(&mut state, program, w).map_err(fail)?;
        }
        state.launches += 1;
        debug!(kernel = program.name(), cores = work.len(), "sim launch complete");
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        // launches complete synchronously
        Ok(())
    }
}
