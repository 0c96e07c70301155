use std::collections::HashMap;
use parking_lot::Mutex;

use core_types::{BufferId, MemoryTier};

/// What the allocator remembers about one live buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferEntry {
    pub size: u64,
    pub page_size: u64,
    pub tier: MemoryTier,
}

/// thread-safe bookkeeping of the buffers one owner holds on a device
#[derive(Default)]
pub struct BufferPool {
    entries: Mutex<HashMap<BufferId, BufferEntry>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: BufferId, entry: BufferEntry) {
        self.entries.lock().insert(id, entry);
    }

    pub fn get(&self, id: BufferId) -> Option<BufferEntry> {
        self.entries.lock().get(&id).copied()
    }

    /// Forget a buffer, returning what was recorded for it
    pub fn remove(&self, id: BufferId) -> Option<BufferEntry> {
        self.entries.lock().remove(&id)
    }

    /// Remove every entry, returning the ids in allocation order
    pub fn drain(&self) -> Vec<BufferId> {
        let mut ids: Vec<BufferId> = self.entries.lock().drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    /// Bytes held in `tier`
    pub fn used(&self, tier: MemoryTier) -> u64 {
        self.entries
            .lock()
            .values()
            .filter(|e| e.tier == tier)
            .map(|e| e.size)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
