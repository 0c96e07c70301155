use std::{
    collections::HashMap,
    sync::Arc,
};
use parking_lot::Mutex;

use super::GpuContext;
use crate::types::{ChannelLayout, TilePipeline};

/// Signature of a compiled shader: source + binding shape
#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    src:   Arc<str>,
    ent:   Arc<str>,
    n_in:  usize,
    n_out: usize,
}

struct PipelineBundle {
    pipeline: Arc<TilePipeline>,
    layout:   Arc<ChannelLayout>,
}

/// Compiled pipelines and their layouts, keyed by WGSL source.
pub(crate) struct PipelineCache {
    cache: Mutex<HashMap<PipelineKey, Arc<PipelineBundle>>>,
}

impl PipelineCache {
    pub(crate) fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn get(
        &self,
        ctx: &GpuContext,
        src: &str,
        entry: &str,
        n_in: usize,
        n_out: usize,
    ) -> Result<(Arc<TilePipeline>, Arc<ChannelLayout>), String> {
        let key = PipelineKey {
            src:  Arc::from(src),
            ent:  Arc::from(entry),
            n_in,
            n_out,
        };

        if let Some(b) = self.cache.lock().get(&key) {
            return Ok((b.pipeline.clone(), b.layout.clone()));
        }

        let layout   = ctx.create_storage_layout(n_in, n_out);
        let pipeline = ctx.create_compute_pipeline(src, entry, &layout)?;

        let bundle = Arc::new(PipelineBundle { pipeline: pipeline.clone(), layout: layout.clone() });
        self.cache.lock().insert(key, bundle);
        tracing::debug!(entry, n_in, n_out, "compute pipeline compiled");

        Ok((pipeline, layout))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache.lock().len()
    }
}
