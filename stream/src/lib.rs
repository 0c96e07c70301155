mod utils;

use core_types::{tile_count, DataFormat, Element, TILE_ELEMENTS};
use half::bf16;
use tracing::trace;
use utils::pad_to;

/// Host-side data feeding (source) or receiving (sink) a graph.
///
/// Whether a stream is a source or a sink is decided by the one connection
/// it takes part in. The device always sees whole tiles: the upload image is
/// the data padded with zeros (or truncated) to `padded_len()` elements.
#[derive(Clone, Debug, PartialEq)]
pub struct Stream {
    data:          Vec<bf16>,
    element_count: usize,
    format:        DataFormat,
}

impl Stream {
    /* --------------------------------------------------------------------- */
    /* Constructors                                                          */
    /* --------------------------------------------------------------------- */

    /// Wrap `data` as a stream of `element_count` logical elements.
    pub fn new(data: Vec<bf16>, element_count: usize, format: DataFormat) -> Self {
        debug_assert_eq!(format, <bf16 as Element>::FORMAT);
        Stream { data, element_count, format }
    }

    /// `element_count` copies of `value`
    pub fn constant(value: f32, element_count: usize) -> Self {
        Self::new(vec![bf16::from_f32(value); element_count], element_count, DataFormat::Float16B)
    }

    pub fn zeros(element_count: usize) -> Self {
        Self::new(vec![bf16::ZERO; element_count], element_count, DataFormat::Float16B)
    }

    /// Convert `values` to bf16 (round to nearest even)
    pub fn from_f32(values: &[f32]) -> Self {
        let data = values.iter().copied().map(bf16::from_f32).collect();
        Self::new(data, values.len(), DataFormat::Float16B)
    }

    /* --------------------------------------------------------------------- */
    /* Geometry                                                              */
    /* --------------------------------------------------------------------- */

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Whole tiles covering the logical elements
    pub fn tile_count(&self) -> usize {
        tile_count(self.element_count)
    }

    pub fn padded_len(&self) -> usize {
        self.tile_count() * TILE_ELEMENTS
    }

    /// Size of the device buffer backing this stream
    pub fn byte_size(&self) -> u64 {
        (self.tile_count() * self.format.tile_size()) as u64
    }

    /* --------------------------------------------------------------------- */
    /* Host data                                                             */
    /* --------------------------------------------------------------------- */

    /// Upload image: exactly `padded_len()` elements
    pub fn padded_bytes(&self) -> Vec<u8> {
        let padded = pad_to(&self.data, self.padded_len());
        bytemuck::cast_slice(&padded).to_vec()
    }

    /// Replace the host data with a downloaded device image
    pub fn store_download(&mut self, bytes: &[u8]) {
        self.data = bytemuck::pod_collect_to_vec(bytes);
        trace!(elements = self.data.len(), "stream data replaced from device");
    }

    /// Host buffer as stored (the full padded image after a download)
    pub fn data(&self) -> &[bf16] {
        &self.data
    }

    /// The logical elements only
    pub fn values(&self) -> &[bf16] {
        &self.data[..self.element_count.min(self.data.len())]
    }

    /// Logical elements widened to `f32`
    pub fn to_f32(&self) -> Vec<f32> {
        self.values().iter().map(|v| v.to_f32()).collect()
    }
}

/* ------------------------------------------------------------------------- */
/*                                     Tests                                 */
/* ------------------------------------------------------------------------- */
