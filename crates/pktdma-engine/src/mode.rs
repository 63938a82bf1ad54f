//! Receive buffer mode selection.

use pktdma_core::{RXB_META, rx_buf_footprint};
use std::fmt;

/// Receive buffer strategy of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMode {
    /// One host stack buffer per descriptor
    #[default]
    Slab,
    /// Half-page flip buffers recycled in place
    Paged,
    /// Frames owned by a bound zero-copy pool
    ExternallyOwned,
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Slab => "slab",
            Self::Paged => "paged",
            Self::ExternallyOwned => "zero-copy",
        };
        f.write_str(name)
    }
}

/// Outcome of [`BufferModeSelector::select`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSelection {
    /// Chosen mode
    pub mode: BufferMode,
    /// Page order (paged mode only)
    pub page_order: u32,
    /// Page size in bytes (paged mode only)
    pub page_size: usize,
}

/// Chooses the receive buffer strategy for a queue
#[derive(Debug, Clone, Copy)]
pub struct BufferModeSelector {
    /// Paged buffering administratively enabled
    pub page_buffer_mode: bool,
    /// Metadata bytes the hardware writes inline (0 = reserve room for it)
    pub rx_meta_inline: usize,
    /// Order-0 page size
    pub base_page_size: usize,
}

impl BufferModeSelector {
    /// Pick the mode for a queue with `buf_size` payload bytes
    ///
    /// Total over its inputs: a bound pool always wins, then paged mode, then
    /// slab.
    pub fn select(&self, buf_size: usize, zero_copy_bound: bool) -> ModeSelection {
        if zero_copy_bound {
            return ModeSelection {
                mode: BufferMode::ExternallyOwned,
                page_order: 0,
                page_size: 0,
            };
        }
        if !self.page_buffer_mode {
            return ModeSelection {
                mode: BufferMode::Slab,
                page_order: 0,
                page_size: 0,
            };
        }

        let (page_order, page_size) = self.page_geometry(buf_size);
        ModeSelection {
            mode: BufferMode::Paged,
            page_order,
            page_size,
        }
    }

    /// Smallest page order whose halves each hold one buffer
    pub fn page_geometry(&self, buf_size: usize) -> (u32, usize) {
        let len = if self.rx_meta_inline != 0 {
            buf_size
        } else {
            buf_size + RXB_META
        };
        let needed = rx_buf_footprint(len) * 2;

        let mut order = 0;
        let mut size = self.base_page_size;
        while size < needed {
            size <<= 1;
            order += 1;
        }
        (order, size)
    }
}
