//! Zero-copy pool backing memory.
//!
//! The memory is carved into fixed-size chunks addressed by byte offset
//! ("umem address"). Which side owns a chunk at any moment is decided by the
//! ring protocol in [`super::ZeroCopyPool`]; this type only hands out views.

use super::XskError;
use crate::numa;
use std::fmt;
use std::ptr::{self, NonNull};

/// Headroom the engine keeps in front of every chunk's data
pub const XDP_PACKET_HEADROOM: usize = 256;

/// Smallest supported chunk
pub const UMEM_MIN_CHUNK_SIZE: usize = 2048;

/// Pool memory configuration
#[derive(Debug, Clone)]
pub struct UmemConfig {
    /// Total size in bytes
    pub size: usize,
    /// Chunk size (power of 2)
    pub frame_size: usize,
    /// Consumer headroom added to [`XDP_PACKET_HEADROOM`]
    pub headroom: usize,
}

impl Default for UmemConfig {
    fn default() -> Self {
        Self {
            size: 1024 * 1024,
            frame_size: 2048,
            headroom: 0,
        }
    }
}

impl UmemConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns [`XskError::InvalidConfig`] for a non power of 2 or undersized
    /// chunk, an oversized headroom, or a region smaller than one chunk.
    pub fn validate(&self) -> Result<(), XskError> {
        if !self.frame_size.is_power_of_two() {
            return Err(XskError::InvalidConfig(
                "frame_size must be power of 2".into(),
            ));
        }
        if self.frame_size < UMEM_MIN_CHUNK_SIZE {
            return Err(XskError::InvalidConfig(format!(
                "frame_size must be >= {}",
                UMEM_MIN_CHUNK_SIZE
            )));
        }
        if XDP_PACKET_HEADROOM + self.headroom >= self.frame_size {
            return Err(XskError::InvalidConfig(
                "headroom leaves no room for data".into(),
            ));
        }
        if self.size / self.frame_size == 0 {
            return Err(XskError::InvalidConfig(
                "size too small for frame_size".into(),
            ));
        }
        Ok(())
    }
}

/// Pool memory region
pub struct Umem {
    config: UmemConfig,
    buffer: NonNull<u8>,
}

impl Umem {
    /// Allocate a region
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or memory is exhausted.
    pub fn new(config: UmemConfig) -> Result<Self, XskError> {
        config.validate()?;
        let size = config.size;
        // SAFETY: released in Drop with the same size.
        let buffer = unsafe { numa::allocate_on_node(size, numa::current_numa_node()) }
            .ok_or(XskError::Alloc { size })?;
        Ok(Self { config, buffer })
    }

    /// Region size
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Chunk size
    pub fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    /// Number of chunks
    pub fn num_frames(&self) -> usize {
        self.size() / self.frame_size()
    }

    /// Offset of packet data inside a freshly allocated chunk
    pub fn data_offset(&self) -> usize {
        XDP_PACKET_HEADROOM + self.config.headroom
    }

    /// Chunk base of any address inside it
    pub fn chunk_base(&self, addr: u64) -> u64 {
        addr & !(self.frame_size() as u64 - 1)
    }

    /// Whether `addr..addr+len` stays within one chunk of the region
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let Ok(start) = usize::try_from(addr) else {
            return false;
        };
        let chunk_end = self.chunk_base(addr) as usize + self.frame_size();
        start < self.size() && start + len <= chunk_end.min(self.size())
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.buffer
    }

    /// Bytes from `addr` to the end of its chunk
    ///
    /// # Safety
    /// The caller must own the chunk under the ring protocol and must not
    /// create another view of it while the slice lives.
    pub(crate) unsafe fn chunk_tail_mut(&self, addr: u64) -> Option<&mut [u8]> {
        if !self.contains(addr, 0) {
            return None;
        }
        let start = addr as usize;
        let end = self.chunk_base(addr) as usize + self.frame_size();
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        Some(unsafe { std::slice::from_raw_parts_mut(self.buffer.as_ptr().add(start), end - start) })
    }

    /// Copy `len` bytes out of the region
    ///
    /// Reads the caller's own chunk; the ring protocol decides who that is.
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        if !self.contains(addr, len) {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: the range lies inside the region (checked above).
        unsafe {
            ptr::copy_nonoverlapping(self.buffer.as_ptr().add(addr as usize), out.as_mut_ptr(), len);
        }
        Some(out)
    }

    /// Copy `data` into the region
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        if !self.contains(addr, data.len()) {
            return false;
        }
        // SAFETY: the range lies inside the region (checked above).
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.buffer.as_ptr().add(addr as usize),
                data.len(),
            );
        }
        true
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        // SAFETY: allocation made in `new` with the same size.
        unsafe { numa::deallocate_on_node(self.buffer, self.config.size) };
    }
}

// SAFETY: the region is plain memory; chunk ownership is arbitrated by the
// pool rings, never by this type.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl fmt::Debug for Umem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Umem")
            .field("size", &self.config.size)
            .field("frame_size", &self.config.frame_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umem_config_validate() {
        assert!(UmemConfig::default().validate().is_ok());

        let mut config = UmemConfig::default();
        config.frame_size = 3000;
        assert!(config.validate().is_err());

        let mut config = UmemConfig::default();
        config.frame_size = 1024;
        assert!(config.validate().is_err());

        let mut config = UmemConfig::default();
        config.headroom = 4096;
        assert!(config.validate().is_err());

        let mut config = UmemConfig::default();
        config.size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_umem_geometry() {
        let umem = Umem::new(UmemConfig {
            size: 16 * 2048,
            frame_size: 2048,
            headroom: 64,
        })
        .unwrap();
        assert_eq!(umem.num_frames(), 16);
        assert_eq!(umem.data_offset(), 320);
        assert_eq!(umem.chunk_base(2048 + 300), 2048);
        assert!(umem.contains(2048, 2048));
        assert!(!umem.contains(2048 + 100, 2048));
        assert!(!umem.contains(16 * 2048, 1));
    }

    #[test]
    fn test_umem_read_write() {
        let umem = Umem::new(UmemConfig::default()).unwrap();
        assert!(umem.write(4096 + 10, &[1, 2, 3]));
        assert_eq!(umem.read(4096 + 10, 3).unwrap(), vec![1, 2, 3]);
        assert!(umem.read(4096 + 2040, 16).is_none());
    }
}
