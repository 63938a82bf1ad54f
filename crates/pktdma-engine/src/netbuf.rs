//! Host stack buffers.
//!
//! A [`NetBuf`] is a byte buffer with a movable data window, backed either by
//! its own heap allocation or by one half of an arena page. Delivered packets
//! may also carry the in-flight guard of the netif they were steered to.

use crate::page::PageFrag;
use crate::shared::InFlight;
use pktdma_core::{HeaderError, MemoryError};
use std::ptr::NonNull;

/// Memory behind a buffer or frame
#[derive(Debug)]
pub(crate) enum BufMem {
    Heap(Box<[u8]>),
    Page(PageFrag),
}

impl BufMem {
    /// Zeroed heap memory, failing instead of aborting on exhaustion
    pub(crate) fn heap(size: usize) -> Result<Self, MemoryError> {
        let mut v: Vec<u8> = Vec::new();
        v.try_reserve_exact(size)
            .map_err(|_| MemoryError::Alloc { size })?;
        v.resize(size, 0);
        Ok(Self::Heap(v.into_boxed_slice()))
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(b) => b,
            Self::Page(f) => f.as_slice(),
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(b) => b,
            Self::Page(f) => f.as_mut_slice(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match self {
            Self::Heap(b) => b.len(),
            Self::Page(f) => f.len(),
        }
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }

    pub(crate) fn base_ptr(&mut self) -> NonNull<u8> {
        match self {
            Self::Heap(b) => NonNull::from(&mut **b).cast(),
            Self::Page(f) => f.as_ptr(),
        }
    }

    pub(crate) fn is_page(&self) -> bool {
        matches!(self, Self::Page(_))
    }
}

/// Packet buffer handed to and from the host stack
#[derive(Debug)]
pub struct NetBuf {
    mem: BufMem,
    data: usize,
    len: usize,
    inflight: Option<InFlight>,
}

impl NetBuf {
    /// Allocate an empty buffer of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Alloc`] if the allocation fails.
    pub fn alloc(size: usize) -> Result<Self, MemoryError> {
        Ok(Self::from_mem(BufMem::heap(size)?))
    }

    /// Buffer holding a copy of `bytes` with `headroom` in front and
    /// `tailroom` behind
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Alloc`] if the allocation fails.
    pub fn from_bytes(bytes: &[u8], headroom: usize, tailroom: usize) -> Result<Self, MemoryError> {
        let mut buf = Self::alloc(headroom + bytes.len() + tailroom)?;
        buf.reserve(headroom);
        buf.put_slice(bytes)
            .map_err(|_| MemoryError::Alloc { size: bytes.len() })?;
        Ok(buf)
    }

    pub(crate) fn from_mem(mem: BufMem) -> Self {
        Self {
            mem,
            data: 0,
            len: 0,
            inflight: None,
        }
    }

    pub(crate) fn from_parts(mem: BufMem, data: usize, len: usize) -> Self {
        Self {
            mem,
            data,
            len,
            inflight: None,
        }
    }

    pub(crate) fn into_parts(self) -> (BufMem, usize, usize) {
        (self.mem, self.data, self.len)
    }

    /// Move the data window forward on an empty buffer
    pub fn reserve(&mut self, n: usize) {
        debug_assert_eq!(self.len, 0);
        self.data = (self.data + n).min(self.mem.capacity());
    }

    /// Extend the data window at the tail
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::NoTailroom`] if fewer than `n` bytes remain.
    pub fn put(&mut self, n: usize) -> Result<(), HeaderError> {
        if n > self.tailroom() {
            return Err(HeaderError::NoTailroom {
                needed: n,
                available: self.tailroom(),
            });
        }
        self.len += n;
        Ok(())
    }

    /// Append `bytes` at the tail
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::NoTailroom`] if the bytes do not fit.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), HeaderError> {
        let start = self.data + self.len;
        self.put(bytes.len())?;
        self.mem.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Extend the data window at the head
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TooShort`] if the headroom is smaller than `n`.
    pub fn push(&mut self, n: usize) -> Result<(), HeaderError> {
        if n > self.data {
            return Err(HeaderError::TooShort {
                expected: n,
                actual: self.data,
            });
        }
        self.data -= n;
        self.len += n;
        Ok(())
    }

    /// Remove `n` bytes from the head
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TooShort`] if the buffer holds fewer bytes.
    pub fn pull(&mut self, n: usize) -> Result<(), HeaderError> {
        if n > self.len {
            return Err(HeaderError::TooShort {
                expected: n,
                actual: self.len,
            });
        }
        self.data += n;
        self.len -= n;
        Ok(())
    }

    /// Shorten the data window to `len` bytes
    pub fn trim(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Data bytes
    pub fn data(&self) -> &[u8] {
        &self.mem.as_slice()[self.data..self.data + self.len]
    }

    /// Mutable data bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.data, self.data + self.len);
        &mut self.mem.as_mut_slice()[start..end]
    }

    /// Data bytes plus the tailroom behind them
    pub fn data_and_tail_mut(&mut self) -> &mut [u8] {
        let start = self.data;
        &mut self.mem.as_mut_slice()[start..]
    }

    /// Set the data length after writing through [`data_and_tail_mut`](Self::data_and_tail_mut)
    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(self.mem.capacity() - self.data);
    }

    /// Data length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the data window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes in front of the data window
    pub fn headroom(&self) -> usize {
        self.data
    }

    /// Bytes behind the data window
    pub fn tailroom(&self) -> usize {
        self.mem.capacity() - self.data - self.len
    }

    /// Whether the buffer aliases an arena page
    pub fn is_page_backed(&self) -> bool {
        self.mem.is_page()
    }

    /// Netif this packet is counted against, if any
    pub fn in_flight_netif(&self) -> Option<u32> {
        self.inflight.as_ref().map(InFlight::netif)
    }

    pub(crate) fn set_inflight(&mut self, guard: Option<InFlight>) {
        self.inflight = guard;
    }

    /// Address of the first data byte; identifies the buffer across calls
    pub(crate) fn data_addr(&self) -> usize {
        self.mem.base_addr() + self.data
    }

    /// Address `off` bytes into the data window, for DMA mapping
    pub(crate) fn ptr_at(&mut self, off: usize) -> NonNull<u8> {
        // SAFETY: callers keep `off` within the allocation; the base pointer
        // is non-null so the offset pointer is too.
        unsafe { self.mem.base_ptr().add(self.data + off) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_operations() {
        let mut buf = NetBuf::alloc(128).unwrap();
        buf.reserve(32);
        assert_eq!(buf.headroom(), 32);
        assert_eq!(buf.tailroom(), 96);

        buf.put_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.data(), &[1, 2, 3, 4]);

        buf.push(2).unwrap();
        assert_eq!(buf.len(), 6);
        buf.pull(3).unwrap();
        assert_eq!(buf.data(), &[2, 3, 4]);

        buf.trim(1);
        assert_eq!(buf.data(), &[2]);
        assert!(buf.put(1000).is_err());
        assert!(buf.pull(5).is_err());
    }

    #[test]
    fn test_from_bytes() {
        let buf = NetBuf::from_bytes(&[9; 10], 16, 8).unwrap();
        assert_eq!(buf.headroom(), 16);
        assert_eq!(buf.tailroom(), 8);
        assert_eq!(buf.data(), &[9; 10]);
        assert!(!buf.is_page_backed());
        assert_eq!(buf.in_flight_netif(), None);
    }

    #[test]
    fn test_data_ptr_tracks_window() {
        let mut buf = NetBuf::alloc(64).unwrap();
        let base = buf.data_addr();
        buf.reserve(8);
        assert_eq!(buf.data_addr(), base + 8);
        assert_eq!(buf.ptr_at(4).as_ptr() as usize, base + 12);
    }
}
