//! Memory registration and page-aligned buffers to register.
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::slice;
use std::sync::Arc;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;

use crate::ibv::{self, AccessFlags, Handle, MrDesc, Sge, Verbs, VerbsError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Mmap: {0}.")]
    Mmap(#[from] nix::Error),
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("Zero-length buffer.")]
    ZeroLength,
}

/// The address and key a peer needs to reach a registered window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteKey {
    pub rkey: u32,
    pub addr: u64,
}

/// Who owns the bytes behind a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// The caller's buffer, borrowed for the registration lifetime.
    Caller,
    /// Memory the provider allocated; initial content was copied in.
    Provider,
}

/// A registration of a contiguous buffer. It must be deregistered before the buffer goes away,
/// which the `'a` borrow guarantees.
pub struct MemoryRegion<'a> {
    verbs: Arc<dyn Verbs>,
    pd: Handle,
    desc: MrDesc,
    access: AccessFlags,
    backing: Backing,
    released: bool,
    _marker: PhantomData<&'a mut [u8]>,
}

// The region is only reached through `&self`/`&mut self` and the provider handle is Send + Sync.
unsafe impl<'a> Send for MemoryRegion<'a> {}
unsafe impl<'a> Sync for MemoryRegion<'a> {}

impl<'a> fmt::Debug for MemoryRegion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.desc.addr))
            .field("len", &self.desc.len)
            .field("lkey", &format_args!("{:#x}", self.desc.lkey))
            .field("rkey", &format_args!("{:#x}", self.desc.rkey))
            .field("backing", &self.backing)
            .finish()
    }
}

impl<'ctx> ibv::ProtectionDomain<'ctx> {
    /// Register `buf` in place.
    pub fn reg_mr<'a>(
        &'a self,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<MemoryRegion<'a>, VerbsError> {
        self.try_reg_mr(buf, access).map_err(|(e, _)| e)
    }

    /// Like [`reg_mr`](Self::reg_mr), but hands the buffer back when registration fails so the
    /// caller can fall back to another path.
    pub fn try_reg_mr<'a>(
        &'a self,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<MemoryRegion<'a>, (VerbsError, &'a mut [u8])> {
        // SAFETY: `buf` is mutably borrowed for as long as the returned region lives, and the
        // region deregisters itself on drop.
        let res = unsafe {
            self.verbs()
                .reg_mr(self.handle(), buf.as_mut_ptr(), buf.len(), access)
        };
        match res {
            Ok(desc) => Ok(MemoryRegion {
                verbs: Arc::clone(self.verbs()),
                pd: self.handle(),
                desc,
                access,
                backing: Backing::Caller,
                released: false,
                _marker: PhantomData,
            }),
            Err(e) => Err((e, buf)),
        }
    }

    /// Let the provider allocate `len` bytes and register them.
    pub fn alloc_mr<'a>(
        &'a self,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegion<'a>, VerbsError> {
        let desc = self.verbs().alloc_mr(self.handle(), len, access)?;
        Ok(MemoryRegion {
            verbs: Arc::clone(self.verbs()),
            pd: self.handle(),
            desc,
            access,
            backing: Backing::Provider,
            released: false,
            _marker: PhantomData,
        })
    }
}

impl<'a> MemoryRegion<'a> {
    #[inline]
    pub fn handle(&self) -> Handle {
        self.desc.handle
    }

    #[inline]
    pub fn pd(&self) -> Handle {
        self.pd
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.desc.lkey
    }

    #[inline]
    pub fn rkey(&self) -> RemoteKey {
        RemoteKey {
            rkey: self.desc.rkey,
            addr: self.desc.addr,
        }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.desc.addr
    }

    #[inline]
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    #[inline]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// A scatter/gather entry covering `offset..offset + len`, or `None` if that range leaves the
    /// registration.
    pub fn sge(&self, offset: usize, len: usize) -> Option<Sge> {
        let end = offset.checked_add(len)?;
        if self.released || end > self.desc.len || len > u32::MAX as usize {
            return None;
        }
        Some(Sge {
            addr: self.desc.addr + offset as u64,
            length: len as u32,
            lkey: self.desc.lkey,
        })
    }

    /// Deregister now. The region reads as empty afterwards.
    pub fn release(&mut self) -> Result<(), VerbsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.verbs.dereg_mr(self.desc.handle)
    }
}

impl<'a> Deref for MemoryRegion<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.released {
            return &[];
        }
        // SAFETY: the provider reported this window at registration and keeps it valid until
        // deregistration, which has not happened yet.
        unsafe { slice::from_raw_parts(self.desc.addr as *const u8, self.desc.len) }
    }
}

impl<'a> DerefMut for MemoryRegion<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        if self.released {
            return &mut [];
        }
        unsafe { slice::from_raw_parts_mut(self.desc.addr as *mut u8, self.desc.len) }
    }
}

impl<'a> Drop for MemoryRegion<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("error occured when deregistering mr {}: {}", self.desc.handle, e);
        }
    }
}

/// A zero-filled, page-aligned anonymous mapping.
pub struct AlignedBuffer {
    ptr: *mut libc::c_void,
    len: usize,
    mapped_len: usize,
}

unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(len: usize) -> Result<Self, Error> {
        let page = page_size();
        let mapped_len =
            NonZeroUsize::new((len + page - 1) / page * page).ok_or(Error::ZeroLength)?;
        let ptr = unsafe {
            mmap(
                None,
                mapped_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        log::debug!(
            "ptr: {:0x?}, len: {}, mapped_len: {}, page: {}",
            ptr,
            len,
            mapped_len,
            page
        );
        Ok(AlignedBuffer {
            ptr,
            len,
            mapped_len: mapped_len.get(),
        })
    }

    /// Allocate and fill with a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let mut buf = Self::new(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr, self.mapped_len)
                .unwrap_or_else(|e| log::warn!("failed to munmap: {}", e))
        };
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AlignedBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

pub fn page_size() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                n if n > 0 => n as usize,
                _ => 4096,
            };

            PAGE_SIZE.store(page_size, Ordering::Relaxed);

            page_size
        }
        page_size => page_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert!(buf.iter().all(|&b| b == 0));
        buf[..5].copy_from_slice(b"hello");
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_aligned_buffer_zero_len() {
        assert!(matches!(AlignedBuffer::new(0), Err(Error::ZeroLength)));
    }
}
