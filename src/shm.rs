//! Shared memory region backing the inter-core link
//!
//! Every structure the two cores exchange lives inside one [`SharedMem`]
//! region and is addressed by its byte offset from the region base, so the
//! two sides may map the region at different virtual addresses.

use crate::error::{AmpError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::mm::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32};

const AMP_SHM_PREFIX: &str = "/amp_";
const MAX_NAME_LEN: usize = 255 - AMP_SHM_PREFIX.len();

/// Handle to a shared memory region
pub struct SharedMem {
    #[allow(dead_code)]
    fd: Option<OwnedFd>,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the region is only mutated through atomics or through buffers whose
// ownership is handed over by the ring protocol.
unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    /// Create a named shared memory region
    ///
    /// # Arguments
    /// * `name` - Unique name for the shared memory (will be prefixed with "/amp_")
    /// * `size` - Size in bytes
    pub fn create(name: &str, size: usize) -> Result<Self> {
        check_size(size)?;
        let c_name = shm_name(name)?;

        // Try to create exclusively first, fall back to open if exists
        let fd = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        ) {
            Ok(fd) => fd,
            Err(_) => shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(
                |e| AmpError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                },
            )?,
        };

        ftruncate(&fd, size as u64).map_err(|e| AmpError::Truncate(e.into()))?;

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| AmpError::Mmap(e.into()))?
        };
        let addr = mapped(addr)?;

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            fd: Some(fd),
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open a named region created by the other side
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            AmpError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| AmpError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        check_size(size)?;

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| AmpError::Mmap(e.into()))?
        };
        let addr = mapped(addr)?;

        Ok(Self {
            fd: Some(fd),
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Map a zeroed anonymous region, for two cores living in one process
    pub fn anonymous(size: usize) -> Result<Self> {
        check_size(size)?;
        let addr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .map_err(|e| AmpError::Mmap(e.into()))?
        };
        let addr = mapped(addr)?;

        Ok(Self {
            fd: None,
            addr,
            size,
            name: String::new(),
            is_owner: false,
        })
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of shared memory (empty for anonymous regions)
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle owns (and will unlink) the shared memory
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Whether `[offset, offset + len)` lies inside the region
    #[inline]
    pub fn contains(&self, offset: u32, len: usize) -> bool {
        (offset as usize)
            .checked_add(len)
            .map_or(false, |end| end <= self.size)
    }

    #[inline]
    fn check(&self, offset: u32, len: usize, align: usize) {
        assert!(
            self.contains(offset, len) && (offset as usize) % align == 0,
            "shared memory access out of range: offset={offset:#x} len={len}"
        );
    }

    /// 32-bit atomic word at `offset`
    #[inline]
    pub(crate) fn atomic_u32(&self, offset: u32) -> &AtomicU32 {
        self.check(offset, 4, 4);
        unsafe { &*(self.addr.as_ptr().add(offset as usize) as *const AtomicU32) }
    }

    /// 16-bit atomic field at `offset`
    #[inline]
    pub(crate) fn atomic_u16(&self, offset: u32) -> &AtomicU16 {
        self.check(offset, 2, 2);
        unsafe { &*(self.addr.as_ptr().add(offset as usize) as *const AtomicU16) }
    }

    /// Borrow `len` bytes at `offset`
    ///
    /// # Safety
    /// The ring protocol must guarantee the peer is not writing this range.
    #[inline]
    pub(crate) unsafe fn bytes(&self, offset: u32, len: usize) -> &[u8] {
        self.check(offset, len, 1);
        std::slice::from_raw_parts(self.addr.as_ptr().add(offset as usize), len)
    }

    /// Mutably borrow `len` bytes at `offset`
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of this range (an allocated,
    /// not yet sent buffer) for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn bytes_mut(&self, offset: u32, len: usize) -> &mut [u8] {
        self.check(offset, len, 1);
        std::slice::from_raw_parts_mut(self.addr.as_ptr().add(offset as usize), len)
    }

    /// Copy `data` into the region at `offset`
    #[inline]
    pub(crate) fn write_bytes(&self, offset: u32, data: &[u8]) {
        self.check(offset, data.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.addr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
    }

    /// Copy `buf.len()` bytes out of the region at `offset`
    #[inline]
    pub(crate) fn read_bytes(&self, offset: u32, buf: &mut [u8]) {
        self.check(offset, buf.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.addr.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            if let Ok(c_name) = CString::new(format!("{}{}", AMP_SHM_PREFIX, self.name)) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}

impl std::fmt::Debug for SharedMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMem")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("size", &self.size)
            .finish()
    }
}

fn shm_name(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(AmpError::NamespaceTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    CString::new(format!("{}{}", AMP_SHM_PREFIX, name))
        .map_err(|_| AmpError::InvalidArg("shared memory name contains a NUL byte"))
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 || size > u32::MAX as usize {
        return Err(AmpError::InvalidArg("shared memory size must fit a 32-bit offset"));
    }
    Ok(())
}

fn mapped(addr: *mut std::ffi::c_void) -> Result<NonNull<u8>> {
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        AmpError::Mmap(std::io::Error::new(
            std::io::ErrorKind::Other,
            "mmap returned null",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_create_and_open() {
        let name = format!("test_shm_{}", std::process::id());
        let size = 4096;

        let shm1 = SharedMem::create(&name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        shm1.atomic_u32(64).store(0xC0FFEE, Ordering::Release);

        // Open from the "other core"
        let shm2 = SharedMem::open(&name).unwrap();
        assert!(!shm2.is_owner());
        assert_eq!(shm2.size(), size);
        assert_eq!(shm2.atomic_u32(64).load(Ordering::Acquire), 0xC0FFEE);

        // Drop shm2 first, then shm1 will unlink
        drop(shm2);
        drop(shm1);
    }

    #[test]
    fn test_anonymous_bytes() {
        let shm = SharedMem::anonymous(256).unwrap();
        shm.write_bytes(10, b"hello");
        let mut buf = [0u8; 5];
        shm.read_bytes(10, &mut buf);
        assert_eq!(&buf, b"hello");
        assert!(shm.contains(250, 6));
        assert!(!shm.contains(250, 7));
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_access_panics() {
        let shm = SharedMem::anonymous(64).unwrap();
        shm.atomic_u32(64);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            SharedMem::anonymous(0),
            Err(AmpError::InvalidArg(_))
        ));
    }
}
