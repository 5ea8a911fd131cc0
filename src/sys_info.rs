//! Shared info directory
//!
//! An append-only, singly-linked list of named blobs carved out of the shared
//! pool. The main core publishes entries; the sub core finds them by id. This
//! is how the sub core learns where the rings and event words live.
//!
//! Entry layout (8 bytes, then the payload rounded up to a word):
//! `{ info_id: u16, size: u16, next: u32 }`, `next` being the region offset
//! of the following entry or 0 for the tail.

use crate::error::{AmpError, Result};
use crate::platform::{align_word, publish, CoreId};
use crate::shm::SharedMem;
use crate::sw_intr::SW_INTR_ST_SIZE;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// First id of the range used by the transport itself
pub const SYS_INFO_RESERVED_ID: u16 = 0xff00;
/// Event word written by the main core
pub const SYS_INFO_ID_EVENT_MAIN: u16 = 0xff01;
/// Event word written by the sub core
pub const SYS_INFO_ID_EVENT_SUB: u16 = 0xff02;
/// Default RPMsg virtqueue pair
pub const SYS_INFO_ID_VQUEUE: u16 = 0xff03;
/// System-service channel
pub const SYS_INFO_ID_SYSTEM: u16 = 0xff04;
/// Id of the list anchor
pub const SYS_INFO_ID_MAX: u16 = 0xffff;

/// Region offset of the list anchor
pub const SYS_INFO_POOL_START: u32 = SW_INTR_ST_SIZE;

const ENTRY_HEADER_SIZE: u32 = 8;

const ID_OFFSET: u32 = 0;
const SIZE_OFFSET: u32 = 2;
const NEXT_OFFSET: u32 = 4;

/// Directory handle of one core
pub struct SysInfo {
    mem: Arc<SharedMem>,
    core: CoreId,
    alloc_lock: Mutex<()>,
}

impl SysInfo {
    /// Attach to the pool inside `mem`
    pub fn new(mem: Arc<SharedMem>, core: CoreId) -> Result<Self> {
        let min = (SYS_INFO_POOL_START + ENTRY_HEADER_SIZE) as usize;
        if mem.size() < min {
            return Err(AmpError::RegionTooSmall {
                min,
                got: mem.size(),
            });
        }
        Ok(Self {
            mem,
            core,
            alloc_lock: Mutex::new(()),
        })
    }

    /// Reset the directory to an empty list (main core only, no-op on the sub core)
    pub fn init(&self) {
        if self.core.is_main() {
            let _guard = self.alloc_lock.lock();
            self.write_header(SYS_INFO_POOL_START, SYS_INFO_ID_MAX, 0);
            self.next_of(SYS_INFO_POOL_START).store(0, Ordering::Release);
        }
        info!(
            target: "sys_info",
            "shared memory pool: offset={:#x}, len={:#x}",
            SYS_INFO_POOL_START,
            self.mem.size() - SYS_INFO_POOL_START as usize
        );
    }

    /// Allocate a `size`-byte blob under `id` and return its region offset
    ///
    /// Fails with [`AmpError::Exist`] if `id` is already published and with
    /// [`AmpError::NoMem`] once the pool is exhausted. Only the main core may
    /// allocate.
    pub fn alloc(&self, id: u16, size: usize) -> Result<u32> {
        if !self.core.is_main() {
            return Err(AmpError::NotSupported);
        }
        if id == SYS_INFO_ID_MAX {
            return Err(AmpError::InvalidArg("sys-info id 0xffff is the list anchor"));
        }
        let size16 = u16::try_from(size).map_err(|_| AmpError::NoMem {
            max: u16::MAX as usize,
            got: size,
        })?;

        let _guard = self.alloc_lock.lock();

        let mut tail = SYS_INFO_POOL_START;
        loop {
            let next = self.next_of(tail).load(Ordering::Acquire);
            if next == 0 {
                break;
            }
            if self.id_of(next) == id {
                error!(target: "sys_info", "info id({:#x}) already exist", id);
                return Err(AmpError::Exist);
            }
            tail = next;
        }

        let start = tail as usize
            + ENTRY_HEADER_SIZE as usize
            + align_word(self.size_of(tail) as usize);
        let end = start + ENTRY_HEADER_SIZE as usize + align_word(size);
        if end > self.mem.size() {
            error!(target: "sys_info", "no space in pool for id {:#x} ({} bytes)", id, size);
            return Err(AmpError::NoMem {
                max: self.mem.size().saturating_sub(start + ENTRY_HEADER_SIZE as usize),
                got: size,
            });
        }

        let start = start as u32;
        self.write_header(start, id, size16);
        self.next_of(start).store(0, Ordering::Relaxed);
        publish();
        self.next_of(tail).store(start, Ordering::Release);

        let buffer = start + ENTRY_HEADER_SIZE;
        debug!(target: "sys_info", "alloc info:{:#x}, size:{:#x}, offset:{:#x}", id, size, buffer);
        Ok(buffer)
    }

    /// Look up `id`, returning the blob's region offset and size
    pub fn get(&self, id: u16) -> Result<(u32, u16)> {
        let mut entry = self.next_of(SYS_INFO_POOL_START).load(Ordering::Acquire);
        while entry != 0 {
            if self.id_of(entry) == id {
                let size = self.size_of(entry);
                let buffer = entry + ENTRY_HEADER_SIZE;
                debug!(target: "sys_info", "get info:{:#x}, size:{:#x}, offset:{:#x}", id, size, buffer);
                return Ok((buffer, size));
            }
            entry = self.next_of(entry).load(Ordering::Acquire);
        }

        error!(target: "sys_info", "INFO_ID({:#x}) not found", id);
        Err(AmpError::NotFound)
    }

    /// Log every published entry
    pub fn dump(&self) {
        info!(target: "sys_info", "INFO_ID\tSIZE\tOFFSET");
        let mut entry = self.next_of(SYS_INFO_POOL_START).load(Ordering::Acquire);
        while entry != 0 {
            info!(
                target: "sys_info",
                "{:#06x}\t{:#06x}\t{:#x}",
                self.id_of(entry),
                self.size_of(entry),
                entry + ENTRY_HEADER_SIZE
            );
            entry = self.next_of(entry).load(Ordering::Acquire);
        }
    }

    /// Region the directory lives in
    #[inline]
    pub fn mem(&self) -> &Arc<SharedMem> {
        &self.mem
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    fn write_header(&self, entry: u32, id: u16, size: u16) {
        self.mem.atomic_u16(entry + ID_OFFSET).store(id, Ordering::Relaxed);
        self.mem.atomic_u16(entry + SIZE_OFFSET).store(size, Ordering::Relaxed);
    }

    fn id_of(&self, entry: u32) -> u16 {
        self.mem.atomic_u16(entry + ID_OFFSET).load(Ordering::Relaxed)
    }

    fn size_of(&self, entry: u32) -> u16 {
        self.mem.atomic_u16(entry + SIZE_OFFSET).load(Ordering::Relaxed)
    }

    fn next_of(&self, entry: u32) -> &std::sync::atomic::AtomicU32 {
        self.mem.atomic_u32(entry + NEXT_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(size: usize) -> (SysInfo, SysInfo) {
        let mem = Arc::new(SharedMem::anonymous(size).unwrap());
        let main = SysInfo::new(mem.clone(), CoreId::Main).unwrap();
        let sub = SysInfo::new(mem, CoreId::Sub).unwrap();
        main.init();
        sub.init();
        (main, sub)
    }

    #[test]
    fn test_alloc_then_get_from_peer() {
        let (main, sub) = pair(1024);

        let a = main.alloc(0x10, 6).unwrap();
        let b = main.alloc(0x11, 4).unwrap();
        assert_eq!(a % 4, 0);
        // 6 bytes round up to 8, plus the next entry header
        assert_eq!(b, a + 8 + ENTRY_HEADER_SIZE);

        assert_eq!(sub.get(0x10).unwrap(), (a, 6));
        assert_eq!(sub.get(0x11).unwrap(), (b, 4));
        assert!(matches!(sub.get(0x12), Err(AmpError::NotFound)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (main, _sub) = pair(1024);
        main.alloc(0x20, 16).unwrap();
        assert!(matches!(main.alloc(0x20, 16), Err(AmpError::Exist)));
    }

    #[test]
    fn test_sub_core_cannot_alloc() {
        let (_main, sub) = pair(1024);
        assert!(matches!(sub.alloc(0x30, 4), Err(AmpError::NotSupported)));
    }

    #[test]
    fn test_pool_exhaustion() {
        let (main, _sub) = pair(128);
        // pool: 128 - 16 reserved - 8 anchor = 104 bytes
        main.alloc(0x40, 64).unwrap();
        assert!(matches!(main.alloc(0x41, 64), Err(AmpError::NoMem { .. })));
        main.alloc(0x42, 24).unwrap();
    }

    #[test]
    fn test_region_too_small() {
        let mem = Arc::new(SharedMem::anonymous(16).unwrap());
        assert!(matches!(
            SysInfo::new(mem, CoreId::Main),
            Err(AmpError::RegionTooSmall { .. })
        ));
    }
}
