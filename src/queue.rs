//! Virtqueue: a split descriptor ring shared by two cores
//!
//! # Design
//! - One side is the *master*: it allocates buffers and sends them.
//! - The other side is the *remote*: it receives buffers and frees them back.
//! - Each descriptor packs two state bits in its `flags` word, AVAILABLE
//!   (bit 7) and USED (bit 15). Each side keeps a one-bit flip counter per
//!   index that toggles every lap of the ring, so comparing a bit against the
//!   counter tells "touched this lap" from "touched last lap".
//!
//! Shared layout, all offsets relative to the region base:
//!
//! ```text
//! conf:  { queue_size: u16, max_item_size: u16, buffer: u32, desc: u32 }
//! desc:  [{ addr: u32, len: u16, flags: u16 }; queue_size]
//! data:  [[u8; max_item_size]; queue_size]
//! ```
//!
//! Index and flip-counter state is private to each side. No operation blocks
//! and no slot is ever written by both sides without an ownership hand-over
//! in between, so the ring needs no lock of its own.

use crate::error::{AmpError, Result};
use crate::platform::{acquire, item_len, publish, ring_len};
use crate::shm::SharedMem;
use crate::sw_intr::{IntrHandler, SwIntr, SwIntrId};
use crate::sys_info::SysInfo;
use log::debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Size of the queue config block
pub const QUEUE_CONF_SIZE: usize = 12;
/// Size of one descriptor
pub const QUEUE_DESC_SIZE: usize = 8;

const CONF_SIZE_OFFSET: u32 = 0;
const CONF_ITEM_OFFSET: u32 = 2;
const CONF_BUFFER_OFFSET: u32 = 4;
const CONF_DESC_OFFSET: u32 = 8;

const DESC_ADDR_OFFSET: u32 = 0;
const DESC_LEN_OFFSET: u32 = 4;
const DESC_FLAGS_OFFSET: u32 = 6;

#[inline(always)]
const fn available_mask(bit: u16) -> u16 {
    bit << 7
}

#[inline(always)]
const fn used_mask(bit: u16) -> u16 {
    bit << 15
}

/// Slot has been returned by the remote (master may claim it)
#[inline(always)]
fn flag_is_used(flip: u16, flags: u16) -> bool {
    (available_mask(1) & flags) != available_mask(flip) && (used_mask(1) & flags) != used_mask(flip)
}

/// Slot has been filled by the master (remote may take it)
#[inline(always)]
fn flag_is_available(flip: u16, flags: u16) -> bool {
    (available_mask(1) & flags) == available_mask(flip) && (used_mask(1) & flags) != used_mask(flip)
}

/// Bytes of shared memory one queue needs
pub fn queue_shm_size(queue_len: u16, item_size: u16) -> usize {
    QUEUE_CONF_SIZE + (QUEUE_DESC_SIZE + item_size as usize) * queue_len as usize
}

/// Peer notification issued after every successful send
pub type Notify = Arc<dyn Fn() + Send + Sync>;

/// Fixed role of one end of the ring
pub enum Role {
    /// Allocates and sends; `notify` runs after each send
    Master { notify: Option<Notify> },
    /// Receives and frees; `callback` is what [`Virtqueue::intr_enable`] installs
    Remote { callback: Option<IntrHandler> },
}

impl Role {
    pub fn master() -> Role {
        Role::Master { notify: None }
    }

    pub fn remote() -> Role {
        Role::Remote { callback: None }
    }
}

/// Lay out a queue config with `queue_len` descriptors over `buffer`
///
/// Every descriptor starts out pointing at its own `item_size` slice of the
/// data area with all state bits clear, which reads as "returned" on the
/// first lap.
pub fn init_buffer(
    mem: &SharedMem,
    conf: u32,
    queue_len: u16,
    item_size: u16,
    desc: u32,
    buffer: u32,
) -> Result<()> {
    let desc_len = QUEUE_DESC_SIZE * queue_len as usize;
    let data_len = item_size as usize * queue_len as usize;
    if !mem.contains(conf, QUEUE_CONF_SIZE) || !mem.contains(desc, desc_len) || !mem.contains(buffer, data_len) {
        return Err(AmpError::InvalidArg("queue layout outside the shared region"));
    }

    mem.atomic_u16(conf + CONF_SIZE_OFFSET).store(queue_len, Ordering::Relaxed);
    mem.atomic_u16(conf + CONF_ITEM_OFFSET).store(item_size, Ordering::Relaxed);
    mem.atomic_u32(conf + CONF_BUFFER_OFFSET).store(buffer, Ordering::Relaxed);
    mem.atomic_u32(conf + CONF_DESC_OFFSET).store(desc, Ordering::Relaxed);

    let mut addr = buffer;
    for idx in 0..queue_len as u32 {
        let d = desc + idx * QUEUE_DESC_SIZE as u32;
        mem.atomic_u32(d + DESC_ADDR_OFFSET).store(addr, Ordering::Relaxed);
        mem.atomic_u16(d + DESC_LEN_OFFSET).store(item_size, Ordering::Relaxed);
        mem.atomic_u16(d + DESC_FLAGS_OFFSET).store(0, Ordering::Relaxed);
        addr += item_size as u32;
    }
    publish();
    Ok(())
}

/// One end of a virtqueue
pub struct Virtqueue {
    mem: Arc<SharedMem>,
    desc: u32,
    buffer: u32,
    size: u16,
    max_item_size: u16,
    free_index: u16,
    used_index: u16,
    free_flip: u16,
    used_flip: u16,
    role: Role,
}

impl Virtqueue {
    /// Attach to the queue config at `conf`
    pub fn create(mem: Arc<SharedMem>, conf: u32, role: Role) -> Result<Self> {
        if !mem.contains(conf, QUEUE_CONF_SIZE) {
            return Err(AmpError::InvalidArg("queue config outside the shared region"));
        }
        acquire();
        let size = mem.atomic_u16(conf + CONF_SIZE_OFFSET).load(Ordering::Relaxed);
        let max_item_size = mem.atomic_u16(conf + CONF_ITEM_OFFSET).load(Ordering::Relaxed);
        let buffer = mem.atomic_u32(conf + CONF_BUFFER_OFFSET).load(Ordering::Relaxed);
        let desc = mem.atomic_u32(conf + CONF_DESC_OFFSET).load(Ordering::Relaxed);

        if !size.is_power_of_two() || max_item_size == 0 {
            return Err(AmpError::InvalidArg("queue config is not initialized"));
        }
        if !mem.contains(desc, QUEUE_DESC_SIZE * size as usize)
            || !mem.contains(buffer, max_item_size as usize * size as usize)
        {
            return Err(AmpError::InvalidArg("queue layout outside the shared region"));
        }

        Ok(Self {
            mem,
            desc,
            buffer,
            size,
            max_item_size,
            free_index: 0,
            used_index: 0,
            free_flip: 1,
            used_flip: 1,
            role,
        })
    }

    /// Allocate a queue under `sysinfo_id` and attach to it (main core)
    ///
    /// `queue_len` is rounded up to a power of two and `item_size` to a word.
    pub fn main_init(
        sys_info: &SysInfo,
        queue_len: u16,
        item_size: u16,
        role: Role,
        sysinfo_id: u16,
    ) -> Result<Self> {
        let (queue_len, item_size) = match (ring_len(queue_len), item_len(item_size)) {
            (Some(len), Some(item)) => (len, item),
            _ => return Err(AmpError::InvalidArg("queue length or item size out of range")),
        };

        let conf = sys_info.alloc(sysinfo_id, queue_shm_size(queue_len, item_size))?;
        let desc = conf + QUEUE_CONF_SIZE as u32;
        let buffer = desc + (QUEUE_DESC_SIZE * queue_len as usize) as u32;
        init_buffer(sys_info.mem(), conf, queue_len, item_size, desc, buffer)?;
        debug!(
            target: "vqueue",
            "main init: id={:#06x} conf={:#x} len={} item={}",
            sysinfo_id, conf, queue_len, item_size
        );

        Self::create(sys_info.mem().clone(), conf, role)
    }

    /// Attach to a queue the main core published under `sysinfo_id`
    pub fn sub_init(sys_info: &SysInfo, role: Role, sysinfo_id: u16) -> Result<Self> {
        let (conf, _) = sys_info.get(sysinfo_id)?;
        debug!(target: "vqueue", "sub init: id={:#06x} conf={:#x}", sysinfo_id, conf);
        Self::create(sys_info.mem().clone(), conf, role)
    }

    /// Run the remote callback whenever line `id` fires
    pub fn intr_enable(&self, sw_intr: &SwIntr, id: SwIntrId) -> Result<()> {
        match &self.role {
            Role::Master { .. } => Err(AmpError::NotSupported),
            Role::Remote { callback: None } => Err(AmpError::InvalidArg("remote queue has no callback")),
            Role::Remote {
                callback: Some(callback),
            } => sw_intr.add_handler(id, callback.clone()),
        }
    }

    /// Install the remote callback; ignored on a master
    pub(crate) fn set_callback(&mut self, handler: IntrHandler) {
        if let Role::Remote { callback } = &mut self.role {
            *callback = Some(handler);
        }
    }

    /// Claim the next returned buffer for writing (master only)
    pub fn alloc(&mut self, size: u16) -> Result<u32> {
        if !self.is_master() {
            return Err(AmpError::NotSupported);
        }
        if size > self.max_item_size {
            return Err(AmpError::NoMem {
                max: self.max_item_size as usize,
                got: size as usize,
            });
        }

        let q_idx = self.free_index & (self.size - 1);
        let flags = self.flags(q_idx).load(Ordering::Acquire);
        acquire();
        if !flag_is_used(self.free_flip, flags) {
            return Err(AmpError::NotFound);
        }

        let buffer = self.desc_addr(q_idx);
        self.free_index = self.free_index.wrapping_add(1);
        if q_idx == self.size - 1 {
            self.free_flip ^= 1;
        }
        Ok(buffer)
    }

    /// Hand the oldest allocated buffer to the remote (master only)
    pub fn send(&mut self, buffer: u32, size: u16) -> Result<()> {
        if !self.is_master() {
            return Err(AmpError::NotSupported);
        }
        if self.used_index == self.free_index {
            // send before alloc
            return Err(AmpError::NotAllowed);
        }
        if size > self.max_item_size {
            return Err(AmpError::NoMem {
                max: self.max_item_size as usize,
                got: size as usize,
            });
        }

        let q_idx = self.used_index & (self.size - 1);
        let flags = self.flags(q_idx);
        let current = flags.load(Ordering::Acquire);
        acquire();
        if !flag_is_used(self.used_flip, current) {
            return Err(AmpError::NotAllowed);
        }

        let d = self.desc_at(q_idx);
        self.mem.atomic_u32(d + DESC_ADDR_OFFSET).store(buffer, Ordering::Relaxed);
        self.mem.atomic_u16(d + DESC_LEN_OFFSET).store(size, Ordering::Relaxed);
        publish();
        // the slot was "used", so the AVAILABLE bit differs from the counter; toggling makes it equal
        flags.fetch_xor(available_mask(1), Ordering::Release);
        self.used_index = self.used_index.wrapping_add(1);
        if q_idx == self.size - 1 {
            self.used_flip ^= 1;
        }

        if let Role::Master { notify: Some(notify) } = &self.role {
            notify();
        }
        Ok(())
    }

    /// Take the next filled buffer, returning its offset and length (remote only)
    ///
    /// The buffer stays owned by the caller until [`free`](Self::free).
    pub fn recv(&mut self) -> Result<(u32, u16)> {
        if self.is_master() {
            return Err(AmpError::NotSupported);
        }

        let q_idx = self.free_index & (self.size - 1);
        let flags = self.flags(q_idx).load(Ordering::Acquire);
        acquire();
        if !flag_is_available(self.free_flip, flags) {
            return Err(AmpError::NotFound);
        }

        let d = self.desc_at(q_idx);
        let buffer = self.mem.atomic_u32(d + DESC_ADDR_OFFSET).load(Ordering::Relaxed);
        let size = self.mem.atomic_u16(d + DESC_LEN_OFFSET).load(Ordering::Relaxed);
        self.free_index = self.free_index.wrapping_add(1);
        if q_idx == self.size - 1 {
            self.free_flip ^= 1;
        }
        Ok((buffer, size))
    }

    /// Return a received buffer to the master (remote only)
    pub fn free(&mut self, buffer: u32) -> Result<()> {
        if self.is_master() {
            return Err(AmpError::NotSupported);
        }
        if self.used_index == self.free_index {
            // free before recv
            return Err(AmpError::NotAllowed);
        }

        let q_idx = self.used_index & (self.size - 1);
        let flags = self.flags(q_idx);
        let current = flags.load(Ordering::Acquire);
        acquire();
        if !flag_is_available(self.used_flip, current) {
            return Err(AmpError::NotAllowed);
        }

        let d = self.desc_at(q_idx);
        self.mem.atomic_u32(d + DESC_ADDR_OFFSET).store(buffer, Ordering::Relaxed);
        self.mem
            .atomic_u16(d + DESC_LEN_OFFSET)
            .store(self.max_item_size, Ordering::Relaxed);
        publish();
        flags.fetch_xor(used_mask(1), Ordering::Release);
        self.used_index = self.used_index.wrapping_add(1);
        if q_idx == self.size - 1 {
            self.used_flip ^= 1;
        }
        Ok(())
    }

    /// Copy `data` into an owned buffer
    pub fn write_buffer(&self, buffer: u32, data: &[u8]) -> Result<()> {
        self.check_buffer(buffer, data.len())?;
        self.mem.write_bytes(buffer, data);
        Ok(())
    }

    /// Copy `buf.len()` bytes out of an owned buffer
    pub fn read_buffer(&self, buffer: u32, buf: &mut [u8]) -> Result<()> {
        self.check_buffer(buffer, buf.len())?;
        self.mem.read_bytes(buffer, buf);
        Ok(())
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Master { .. })
    }

    /// Ring length (always a power of two)
    #[inline]
    pub fn capacity(&self) -> u16 {
        self.size
    }

    #[inline]
    pub fn max_item_size(&self) -> u16 {
        self.max_item_size
    }

    #[inline]
    pub fn mem(&self) -> &Arc<SharedMem> {
        &self.mem
    }

    fn check_buffer(&self, buffer: u32, len: usize) -> Result<()> {
        let data_end = self.buffer as usize + self.size as usize * self.max_item_size as usize;
        if len > self.max_item_size as usize {
            return Err(AmpError::NoMem {
                max: self.max_item_size as usize,
                got: len,
            });
        }
        if buffer < self.buffer || buffer as usize + len > data_end {
            return Err(AmpError::InvalidArg("buffer does not belong to this queue"));
        }
        Ok(())
    }

    #[inline]
    fn desc_at(&self, q_idx: u16) -> u32 {
        self.desc + q_idx as u32 * QUEUE_DESC_SIZE as u32
    }

    #[inline]
    fn desc_addr(&self, q_idx: u16) -> u32 {
        self.mem
            .atomic_u32(self.desc_at(q_idx) + DESC_ADDR_OFFSET)
            .load(Ordering::Relaxed)
    }

    #[inline]
    fn flags(&self, q_idx: u16) -> &std::sync::atomic::AtomicU16 {
        self.mem.atomic_u16(self.desc_at(q_idx) + DESC_FLAGS_OFFSET)
    }
}
