//! Cross-core event bits
//!
//! Each direction owns one 32-bit word in the shared pool, published through
//! sys-info. The writer ORs bits in and raises [`SwIntrId::EVENT`]; the reader
//! either polls the word ([`Event::wait`]) or, where a scheduler exists, binds
//! the word to a native [`EventGroup`] so waiters block instead of spinning
//! ([`EventTable`]).

use crate::error::{AmpError, Result};
use crate::platform::Platform;
use crate::sw_intr::{IntrHandler, SwIntr, SwIntrId};
use crate::sys_info::SysInfo;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout value meaning "wait forever"
pub const WAIT_FOREVER: u32 = u32::MAX;

const EVENT_WORD_SIZE: usize = std::mem::size_of::<u32>();

/// Handle to one shared event word
#[derive(Clone)]
pub struct Event {
    sys_info: Arc<SysInfo>,
    sw_intr: Arc<SwIntr>,
    sysinfo_id: u16,
    offset: u32,
}

impl Event {
    /// Allocate and zero a new event word (main core only)
    pub fn create(sys_info: Arc<SysInfo>, sw_intr: Arc<SwIntr>, sysinfo_id: u16) -> Result<Self> {
        let offset = sys_info.alloc(sysinfo_id, EVENT_WORD_SIZE)?;
        sys_info.mem().atomic_u32(offset).store(0, Ordering::SeqCst);
        Ok(Self {
            sys_info,
            sw_intr,
            sysinfo_id,
            offset,
        })
    }

    /// Attach to an event word published by the main core
    pub fn open(sys_info: Arc<SysInfo>, sw_intr: Arc<SwIntr>, sysinfo_id: u16) -> Result<Self> {
        let offset = word_offset(&sys_info, sysinfo_id)?;
        Ok(Self {
            sys_info,
            sw_intr,
            sysinfo_id,
            offset,
        })
    }

    #[inline]
    pub fn sysinfo_id(&self) -> u16 {
        self.sysinfo_id
    }

    /// Set `mask` and interrupt the peer; returns the previous bits
    pub fn notify(&self, mask: u32) -> u32 {
        let prev = self.word().fetch_or(mask, Ordering::SeqCst);
        debug!(target: "event", "notify event({:#06x}) {:#x}", self.sysinfo_id, mask);
        self.sw_intr.trigger(SwIntrId::EVENT);
        prev
    }

    /// Spin on the shared word until `mask` is satisfied or `timeout_ms` elapses
    ///
    /// Returns the last observed word. On timeout it may hold a partial
    /// match, so callers must test the result against their own mask.
    /// With `wait_for_all` and `clear_on_exit`, requested bits are cleared only
    /// when every one of them was present; concurrent writes to other bits by
    /// the peer are never lost.
    pub fn wait(&self, mask: u32, clear_on_exit: bool, wait_for_all: bool, timeout_ms: u32) -> u32 {
        let platform = self.sw_intr.platform();
        let start = platform.now_ms();
        let word = self.word();

        if wait_for_all {
            let mut expected = mask;
            let mut desired = if clear_on_exit { 0 } else { mask };
            loop {
                match word.compare_exchange_weak(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => return expected,
                    Err(actual) => {
                        expected = actual | mask;
                        desired = if clear_on_exit { expected & !mask } else { expected };

                        if actual & mask != mask {
                            if elapsed(platform.as_ref(), start) > timeout_ms {
                                return actual;
                            }
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        } else {
            loop {
                let bits = if clear_on_exit {
                    word.fetch_and(!mask, Ordering::SeqCst)
                } else {
                    word.load(Ordering::SeqCst)
                };

                if bits & mask != 0 || elapsed(platform.as_ref(), start) > timeout_ms {
                    return bits;
                }
                std::hint::spin_loop();
            }
        }
    }

    /// Single non-blocking check, same semantics as [`wait`](Self::wait) with a zero timeout
    pub fn poll(&self, mask: u32, clear_on_exit: bool, wait_for_all: bool) -> u32 {
        self.wait(mask, clear_on_exit, wait_for_all, 0)
    }

    /// Clear `mask` only; returns the previous bits
    pub fn clear(&self, mask: u32) -> u32 {
        let word = self.word();
        let mut expected = 0;
        let mut desired = 0;
        loop {
            match word.compare_exchange_weak(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return expected,
                Err(actual) => {
                    expected = actual;
                    desired = actual & !mask;
                }
            }
        }
    }

    fn word(&self) -> &AtomicU32 {
        self.sys_info.mem().atomic_u32(self.offset)
    }
}

fn word_offset(sys_info: &SysInfo, sysinfo_id: u16) -> Result<u32> {
    let (offset, size) = sys_info.get(sysinfo_id)?;
    if size as usize != EVENT_WORD_SIZE {
        return Err(AmpError::InvalidArg("sys-info entry is not an event word"));
    }
    Ok(offset)
}

fn elapsed(platform: &dyn Platform, start: u32) -> u32 {
    platform.now_ms().wrapping_sub(start)
}

/// Native wait object that blocked tasks sleep on
#[derive(Default)]
pub struct EventGroup {
    bits: Mutex<u32>,
    cv: Condvar,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `bits` in and wake waiters; returns the new value
    pub fn set_bits(&self, bits: u32) -> u32 {
        let mut value = self.bits.lock();
        *value |= bits;
        self.cv.notify_all();
        *value
    }

    /// Clear `bits`; returns the previous value
    pub fn clear_bits(&self, bits: u32) -> u32 {
        let mut value = self.bits.lock();
        let prev = *value;
        *value &= !bits;
        prev
    }

    pub fn get_bits(&self) -> u32 {
        *self.bits.lock()
    }

    /// Block until `mask` is satisfied or `timeout` elapses (`None` waits forever)
    ///
    /// Returns the bits as they were when the wait ended, before any clearing.
    pub fn wait_bits(
        &self,
        mask: u32,
        clear_on_exit: bool,
        wait_for_all: bool,
        timeout: Option<Duration>,
    ) -> u32 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let satisfied = |bits: u32| {
            if wait_for_all {
                bits & mask == mask
            } else {
                bits & mask != 0
            }
        };

        let mut value = self.bits.lock();
        loop {
            let bits = *value;
            if satisfied(bits) {
                if clear_on_exit {
                    *value &= !mask;
                }
                return bits;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut value, deadline).timed_out() {
                        let bits = *value;
                        if satisfied(bits) && clear_on_exit {
                            *value &= !mask;
                        }
                        return bits;
                    }
                }
                None => self.cv.wait(&mut value),
            }
        }
    }
}

struct Binding {
    sysinfo_id: u16,
    offset: u32,
    group: Arc<EventGroup>,
}

/// Bindings from shared event words to native wait objects
pub struct EventTable {
    sys_info: Arc<SysInfo>,
    slots: Mutex<Vec<Option<Binding>>>,
}

impl EventTable {
    pub fn new(sys_info: Arc<SysInfo>, table_len: usize) -> Self {
        let mut slots = Vec::with_capacity(table_len);
        slots.resize_with(table_len, || None);
        Self {
            sys_info,
            slots: Mutex::new(slots),
        }
    }

    /// Forward the word `sysinfo_id` into `group`
    ///
    /// Re-binding an id replaces its group. Bits that arrived before the
    /// binding are flushed into the group so no wake-up is missed.
    pub fn bind(&self, sysinfo_id: u16, group: Arc<EventGroup>) -> Result<()> {
        let offset = word_offset(&self.sys_info, sysinfo_id)?;

        {
            let mut slots = self.slots.lock();
            let len = slots.len();
            let dup = slots
                .iter()
                .position(|s| s.as_ref().map_or(false, |b| b.sysinfo_id == sysinfo_id));
            let free = slots.iter().position(|s| s.is_none());
            let idx = dup.or(free).ok_or(AmpError::NoMem {
                max: len,
                got: len + 1,
            })?;
            slots[idx] = Some(Binding {
                sysinfo_id,
                offset,
                group: group.clone(),
            });
        }

        let pending = take_word(self.sys_info.mem().atomic_u32(offset));
        group.set_bits(pending);
        debug!(target: "event", "event_bits({:#06x}) bind value {:#x}", sysinfo_id, pending);
        Ok(())
    }

    pub fn unbind(&self, sysinfo_id: u16) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.as_ref().map_or(false, |b| b.sysinfo_id == sysinfo_id))
        {
            *slot = None;
        }
    }

    /// Group bound to `sysinfo_id`
    pub fn group(&self, sysinfo_id: u16) -> Option<Arc<EventGroup>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|b| b.sysinfo_id == sysinfo_id)
            .map(|b| b.group.clone())
    }

    /// Block on the group bound to `sysinfo_id`
    pub fn wait(
        &self,
        sysinfo_id: u16,
        mask: u32,
        clear_on_exit: bool,
        wait_for_all: bool,
        timeout_ms: u32,
    ) -> Result<u32> {
        let group = self.group(sysinfo_id).ok_or(AmpError::NotFound)?;
        let timeout = (timeout_ms != WAIT_FOREVER).then(|| Duration::from_millis(timeout_ms as u64));
        Ok(group.wait_bits(mask, clear_on_exit, wait_for_all, timeout))
    }

    /// Clear bits of the group bound to `sysinfo_id`; returns the previous bits
    pub fn clear(&self, sysinfo_id: u16, mask: u32) -> Result<u32> {
        let group = self.group(sysinfo_id).ok_or(AmpError::NotFound)?;
        Ok(group.clear_bits(mask))
    }

    /// Drain every bound word into its group; returns whether any bits moved
    pub fn handle_interrupt(&self) -> bool {
        let slots = self.slots.lock();
        let mut woken = false;
        for binding in slots.iter().flatten() {
            let pending = take_word(self.sys_info.mem().atomic_u32(binding.offset));
            debug!(target: "event", "got event: sysinfo={:#06x}, pending={:#x}", binding.sysinfo_id, pending);
            if pending != 0 {
                binding.group.set_bits(pending);
                woken = true;
            }
        }
        woken
    }

    /// Handler to register on [`SwIntrId::EVENT`]
    pub fn isr_handler(self: &Arc<Self>) -> IntrHandler {
        let table = Arc::downgrade(self);
        Arc::new(move || table.upgrade().map_or(false, |t| t.handle_interrupt()))
    }

    pub fn dump(&self) {
        info!(target: "event", "ID\tGROUP");
        for binding in self.slots.lock().iter().flatten() {
            info!(target: "event", "{:#06x}\t{:p}", binding.sysinfo_id, Arc::as_ptr(&binding.group));
        }
    }
}

fn take_word(word: &AtomicU32) -> u32 {
    let mut current = word.load(Ordering::SeqCst);
    loop {
        match word.compare_exchange_weak(current, 0, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(taken) => return taken,
            Err(actual) => current = actual,
        }
    }
}
