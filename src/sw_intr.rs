//! Software interrupt multiplexer
//!
//! Up to 32 logical interrupt lines share the one physical cross-core
//! interrupt of each direction. A trigger sets the line's bit in the peer's
//! pending word (first 16 bytes of the shared region) and raises the physical
//! interrupt; the peer's ISR drains the word and runs every handler whose line
//! is pending.

use crate::error::{AmpError, Result};
use crate::platform::{CoreId, Platform};
use crate::shm::SharedMem;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bytes reserved at the start of the shared region for the pending words
pub const SW_INTR_ST_SIZE: u32 = 16;

/// Pending word drained by the main core
const MAIN_CORE_ST: u32 = 0;
/// Pending word drained by the sub core
const SUB_CORE_ST: u32 = 4;

/// Default capacity of the handler table
pub const DEFAULT_HANDLER_TABLE_LEN: usize = 16;

/// Logical interrupt line, 0..=31
///
/// Lines 0..=15 are free for applications; 16..=31 are reserved for the
/// transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwIntrId(u8);

impl SwIntrId {
    pub const MAX: u8 = 31;
    /// System-service channel
    pub const SYS_SVC: SwIntrId = SwIntrId(27);
    /// Sub core panic notification
    pub const PANIC: SwIntrId = SwIntrId(28);
    /// RPMsg data available
    pub const RPMSG: SwIntrId = SwIntrId(29);
    /// Event bits changed
    pub const EVENT: SwIntrId = SwIntrId(30);

    pub const fn new(id: u8) -> Option<SwIntrId> {
        if id <= Self::MAX {
            Some(SwIntrId(id))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

/// Interrupt handler; returns whether a higher-priority task was woken
///
/// Handlers run in interrupt context and must not block.
pub type IntrHandler = Arc<dyn Fn() -> bool + Send + Sync>;

struct HandlerSlot {
    id: SwIntrId,
    handler: IntrHandler,
}

/// Per-core multiplexer
pub struct SwIntr {
    mem: Arc<SharedMem>,
    core: CoreId,
    platform: Arc<dyn Platform>,
    handlers: Mutex<Vec<Option<HandlerSlot>>>,
}

impl SwIntr {
    pub fn new(
        mem: Arc<SharedMem>,
        core: CoreId,
        platform: Arc<dyn Platform>,
        table_len: usize,
    ) -> Result<Self> {
        if mem.size() < SW_INTR_ST_SIZE as usize {
            return Err(AmpError::RegionTooSmall {
                min: SW_INTR_ST_SIZE as usize,
                got: mem.size(),
            });
        }
        if table_len == 0 {
            return Err(AmpError::InvalidArg("handler table length must be non-zero"));
        }
        let mut handlers = Vec::with_capacity(table_len);
        handlers.resize_with(table_len, || None);
        Ok(Self {
            mem,
            core,
            platform,
            handlers: Mutex::new(handlers),
        })
    }

    /// Clear the pending words (main core) and bring up the physical line
    pub fn init(&self) -> Result<()> {
        if self.core.is_main() {
            self.mem.atomic_u32(MAIN_CORE_ST).store(0, Ordering::SeqCst);
            self.mem.atomic_u32(SUB_CORE_ST).store(0, Ordering::SeqCst);
        }
        self.platform.install_sw_intr()?;
        self.platform.enable_sw_intr();
        Ok(())
    }

    /// Register `handler` for line `id` in the first empty slot
    ///
    /// The same line may carry several handlers; they run in table order.
    pub fn add_handler(&self, id: SwIntrId, handler: IntrHandler) -> Result<()> {
        let mut table = self.handlers.lock();
        let len = table.len();
        match table.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(HandlerSlot { id, handler });
                Ok(())
            }
            None => Err(AmpError::NoMem {
                max: len,
                got: len + 1,
            }),
        }
    }

    /// Remove every slot registered with exactly this line and handler
    pub fn delete_handler(&self, id: SwIntrId, handler: &IntrHandler) {
        let mut table = self.handlers.lock();
        for slot in table.iter_mut() {
            let matches = slot
                .as_ref()
                .map_or(false, |s| s.id == id && Arc::ptr_eq(&s.handler, handler));
            if matches {
                *slot = None;
            }
        }
    }

    /// Mark line `id` pending on the peer and raise the physical interrupt
    pub fn trigger(&self, id: SwIntrId) {
        self.peer_word().fetch_or(id.bit(), Ordering::SeqCst);
        self.platform.raise_sw_intr();
    }

    /// Interrupt service routine of this core
    ///
    /// Drains the pending word, runs the matching handlers and repeats until no
    /// new line arrived during the pass. Returns the OR of the handlers'
    /// "task woken" results.
    pub fn handle_interrupt(&self) -> bool {
        let mut need_yield = false;
        let mut unprocessed = self.drain();
        debug!(target: "sw_intr", "{:?} core pending={:#x}", self.core, unprocessed);

        while unprocessed != 0 {
            let ready: Vec<IntrHandler> = self
                .handlers
                .lock()
                .iter()
                .flatten()
                .filter(|slot| unprocessed & slot.id.bit() != 0)
                .map(|slot| slot.handler.clone())
                .collect();

            for handler in ready {
                need_yield |= handler();
            }

            unprocessed = self.drain();
        }

        need_yield
    }

    /// Log the registered handlers
    pub fn dump(&self) {
        debug!(target: "sw_intr", "== sw handlers ==");
        for slot in self.handlers.lock().iter().flatten() {
            debug!(target: "sw_intr", "{}\t{:p}", slot.id.raw(), Arc::as_ptr(&slot.handler));
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    #[inline]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Atomically take and clear this core's pending word
    fn drain(&self) -> u32 {
        let word = self.own_word();
        let mut current = 0;
        loop {
            match word.compare_exchange_weak(current, 0, Ordering::AcqRel, Ordering::Acquire) {
                Ok(taken) => return taken,
                Err(actual) => current = actual,
            }
        }
    }

    fn own_word(&self) -> &AtomicU32 {
        self.mem.atomic_u32(match self.core {
            CoreId::Main => MAIN_CORE_ST,
            CoreId::Sub => SUB_CORE_ST,
        })
    }

    fn peer_word(&self) -> &AtomicU32 {
        self.mem.atomic_u32(match self.core {
            CoreId::Main => SUB_CORE_ST,
            CoreId::Sub => MAIN_CORE_ST,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostPlatform;
    use std::sync::atomic::AtomicUsize;

    fn pair() -> (SwIntr, SwIntr) {
        let mem = Arc::new(SharedMem::anonymous(64).unwrap());
        let (pm, ps) = HostPlatform::pair();
        let main = SwIntr::new(mem.clone(), CoreId::Main, Arc::new(pm), 4).unwrap();
        let sub = SwIntr::new(mem, CoreId::Sub, Arc::new(ps), 4).unwrap();
        main.init().unwrap();
        sub.init().unwrap();
        (main, sub)
    }

    fn counter() -> (Arc<AtomicUsize>, IntrHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: IntrHandler = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            false
        });
        (count, handler)
    }

    #[test]
    fn test_repeated_trigger_coalesces() {
        let (main, sub) = pair();
        let (count, handler) = counter();
        sub.add_handler(SwIntrId::new(3).unwrap(), handler).unwrap();

        main.trigger(SwIntrId::new(3).unwrap());
        main.trigger(SwIntrId::new(3).unwrap());
        sub.handle_interrupt();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_lines_run_in_one_pass() {
        let (main, sub) = pair();
        let (a, ha) = counter();
        let (b, hb) = counter();
        sub.add_handler(SwIntrId::new(1).unwrap(), ha).unwrap();
        sub.add_handler(SwIntrId::new(2).unwrap(), hb).unwrap();

        main.trigger(SwIntrId::new(1).unwrap());
        main.trigger(SwIntrId::new(2).unwrap());
        sub.handle_interrupt();

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_lands_on_peer_only() {
        let (main, sub) = pair();
        let (count, handler) = counter();
        main.add_handler(SwIntrId::new(5).unwrap(), handler).unwrap();

        main.trigger(SwIntrId::new(5).unwrap());
        main.handle_interrupt();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sub.trigger(SwIntrId::new(5).unwrap());
        main.handle_interrupt();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_line_raised_during_dispatch_is_not_lost() {
        let mem = Arc::new(SharedMem::anonymous(64).unwrap());
        let (pm, ps) = HostPlatform::pair();
        let main = Arc::new(SwIntr::new(mem.clone(), CoreId::Main, Arc::new(pm), 4).unwrap());
        let sub = SwIntr::new(mem, CoreId::Sub, Arc::new(ps), 4).unwrap();

        let (second, h2) = counter();
        let peer = main.clone();
        let h1: IntrHandler = Arc::new(move || {
            // the peer fires line 7 while line 6 is being handled
            peer.trigger(SwIntrId::new(7).unwrap());
            false
        });
        sub.add_handler(SwIntrId::new(6).unwrap(), h1).unwrap();
        sub.add_handler(SwIntrId::new(7).unwrap(), h2).unwrap();

        main.trigger(SwIntrId::new(6).unwrap());
        sub.handle_interrupt();
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_handler_by_identity() {
        let (main, sub) = pair();
        let (a, ha) = counter();
        let (b, hb) = counter();
        let line = SwIntrId::new(4).unwrap();
        sub.add_handler(line, ha.clone()).unwrap();
        sub.add_handler(line, hb).unwrap();

        sub.delete_handler(line, &ha);
        main.trigger(line);
        sub.handle_interrupt();

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_full() {
        let (_main, sub) = pair();
        for _ in 0..4 {
            let (_, h) = counter();
            sub.add_handler(SwIntrId::new(0).unwrap(), h).unwrap();
        }
        let (_, h) = counter();
        assert!(matches!(
            sub.add_handler(SwIntrId::new(0).unwrap(), h),
            Err(AmpError::NoMem { .. })
        ));
    }

    #[test]
    fn test_yield_results_are_or_reduced() {
        let (main, sub) = pair();
        sub.add_handler(SwIntrId::new(8).unwrap(), Arc::new(|| false)).unwrap();
        sub.add_handler(SwIntrId::new(8).unwrap(), Arc::new(|| true)).unwrap();
        main.trigger(SwIntrId::new(8).unwrap());
        assert!(sub.handle_interrupt());
        assert!(!sub.handle_interrupt());
    }
}
