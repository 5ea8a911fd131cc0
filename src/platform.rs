//! Platform seam: cross-core interrupt line, clock and memory ordering
//!
//! The hardware driver for the cross-core interrupt and the millisecond clock
//! are external to the transport. They are consumed through [`Platform`];
//! barriers are the [`publish`] / [`acquire`] fence pair. [`HostPlatform`]
//! implements the trait for two cores simulated by threads of one process.

use crate::error::{AmpError, Result};
use crate::sw_intr::SwIntr;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Which side of the link this code runs on
///
/// The main core is privileged: it lays out the shared region and owns the
/// sys-info allocator. The sub core only discovers what the main core
/// published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreId {
    Main,
    Sub,
}

impl CoreId {
    /// The opposite core
    #[inline]
    pub fn peer(self) -> CoreId {
        match self {
            CoreId::Main => CoreId::Sub,
            CoreId::Sub => CoreId::Main,
        }
    }

    #[inline]
    pub fn is_main(self) -> bool {
        self == CoreId::Main
    }
}

/// Hardware services the transport needs from the board
pub trait Platform: Send + Sync {
    /// Install the cross-core interrupt handler
    fn install_sw_intr(&self) -> Result<()> {
        Ok(())
    }

    /// Unmask the cross-core interrupt on this core
    fn enable_sw_intr(&self) {}

    /// Mask the cross-core interrupt on this core
    fn disable_sw_intr(&self) {}

    /// Raise the physical interrupt on the peer core
    fn raise_sw_intr(&self);

    /// Monotonic millisecond clock
    fn now_ms(&self) -> u32;
}

/// Make every prior data write visible before the following flag write
#[inline(always)]
pub fn publish() {
    fence(Ordering::Release);
}

/// Order the preceding flag read before every following data access
#[inline(always)]
pub fn acquire() {
    fence(Ordering::Acquire);
}

/// Interrupt latch of one core
#[derive(Default)]
struct Doorbell {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        *self.pending.lock() = true;
        self.cv.notify_all();
    }
}

/// [`Platform`] for two cores simulated inside one process
///
/// Raising the interrupt on one half of a [`HostPlatform::pair`] latches it on
/// the other half; the thread playing the peer's ISR observes it with
/// [`take_irq`](HostPlatform::take_irq) or [`wait_irq`](HostPlatform::wait_irq).
pub struct HostPlatform {
    epoch: Instant,
    inbox: Arc<Doorbell>,
    outbox: Arc<Doorbell>,
    enabled: AtomicBool,
}

impl HostPlatform {
    /// Two platforms whose interrupt lines point at each other
    pub fn pair() -> (HostPlatform, HostPlatform) {
        let a = Arc::new(Doorbell::default());
        let b = Arc::new(Doorbell::default());
        let epoch = Instant::now();
        (
            HostPlatform {
                epoch,
                inbox: a.clone(),
                outbox: b.clone(),
                enabled: AtomicBool::new(false),
            },
            HostPlatform {
                epoch,
                inbox: b,
                outbox: a,
                enabled: AtomicBool::new(false),
            },
        )
    }

    /// A platform whose interrupt loops back to itself
    pub fn loopback() -> HostPlatform {
        let bell = Arc::new(Doorbell::default());
        HostPlatform {
            epoch: Instant::now(),
            inbox: bell.clone(),
            outbox: bell,
            enabled: AtomicBool::new(false),
        }
    }

    /// Consume a latched interrupt, if any and if the line is enabled
    pub fn take_irq(&self) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        std::mem::take(&mut *self.inbox.pending.lock())
    }

    /// Block until an interrupt is latched or `timeout` elapses
    pub fn wait_irq(&self, timeout: Duration) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        let mut pending = self.inbox.pending.lock();
        if !*pending {
            let _ = self.inbox.cv.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }

    /// Play this core's interrupt controller on a named thread
    ///
    /// Every latched interrupt runs `sw_intr`'s service routine. The thread
    /// stops when the returned handle is dropped.
    pub fn spawn_isr(self: &Arc<Self>, sw_intr: Arc<SwIntr>, name: &str) -> Result<IsrThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let platform = self.clone();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if platform.wait_irq(Duration::from_millis(10)) {
                        sw_intr.handle_interrupt();
                    }
                }
            })
            .map_err(AmpError::Spawn)?;
        Ok(IsrThread {
            stop,
            handle: Some(handle),
        })
    }
}

/// Running interrupt thread of a [`HostPlatform`]
pub struct IsrThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for IsrThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Platform for HostPlatform {
    fn enable_sw_intr(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn disable_sw_intr(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn raise_sw_intr(&self) {
        self.outbox.ring();
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// Round `size` up to a 4-byte word boundary
#[inline]
pub(crate) const fn align_word(size: usize) -> usize {
    (size + 3) & !3
}

/// Ceil a ring length to the next power of two; `None` for 0 or above 2^15
pub(crate) fn ring_len(len: u16) -> Option<u16> {
    if len == 0 || len > 1 << 15 {
        return None;
    }
    Some(len.next_power_of_two())
}

/// Align an item size to a word boundary; `None` for 0 or on overflow
pub(crate) fn item_len(size: u16) -> Option<u16> {
    if size == 0 {
        return None;
    }
    u16::try_from(align_word(size as usize)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_len_rounding() {
        assert_eq!(ring_len(0), None);
        assert_eq!(ring_len(1), Some(1));
        assert_eq!(ring_len(3), Some(4));
        assert_eq!(ring_len(16), Some(16));
        assert_eq!(ring_len(17), Some(32));
        assert_eq!(ring_len(1 << 15), Some(1 << 15));
        assert_eq!(ring_len((1 << 15) + 1), None);
    }

    #[test]
    fn test_item_len_alignment() {
        assert_eq!(item_len(0), None);
        assert_eq!(item_len(1), Some(4));
        assert_eq!(item_len(128), Some(128));
        assert_eq!(item_len(130), Some(132));
        assert_eq!(item_len(u16::MAX), None);
    }

    #[test]
    fn test_pair_routes_interrupt_to_peer() {
        let (main, sub) = HostPlatform::pair();
        main.enable_sw_intr();
        sub.enable_sw_intr();

        main.raise_sw_intr();
        assert!(!main.take_irq());
        assert!(sub.take_irq());
        assert!(!sub.take_irq());
    }

    #[test]
    fn test_disabled_line_keeps_latch() {
        let (main, sub) = HostPlatform::pair();
        main.raise_sw_intr();
        assert!(!sub.take_irq());
        sub.enable_sw_intr();
        assert!(sub.wait_irq(Duration::from_millis(10)));
    }

    #[test]
    fn test_isr_thread_runs_handlers() {
        use crate::shm::SharedMem;
        use crate::sw_intr::{IntrHandler, SwIntrId};
        use std::sync::atomic::AtomicUsize;

        let mem = Arc::new(SharedMem::anonymous(4096).unwrap());
        let (pm, ps) = HostPlatform::pair();
        let ps = Arc::new(ps);
        let main = SwIntr::new(mem.clone(), CoreId::Main, Arc::new(pm), 4).unwrap();
        let sub = Arc::new(SwIntr::new(mem, CoreId::Sub, ps.clone(), 4).unwrap());
        main.init().unwrap();
        sub.init().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler: IntrHandler = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });
        sub.add_handler(SwIntrId::EVENT, handler).unwrap();

        let isr = ps.spawn_isr(sub, "sub_isr").unwrap();
        main.trigger(SwIntrId::EVENT);
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        drop(isr);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
