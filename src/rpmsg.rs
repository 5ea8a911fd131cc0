//! RPMsg: endpoint-addressed messages over a virtqueue pair
//!
//! Each device owns a TX ring (this side is master) and an RX ring (this side
//! is remote). The two cores see the same pair mirrored: the main core's TX
//! ring is the sub core's RX ring. A message occupies one ring slot:
//!
//! ```text
//! { src_addr: u16, dst_addr: u16, data_len: u16, data_flags: u16, data: [u8] }
//! ```
//!
//! Received messages are handed to the endpoint bound to `dst_addr` as an
//! owned [`RpmsgMessage`]; the slot returns to the peer when the message is
//! destroyed or dropped.
//!
//! A TX slot dropped without being sent goes out as an empty frame addressed
//! to [`EPT_DISCARD`], which the receiver frees without dispatch.

use crate::error::{AmpError, Result};
use crate::platform::{item_len, ring_len};
use crate::queue::{init_buffer, queue_shm_size, Notify, Role, Virtqueue, QUEUE_CONF_SIZE, QUEUE_DESC_SIZE};
use crate::shm::SharedMem;
use crate::sw_intr::{IntrHandler, SwIntr, SwIntrId};
use crate::sys_info::{SysInfo, SYS_INFO_ID_VQUEUE};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Size of the message header preceding the payload
pub const RPMSG_HEADER_SIZE: u16 = 8;
/// Endpoint address reserved for remote printing
pub const EPT_SYS_PRINT: u16 = 0xffff;
/// Reserved address of frames that only return a TX slot
pub const EPT_DISCARD: u16 = 0xfffe;
/// Default `data_flags` value
pub const DATA_DEFAULT: u16 = 0;

const SRC_OFFSET: u32 = 0;
const DST_OFFSET: u32 = 2;
const LEN_OFFSET: u32 = 4;
const FLAGS_OFFSET: u32 = 6;

/// Where an endpoint handler is being invoked from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// Inside the RPMsg interrupt handler; must not block
    Isr,
    /// From [`RpmsgDevice::poll`] in a schedulable task
    Task,
}

/// Endpoint receive handler; takes ownership of the message
pub type EndpointHandler = Arc<dyn Fn(RpmsgMessage, ExecContext) + Send + Sync>;

/// Ring geometry and notification mode of a device
#[derive(Debug, Clone)]
pub struct RpmsgConfig {
    /// Slots per ring, rounded up to a power of two
    pub queue_len: u16,
    /// Bytes per slot including the header, rounded up to a word
    pub item_size: u16,
    /// Interrupt the peer after every send
    pub notify: bool,
    /// Receive by calling [`RpmsgDevice::poll`] instead of from the interrupt
    pub poll: bool,
    /// Sys-info id of the ring pair
    pub sysinfo_id: u16,
}

impl Default for RpmsgConfig {
    fn default() -> Self {
        Self {
            queue_len: 16,
            item_size: 128,
            notify: true,
            poll: false,
            sysinfo_id: SYS_INFO_ID_VQUEUE,
        }
    }
}

struct Endpoint {
    addr: u16,
    handler: Option<EndpointHandler>,
}

/// One side of an RPMsg link
pub struct RpmsgDevice {
    mem: Arc<SharedMem>,
    sw_intr: Arc<SwIntr>,
    tx: Arc<Mutex<Virtqueue>>,
    rx: Arc<Mutex<Virtqueue>>,
    // newest endpoint last; lookups scan from the back
    endpoints: Mutex<Vec<Endpoint>>,
}

impl RpmsgDevice {
    /// Lay out the ring pair under `config.sysinfo_id` and attach (main core)
    pub fn main_init(sys_info: &SysInfo, sw_intr: Arc<SwIntr>, config: &RpmsgConfig) -> Result<Arc<Self>> {
        let (queue_len, item_size) = match (ring_len(config.queue_len), item_len(config.item_size)) {
            (Some(len), Some(item)) => (len, item),
            _ => return Err(AmpError::InvalidArg("rpmsg queue length or item size out of range")),
        };

        let base = sys_info.alloc(config.sysinfo_id, 2 * queue_shm_size(queue_len, item_size))?;
        let desc_len = (QUEUE_DESC_SIZE * queue_len as usize) as u32;
        let data_len = item_size as u32 * queue_len as u32;

        let tx_conf = base;
        let rx_conf = tx_conf + QUEUE_CONF_SIZE as u32;
        let tx_desc = rx_conf + QUEUE_CONF_SIZE as u32;
        let rx_desc = tx_desc + desc_len;
        let tx_data = rx_desc + desc_len;
        let rx_data = tx_data + data_len;

        let mem = sys_info.mem();
        init_buffer(mem, tx_conf, queue_len, item_size, tx_desc, tx_data)?;
        init_buffer(mem, rx_conf, queue_len, item_size, rx_desc, rx_data)?;

        debug!(
            target: "rpmsg",
            "main init: id={:#06x} len={} item={}",
            config.sysinfo_id, queue_len, item_size
        );
        Self::attach(mem.clone(), sw_intr, tx_conf, rx_conf, config)
    }

    /// Attach to the ring pair the main core published (sub core)
    pub fn sub_init(sys_info: &SysInfo, sw_intr: Arc<SwIntr>, config: &RpmsgConfig) -> Result<Arc<Self>> {
        let (base, _) = sys_info.get(config.sysinfo_id)?;
        // mirrored: the main core's TX config is our RX config
        let rx_conf = base;
        let tx_conf = base + QUEUE_CONF_SIZE as u32;
        debug!(target: "rpmsg", "sub init: id={:#06x}", config.sysinfo_id);
        Self::attach(sys_info.mem().clone(), sw_intr, tx_conf, rx_conf, config)
    }

    fn attach(
        mem: Arc<SharedMem>,
        sw_intr: Arc<SwIntr>,
        tx_conf: u32,
        rx_conf: u32,
        config: &RpmsgConfig,
    ) -> Result<Arc<Self>> {
        let notify: Option<Notify> = config.notify.then(|| {
            let sw_intr = sw_intr.clone();
            Arc::new(move || sw_intr.trigger(SwIntrId::RPMSG)) as Notify
        });
        let tx = Virtqueue::create(mem.clone(), tx_conf, Role::Master { notify })?;
        let rx = Virtqueue::create(mem.clone(), rx_conf, Role::remote())?;

        let dev = Arc::new(RpmsgDevice {
            mem,
            sw_intr,
            tx: Arc::new(Mutex::new(tx)),
            rx: Arc::new(Mutex::new(rx)),
            endpoints: Mutex::new(Vec::new()),
        });

        if !config.poll {
            let weak: Weak<RpmsgDevice> = Arc::downgrade(&dev);
            let drain: IntrHandler = Arc::new(move || {
                if let Some(dev) = weak.upgrade() {
                    dev.drain(ExecContext::Isr);
                }
                false
            });
            dev.rx.lock().set_callback(drain);
        }
        Ok(dev)
    }

    /// Register the receive drain on the RPMsg interrupt line
    ///
    /// Fails with [`AmpError::InvalidArg`] if the device was set up for polling.
    pub fn intr_enable(&self) -> Result<()> {
        self.rx.lock().intr_enable(&self.sw_intr, SwIntrId::RPMSG)
    }

    /// Reserve a TX slot for an `nbytes` payload
    ///
    /// Fails with [`AmpError::NotFound`] while every slot is in flight. A
    /// message dropped unsent is not lost: its slot travels to the peer as a
    /// discard frame and comes back once the peer drains it.
    pub fn create_message(&self, nbytes: usize, flags: u16) -> Result<TxMessage> {
        let size = nbytes
            .checked_add(RPMSG_HEADER_SIZE as usize)
            .filter(|size| *size < 1 << 16)
            .ok_or(AmpError::NoMem {
                max: u16::MAX as usize - RPMSG_HEADER_SIZE as usize,
                got: nbytes,
            })?;

        let offset = self.tx.lock().alloc(size as u16)?;
        self.mem.atomic_u16(offset + FLAGS_OFFSET).store(flags, Ordering::Relaxed);
        self.mem
            .atomic_u16(offset + LEN_OFFSET)
            .store(nbytes as u16, Ordering::Relaxed);

        Ok(TxMessage {
            tx: self.tx.clone(),
            mem: self.mem.clone(),
            offset,
            capacity: nbytes as u16,
            armed: true,
        })
    }

    /// Fill the header of `msg` and hand it to the peer
    ///
    /// `src` must be an endpoint bound on this device. On a length or source
    /// error the slot is returned as a discard frame. The slot was reserved
    /// by [`create_message`](Self::create_message), so a ring error here
    /// means the transport itself is broken.
    pub fn send_nocopy(&self, src: u16, dst: u16, mut msg: TxMessage, len: u16) -> Result<()> {
        if len > msg.capacity {
            return Err(AmpError::NoMem {
                max: msg.capacity as usize,
                got: len as usize,
            });
        }
        if !self.search_endpoint(src) {
            return Err(AmpError::InvalidArg("source address is not a local endpoint"));
        }
        let offset = msg.offset;
        msg.armed = false;

        let relaxed = Ordering::Relaxed;
        self.mem.atomic_u16(offset + LEN_OFFSET).store(len, relaxed);
        self.mem.atomic_u16(offset + DST_OFFSET).store(dst, relaxed);
        self.mem.atomic_u16(offset + SRC_OFFSET).store(src, relaxed);

        let mut tx = self.tx.lock();
        let max = tx.max_item_size();
        tx.send(offset, max).map_err(|e| {
            warn!(target: "rpmsg", "send after successful alloc failed: {}", e);
            AmpError::Transport("virtqueue refused a reserved buffer")
        })?;
        trace!(target: "rpmsg", "send {} bytes {:#x} -> {:#x}", len, src, dst);
        Ok(())
    }

    /// Copy `data` into a fresh message and send it
    ///
    /// Has no side effect when no slot is free, so it is safe to retry.
    pub fn send(&self, src: u16, dst: u16, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(AmpError::InvalidArg("empty rpmsg payload"));
        }
        if !self.search_endpoint(src) {
            return Err(AmpError::InvalidArg("source address is not a local endpoint"));
        }
        let mut msg = self.create_message(data.len(), DATA_DEFAULT)?;
        msg.data_mut().copy_from_slice(data);
        self.send_nocopy(src, dst, msg, data.len() as u16)
    }

    /// Return a received message to the peer
    pub fn destroy(&self, msg: RpmsgMessage) -> Result<()> {
        msg.destroy()
    }

    /// Receive one message and dispatch it to its endpoint
    ///
    /// Returns [`AmpError::NotFound`] when the RX ring is empty. A message
    /// without a matching endpoint (or whose endpoint has no handler) is
    /// dropped and its slot returned.
    pub fn poll(&self) -> Result<()> {
        self.poll_in(ExecContext::Task)
    }

    fn poll_in(&self, ctx: ExecContext) -> Result<()> {
        let (offset, size) = self.rx.lock().recv()?;
        let msg = self.message_at(offset, size);
        if msg.dst == EPT_DISCARD {
            trace!(target: "rpmsg", "discard frame at {:#x}", offset);
            return Ok(());
        }

        let handler = {
            let endpoints = self.endpoints.lock();
            match endpoints.iter().rev().find(|e| e.addr == msg.dst) {
                Some(ept) => ept.handler.clone(),
                None => {
                    debug!(target: "rpmsg", "no endpoint {:#x}, dropping message from {:#x}", msg.dst, msg.src);
                    None
                }
            }
        };

        if let Some(handler) = handler {
            handler(msg, ctx);
        }
        Ok(())
    }

    fn drain(&self, ctx: ExecContext) {
        while self.poll_in(ctx).is_ok() {}
    }

    fn message_at(&self, offset: u32, size: u16) -> RpmsgMessage {
        let relaxed = Ordering::Relaxed;
        let src = self.mem.atomic_u16(offset + SRC_OFFSET).load(relaxed);
        let dst = self.mem.atomic_u16(offset + DST_OFFSET).load(relaxed);
        let data_len = self.mem.atomic_u16(offset + LEN_OFFSET).load(relaxed);
        let flags = self.mem.atomic_u16(offset + FLAGS_OFFSET).load(relaxed);
        let room = size.saturating_sub(RPMSG_HEADER_SIZE);

        RpmsgMessage {
            rx: self.rx.clone(),
            mem: self.mem.clone(),
            offset,
            src,
            dst,
            flags,
            len: data_len.min(room),
            freed: false,
        }
    }

    /// Bind `addr` to `handler`; fails with [`AmpError::Exist`] if the address is taken
    pub fn create_endpoint(&self, addr: u16, handler: Option<EndpointHandler>) -> Result<()> {
        if addr == EPT_DISCARD {
            return Err(AmpError::InvalidArg("endpoint address is reserved"));
        }
        let mut endpoints = self.endpoints.lock();
        if endpoints.iter().any(|e| e.addr == addr) {
            return Err(AmpError::Exist);
        }
        endpoints.push(Endpoint { addr, handler });
        debug!(target: "rpmsg", "create endpoint {:#x}", addr);
        Ok(())
    }

    /// Remove the endpoint at `addr`, returning its handler
    pub fn delete_endpoint(&self, addr: u16) -> Result<Option<EndpointHandler>> {
        let mut endpoints = self.endpoints.lock();
        let idx = endpoints
            .iter()
            .position(|e| e.addr == addr)
            .ok_or(AmpError::NotFound)?;
        debug!(target: "rpmsg", "delete endpoint {:#x}", addr);
        Ok(endpoints.remove(idx).handler)
    }

    /// Replace the handler of an existing endpoint
    pub fn rebind_endpoint(&self, addr: u16, handler: Option<EndpointHandler>) -> Result<()> {
        let mut endpoints = self.endpoints.lock();
        let ept = endpoints
            .iter_mut()
            .rev()
            .find(|e| e.addr == addr)
            .ok_or(AmpError::NotFound)?;
        ept.handler = handler;
        Ok(())
    }

    /// Whether an endpoint is bound at `addr`
    pub fn search_endpoint(&self, addr: u16) -> bool {
        self.endpoints.lock().iter().any(|e| e.addr == addr)
    }

    /// Largest payload one message can carry
    pub fn max_payload_size(&self) -> u16 {
        self.tx.lock().max_item_size() - RPMSG_HEADER_SIZE
    }
}

impl fmt::Debug for RpmsgDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<u16> = self.endpoints.lock().iter().map(|e| e.addr).collect();
        f.debug_struct("RpmsgDevice")
            .field("endpoints", &addrs)
            .field("max_payload", &self.max_payload_size())
            .finish()
    }
}

/// A reserved TX slot being filled
pub struct TxMessage {
    tx: Arc<Mutex<Virtqueue>>,
    mem: Arc<SharedMem>,
    offset: u32,
    capacity: u16,
    armed: bool,
}

impl TxMessage {
    /// Payload area, as large as requested from `create_message`
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot was allocated to us and has not been sent yet
        unsafe {
            self.mem
                .bytes_mut(self.offset + RPMSG_HEADER_SIZE as u32, self.capacity as usize)
        }
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

impl Drop for TxMessage {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let relaxed = Ordering::Relaxed;
        self.mem.atomic_u16(self.offset + SRC_OFFSET).store(EPT_DISCARD, relaxed);
        self.mem.atomic_u16(self.offset + DST_OFFSET).store(EPT_DISCARD, relaxed);
        self.mem.atomic_u16(self.offset + LEN_OFFSET).store(0, relaxed);

        let mut tx = self.tx.lock();
        let max = tx.max_item_size();
        match tx.send(self.offset, max) {
            Ok(()) => debug!(target: "rpmsg", "unsent tx slot {:#x} returned as discard", self.offset),
            Err(e) => warn!(target: "rpmsg", "tx slot {:#x} lost: {}", self.offset, e),
        }
    }
}

/// A received message; owns its RX slot until destroyed
pub struct RpmsgMessage {
    rx: Arc<Mutex<Virtqueue>>,
    mem: Arc<SharedMem>,
    offset: u32,
    src: u16,
    dst: u16,
    flags: u16,
    len: u16,
    freed: bool,
}

impl RpmsgMessage {
    pub fn data(&self) -> &[u8] {
        // SAFETY: the peer does not touch the slot until we free it
        unsafe {
            self.mem
                .bytes(self.offset + RPMSG_HEADER_SIZE as u32, self.len as usize)
        }
    }

    #[inline]
    pub fn src(&self) -> u16 {
        self.src
    }

    #[inline]
    pub fn dst(&self) -> u16 {
        self.dst
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the slot to the peer
    pub fn destroy(mut self) -> Result<()> {
        self.freed = true;
        self.rx.lock().free(self.offset)
    }
}

impl Drop for RpmsgMessage {
    fn drop(&mut self) {
        if !self.freed {
            if let Err(e) = self.rx.lock().free(self.offset) {
                warn!(target: "rpmsg", "failed to free rx slot {:#x}: {}", self.offset, e);
            }
        }
    }
}

impl fmt::Debug for RpmsgMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpmsgMessage")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{CoreId, HostPlatform};
    use std::sync::mpsc;

    struct Link {
        main: Arc<RpmsgDevice>,
        sub: Arc<RpmsgDevice>,
        main_intr: Arc<SwIntr>,
    }

    fn link(config: RpmsgConfig) -> Link {
        let mem = Arc::new(SharedMem::anonymous(64 * 1024).unwrap());
        let (pm, ps) = HostPlatform::pair();
        let main_info = SysInfo::new(mem.clone(), CoreId::Main).unwrap();
        let sub_info = SysInfo::new(mem.clone(), CoreId::Sub).unwrap();
        main_info.init();
        let main_intr = Arc::new(SwIntr::new(mem.clone(), CoreId::Main, Arc::new(pm), 8).unwrap());
        let sub_intr = Arc::new(SwIntr::new(mem, CoreId::Sub, Arc::new(ps), 8).unwrap());
        main_intr.init().unwrap();
        sub_intr.init().unwrap();

        let main = RpmsgDevice::main_init(&main_info, main_intr.clone(), &config).unwrap();
        let sub = RpmsgDevice::sub_init(&sub_info, sub_intr, &config).unwrap();
        Link { main, sub, main_intr }
    }

    fn polled(queue_len: u16) -> RpmsgConfig {
        RpmsgConfig {
            queue_len,
            item_size: 64,
            poll: true,
            ..Default::default()
        }
    }

    fn collector() -> (EndpointHandler, mpsc::Receiver<(Vec<u8>, u16, ExecContext)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: EndpointHandler = Arc::new(move |msg: RpmsgMessage, ctx: ExecContext| {
            tx.lock().send((msg.data().to_vec(), msg.src(), ctx)).unwrap();
            msg.destroy().unwrap();
        });
        (handler, rx)
    }

    #[test]
    fn test_round_trip_and_slot_reuse() {
        let l = link(polled(1));
        let (handler, got) = collector();
        l.main.create_endpoint(0x10, Some(handler)).unwrap();
        l.sub.create_endpoint(0x20, None).unwrap();

        let mut msg = l.sub.create_message(5, DATA_DEFAULT).unwrap();
        msg.data_mut().copy_from_slice(b"hello");
        l.sub.send_nocopy(0x20, 0x10, msg, 5).unwrap();

        // the only slot is in flight
        assert!(matches!(l.sub.create_message(1, DATA_DEFAULT), Err(AmpError::NotFound)));

        l.main.poll().unwrap();
        let (data, src, ctx) = got.try_recv().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(src, 0x20);
        assert_eq!(ctx, ExecContext::Task);
        assert!(matches!(l.main.poll(), Err(AmpError::NotFound)));

        // destroyed once, allocatable once
        let _again = l.sub.create_message(1, DATA_DEFAULT).unwrap();
        assert!(matches!(l.sub.create_message(1, DATA_DEFAULT), Err(AmpError::NotFound)));
    }

    #[test]
    fn test_both_directions() {
        let l = link(polled(4));
        let (h_main, got_main) = collector();
        let (h_sub, got_sub) = collector();
        l.main.create_endpoint(1, Some(h_main)).unwrap();
        l.sub.create_endpoint(2, Some(h_sub)).unwrap();

        l.main.send(1, 2, b"ping").unwrap();
        l.sub.poll().unwrap();
        assert_eq!(got_sub.try_recv().unwrap().0, b"ping");

        l.sub.send(2, 1, b"pong").unwrap();
        l.main.poll().unwrap();
        assert_eq!(got_main.try_recv().unwrap().0, b"pong");
    }

    #[test]
    fn test_duplicate_endpoint_keeps_first() {
        let l = link(polled(4));
        let (first, got_first) = collector();
        let (second, got_second) = collector();
        l.main.create_endpoint(7, Some(first)).unwrap();
        assert!(matches!(l.main.create_endpoint(7, Some(second)), Err(AmpError::Exist)));
        assert!(l.main.search_endpoint(7));

        l.sub.create_endpoint(9, None).unwrap();
        l.sub.send(9, 7, b"x").unwrap();
        l.main.poll().unwrap();
        assert!(got_first.try_recv().is_ok());
        assert!(got_second.try_recv().is_err());
    }

    #[test]
    fn test_unmatched_message_is_dropped_and_slot_returned() {
        let l = link(polled(1));
        l.sub.create_endpoint(1, None).unwrap();
        l.sub.send(1, 0x55, b"lost").unwrap();
        l.main.poll().unwrap();
        l.sub.send(1, 0x55, b"again").unwrap();
    }

    #[test]
    fn test_endpoint_without_handler() {
        let l = link(polled(1));
        l.main.create_endpoint(3, None).unwrap();
        l.sub.create_endpoint(1, None).unwrap();
        l.sub.send(1, 3, b"quiet").unwrap();
        l.main.poll().unwrap();
        l.sub.send(1, 3, b"quiet").unwrap();
    }

    #[test]
    fn test_rebind_and_delete() {
        let l = link(polled(4));
        let (first, got_first) = collector();
        let (second, got_second) = collector();
        l.main.create_endpoint(4, Some(first)).unwrap();
        l.main.rebind_endpoint(4, Some(second)).unwrap();
        l.sub.create_endpoint(1, None).unwrap();

        l.sub.send(1, 4, b"a").unwrap();
        l.main.poll().unwrap();
        assert!(got_first.try_recv().is_err());
        assert!(got_second.try_recv().is_ok());

        assert!(l.main.delete_endpoint(4).unwrap().is_some());
        assert!(!l.main.search_endpoint(4));
        assert!(matches!(l.main.delete_endpoint(4), Err(AmpError::NotFound)));
        assert!(matches!(l.main.rebind_endpoint(4, None), Err(AmpError::NotFound)));
    }

    #[test]
    fn test_message_size_limits() {
        let l = link(polled(4));
        assert_eq!(l.main.max_payload_size(), 56);
        assert!(l.main.create_message(56, DATA_DEFAULT).is_ok());
        assert!(matches!(
            l.main.create_message(57, DATA_DEFAULT),
            Err(AmpError::NoMem { .. })
        ));
        assert!(matches!(
            l.main.create_message(65536 - 8, DATA_DEFAULT),
            Err(AmpError::NoMem { .. })
        ));
        assert!(matches!(
            l.main.create_message(usize::MAX, DATA_DEFAULT),
            Err(AmpError::NoMem { .. })
        ));
        assert!(matches!(l.main.send(1, 2, &[]), Err(AmpError::InvalidArg(_))));
    }

    #[test]
    fn test_interrupt_driven_dispatch() {
        let config = RpmsgConfig {
            queue_len: 4,
            item_size: 64,
            ..Default::default()
        };
        let l = link(config);
        l.main.intr_enable().unwrap();
        let (handler, got) = collector();
        l.main.create_endpoint(0x30, Some(handler)).unwrap();
        l.sub.create_endpoint(0x31, None).unwrap();

        l.sub.send(0x31, 0x30, b"one").unwrap();
        l.sub.send(0x31, 0x30, b"two").unwrap();
        l.main_intr.handle_interrupt();

        let (a, _, ctx) = got.try_recv().unwrap();
        let (b, _, _) = got.try_recv().unwrap();
        assert_eq!((a.as_slice(), b.as_slice()), (&b"one"[..], &b"two"[..]));
        assert_eq!(ctx, ExecContext::Isr);
    }

    #[test]
    fn test_rejected_send_returns_slot() {
        let l = link(polled(4));
        let (handler, got) = collector();
        l.main.create_endpoint(0x10, Some(handler)).unwrap();
        l.sub.create_endpoint(0x20, None).unwrap();

        // more rejections than the ring has slots
        for _ in 0..8 {
            let msg = l.sub.create_message(4, DATA_DEFAULT).unwrap();
            assert!(matches!(
                l.sub.send_nocopy(0x20, 0x10, msg, 8),
                Err(AmpError::NoMem { max: 4, got: 8 })
            ));
            let msg = l.sub.create_message(4, DATA_DEFAULT).unwrap();
            assert!(matches!(
                l.sub.send_nocopy(0x21, 0x10, msg, 4),
                Err(AmpError::InvalidArg(_))
            ));
            l.main.poll().unwrap();
            l.main.poll().unwrap();
        }
        // discard frames never reach an endpoint
        assert!(got.try_recv().is_err());
        assert!(matches!(l.main.poll(), Err(AmpError::NotFound)));

        l.sub.send(0x20, 0x10, b"still here").unwrap();
        l.main.poll().unwrap();
        assert_eq!(got.try_recv().unwrap().0, b"still here");
    }

    #[test]
    fn test_dropped_message_returns_slot() {
        let l = link(polled(1));
        l.sub.create_endpoint(1, None).unwrap();
        drop(l.sub.create_message(8, DATA_DEFAULT).unwrap());
        // the slot is with the peer until it drains
        assert!(matches!(l.sub.create_message(8, DATA_DEFAULT), Err(AmpError::NotFound)));
        l.main.poll().unwrap();
        l.sub.send(1, 0x55, b"next").unwrap();
    }

    #[test]
    fn test_source_must_be_local_endpoint() {
        let l = link(polled(4));
        assert!(matches!(l.sub.send(1, 2, b"x"), Err(AmpError::InvalidArg(_))));
        // unsent, so nothing is in flight
        assert!(matches!(l.main.poll(), Err(AmpError::NotFound)));
        assert!(matches!(
            l.main.create_endpoint(EPT_DISCARD, None),
            Err(AmpError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_polled_device_has_no_interrupt_drain() {
        let l = link(polled(4));
        assert!(matches!(l.main.intr_enable(), Err(AmpError::InvalidArg(_))));
    }

    #[test]
    fn test_sub_init_without_main() {
        let mem = Arc::new(SharedMem::anonymous(4096).unwrap());
        let info = SysInfo::new(mem.clone(), CoreId::Sub).unwrap();
        let intr = Arc::new(SwIntr::new(mem, CoreId::Sub, Arc::new(HostPlatform::loopback()), 4).unwrap());
        assert!(matches!(
            RpmsgDevice::sub_init(&info, intr, &RpmsgConfig::default()),
            Err(AmpError::NotFound)
        ));
    }
}
