//! System service channel and the main-core supplicant
//!
//! A raw virtqueue under the reserved `SYSTEM` sys-info id carries small
//! service requests from the sub core to the main core. The sub core is the
//! master of this ring, the main core the remote. Each slot holds
//!
//! ```text
//! { srv_id: u16, param_len: u16, param: [u8] }
//! ```
//!
//! The shared entry is prefixed by one panic word that the sub core sets
//! before it raises the `PANIC` line.
//!
//! On the main core a supplicant thread sleeps until `SYS_SVC` or `PANIC`
//! fires, runs the panic hook once if the sub core went down, then drains and
//! dispatches pending requests by service id.

use crate::error::{AmpError, Result};
use crate::event::EventGroup;
use crate::platform::{item_len, ring_len, CoreId};
use crate::queue::{init_buffer, queue_shm_size, Notify, Role, Virtqueue, QUEUE_CONF_SIZE, QUEUE_DESC_SIZE};
use crate::shm::SharedMem;
use crate::sw_intr::{IntrHandler, SwIntr, SwIntrId};
use crate::sys_info::{SysInfo, SYS_INFO_ID_SYSTEM};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Route text printed on the sub core into the main core's log
pub const SERVICE_ID_PRINT: u16 = 0x0001;
/// Size of the request header preceding the parameters
pub const SERVICE_HEADER_SIZE: u16 = 4;
pub const SERVICE_QUEUE_LEN: u16 = 16;
pub const SERVICE_ITEM_SIZE: u16 = 128;

const SRV_ID_OFFSET: u32 = 0;
const PARAM_LEN_OFFSET: u32 = 2;
const UNSET_SRV_ID: u16 = 0xffff;

const PANIC_WORD_SIZE: u32 = 4;
const PANIC_RAISED: u32 = 1;

/// How long a remote print keeps retrying for a free slot
const PRINT_ALLOC_TIMEOUT_MS: u32 = 10;

const WAKE_REQUEST: u32 = 1 << 0;
const WAKE_STOP: u32 = 1 << 1;

/// Handler of one service id, run by the supplicant
pub type RequestHandler = Arc<dyn Fn(&ServiceRequest) + Send + Sync>;

/// Called once when the sub core reports a panic
pub type PanicHook = Arc<dyn Fn() + Send + Sync>;

/// One side of the system service channel
pub struct SystemService {
    mem: Arc<SharedMem>,
    core: CoreId,
    sw_intr: Arc<SwIntr>,
    queue: Arc<Mutex<Virtqueue>>,
    panic_word: u32,
    handlers: Mutex<Vec<(u16, RequestHandler)>>,
    panic_hook: Mutex<Option<PanicHook>>,
    panic_handled: AtomicBool,
    wake: Arc<EventGroup>,
    isr_handlers: Mutex<Vec<(SwIntrId, IntrHandler)>>,
}

impl SystemService {
    /// Lay out the service ring and register the supplicant wake-up lines (main core)
    pub fn main_init(
        sys_info: &SysInfo,
        sw_intr: Arc<SwIntr>,
        queue_len: u16,
        item_size: u16,
    ) -> Result<Arc<Self>> {
        let (queue_len, item_size) = match (ring_len(queue_len), item_len(item_size)) {
            (Some(len), Some(item)) if item > SERVICE_HEADER_SIZE => (len, item),
            _ => return Err(AmpError::InvalidArg("service queue length or item size out of range")),
        };

        let base = sys_info.alloc(
            SYS_INFO_ID_SYSTEM,
            PANIC_WORD_SIZE as usize + queue_shm_size(queue_len, item_size),
        )?;
        let conf = base + PANIC_WORD_SIZE;
        let desc = conf + QUEUE_CONF_SIZE as u32;
        let buffer = desc + (QUEUE_DESC_SIZE * queue_len as usize) as u32;

        let mem = sys_info.mem().clone();
        mem.atomic_u32(base).store(0, Ordering::Release);
        init_buffer(&mem, conf, queue_len, item_size, desc, buffer)?;
        let queue = Virtqueue::create(mem.clone(), conf, Role::remote())?;

        let svc = Arc::new(Self::new(mem, CoreId::Main, sw_intr, queue, base));
        svc.register_handler(SERVICE_ID_PRINT, Arc::new(print_handler))?;

        let weak: Weak<SystemService> = Arc::downgrade(&svc);
        let wake_up: IntrHandler = Arc::new(move || match weak.upgrade() {
            Some(svc) => {
                svc.wake.set_bits(WAKE_REQUEST);
                true
            }
            None => false,
        });
        svc.queue.lock().set_callback(wake_up.clone());
        svc.queue.lock().intr_enable(&svc.sw_intr, SwIntrId::SYS_SVC)?;
        svc.sw_intr.add_handler(SwIntrId::PANIC, wake_up.clone())?;
        svc.isr_handlers
            .lock()
            .extend([(SwIntrId::SYS_SVC, wake_up.clone()), (SwIntrId::PANIC, wake_up)]);

        debug!(target: "service", "main init: len={} item={}", queue_len, item_size);
        Ok(svc)
    }

    /// Attach to the service ring the main core published (sub core)
    pub fn sub_init(sys_info: &SysInfo, sw_intr: Arc<SwIntr>) -> Result<Arc<Self>> {
        let (base, _) = sys_info.get(SYS_INFO_ID_SYSTEM)?;
        let notify: Notify = {
            let sw_intr = sw_intr.clone();
            Arc::new(move || sw_intr.trigger(SwIntrId::SYS_SVC))
        };
        let mem = sys_info.mem().clone();
        let queue = Virtqueue::create(
            mem.clone(),
            base + PANIC_WORD_SIZE,
            Role::Master { notify: Some(notify) },
        )?;
        debug!(target: "service", "sub init");
        Ok(Arc::new(Self::new(mem, CoreId::Sub, sw_intr, queue, base)))
    }

    fn new(mem: Arc<SharedMem>, core: CoreId, sw_intr: Arc<SwIntr>, queue: Virtqueue, panic_word: u32) -> Self {
        Self {
            mem,
            core,
            sw_intr,
            queue: Arc::new(Mutex::new(queue)),
            panic_word,
            handlers: Mutex::new(Vec::new()),
            panic_hook: Mutex::new(None),
            panic_handled: AtomicBool::new(false),
            wake: Arc::new(EventGroup::new()),
            isr_handlers: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Largest parameter block one request can carry
    pub fn max_param_len(&self) -> u16 {
        self.queue.lock().max_item_size() - SERVICE_HEADER_SIZE
    }

    // ---- sub core ----

    /// Reserve a request slot (sub core)
    ///
    /// Fails with [`AmpError::NotFound`] while every slot is in flight.
    pub fn create_request(&self) -> Result<ServiceRequestBuf> {
        if self.core.is_main() {
            return Err(AmpError::NotSupported);
        }
        let mut queue = self.queue.lock();
        let item = queue.max_item_size();
        let offset = queue.alloc(item)?;
        drop(queue);

        self.mem
            .atomic_u16(offset + SRV_ID_OFFSET)
            .store(UNSET_SRV_ID, Ordering::Relaxed);
        self.mem.atomic_u16(offset + PARAM_LEN_OFFSET).store(0, Ordering::Relaxed);
        Ok(ServiceRequestBuf {
            queue: self.queue.clone(),
            mem: self.mem.clone(),
            offset,
            capacity: item - SERVICE_HEADER_SIZE,
            armed: true,
        })
    }

    /// Tag `buf` with service `id` and hand it to the main core (sub core)
    ///
    /// On error the slot still goes out, untagged, and the main core frees it.
    pub fn send_request(&self, id: u16, mut buf: ServiceRequestBuf, param_len: u16) -> Result<()> {
        if param_len > buf.capacity {
            return Err(AmpError::NoMem {
                max: buf.capacity as usize,
                got: param_len as usize,
            });
        }
        if id == UNSET_SRV_ID {
            return Err(AmpError::InvalidArg("service id is reserved"));
        }
        buf.armed = false;
        let offset = buf.offset;
        self.mem.atomic_u16(offset + SRV_ID_OFFSET).store(id, Ordering::Relaxed);
        self.mem
            .atomic_u16(offset + PARAM_LEN_OFFSET)
            .store(param_len, Ordering::Relaxed);

        self.queue
            .lock()
            .send(offset, param_len + SERVICE_HEADER_SIZE)
            .map_err(|e| {
                error!(target: "service", "send after successful alloc failed: {}", e);
                AmpError::Transport("service queue refused a reserved buffer")
            })
    }

    /// Format `args` and print it through the main core's log (sub core)
    ///
    /// Each line becomes one request; lines longer than a slot are split.
    /// A slot is awaited for a short while before the text is dropped with
    /// the allocation error.
    pub fn print_remote(&self, args: fmt::Arguments<'_>) -> Result<()> {
        let text = args.to_string();
        let max = self.max_param_len() as usize;
        for line in text.lines() {
            for chunk in chunks(line, max) {
                let mut buf = self.create_request_retry(PRINT_ALLOC_TIMEOUT_MS)?;
                buf.params_mut()[..chunk.len()].copy_from_slice(chunk.as_bytes());
                self.send_request(SERVICE_ID_PRINT, buf, chunk.len() as u16)?;
            }
        }
        Ok(())
    }

    /// Mark the sub core as panicked and wake the supplicant (sub core)
    pub fn report_panic(&self) {
        self.mem.atomic_u32(self.panic_word).store(PANIC_RAISED, Ordering::Release);
        self.sw_intr.trigger(SwIntrId::PANIC);
    }

    fn create_request_retry(&self, timeout_ms: u32) -> Result<ServiceRequestBuf> {
        let platform = self.sw_intr.platform();
        let start = platform.now_ms();
        loop {
            match self.create_request() {
                Err(AmpError::NotFound) if platform.now_ms().wrapping_sub(start) < timeout_ms => {
                    std::hint::spin_loop();
                }
                other => return other,
            }
        }
    }

    // ---- main core ----

    /// Take the next pending request (main core)
    ///
    /// Returns [`AmpError::NotFound`] when nothing is pending.
    pub fn recv_request(&self) -> Result<ServiceRequest> {
        if !self.core.is_main() {
            return Err(AmpError::NotSupported);
        }
        let (offset, _) = self.queue.lock().recv()?;
        let id = self.mem.atomic_u16(offset + SRV_ID_OFFSET).load(Ordering::Relaxed);
        let param_len = self.mem.atomic_u16(offset + PARAM_LEN_OFFSET).load(Ordering::Relaxed);
        Ok(ServiceRequest {
            queue: self.queue.clone(),
            mem: self.mem.clone(),
            offset,
            id,
            // never trust the peer beyond the slot
            len: param_len.min(self.max_param_len()),
            freed: false,
        })
    }

    /// Register the handler of service `id` (main core)
    pub fn register_handler(&self, id: u16, handler: RequestHandler) -> Result<()> {
        if id == UNSET_SRV_ID {
            return Err(AmpError::InvalidArg("service id is reserved"));
        }
        let mut handlers = self.handlers.lock();
        if handlers.iter().any(|(srv, _)| *srv == id) {
            return Err(AmpError::Exist);
        }
        handlers.push((id, handler));
        Ok(())
    }

    pub fn unregister_handler(&self, id: u16) -> Result<()> {
        let mut handlers = self.handlers.lock();
        let pos = handlers
            .iter()
            .position(|(srv, _)| *srv == id)
            .ok_or(AmpError::NotFound)?;
        handlers.remove(pos);
        Ok(())
    }

    /// Replace the hook run when the sub core panics
    pub fn set_panic_hook(&self, hook: PanicHook) {
        *self.panic_hook.lock() = Some(hook);
    }

    /// Whether the sub core has reported a panic
    pub fn subcore_panicked(&self) -> bool {
        self.mem.atomic_u32(self.panic_word).load(Ordering::Acquire) == PANIC_RAISED
    }

    /// One supplicant pass: panic check, then drain and dispatch requests
    ///
    /// Returns the number of requests handled.
    pub fn process(&self) -> usize {
        self.check_panic();
        let mut handled = 0;
        loop {
            let req = match self.recv_request() {
                Ok(req) => req,
                Err(AmpError::NotFound) => break,
                Err(e) => {
                    warn!(target: "service", "receive failed: {}", e);
                    break;
                }
            };

            if req.id() == UNSET_SRV_ID {
                // an unsent slot coming home
                drop(req);
                continue;
            }

            let handler = self
                .handlers
                .lock()
                .iter()
                .find(|(srv, _)| *srv == req.id())
                .map(|(_, h)| h.clone());
            match handler {
                Some(handler) => handler(&req),
                None => debug!(target: "service", "no handler for service {:#06x}", req.id()),
            }
            if let Err(e) = req.destroy() {
                warn!(target: "service", "failed to release request: {}", e);
            }
            handled += 1;

            // a panic may arrive while requests keep flowing
            self.check_panic();
        }
        handled
    }

    /// Run the supplicant on a named thread until [`stop`](Self::stop)
    pub fn spawn_supplicant(self: &Arc<Self>, name: &str) -> Result<JoinHandle<()>> {
        if !self.core.is_main() {
            return Err(AmpError::NotSupported);
        }
        self.wake.clear_bits(WAKE_STOP);
        let svc = self.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let bits = svc.wake.wait_bits(
                    WAKE_REQUEST | WAKE_STOP,
                    false,
                    false,
                    Some(Duration::from_millis(100)),
                );
                svc.wake.clear_bits(WAKE_REQUEST);
                if bits & WAKE_STOP != 0 {
                    break;
                }
                svc.process();
            })
            .map_err(AmpError::Spawn)
    }

    /// Ask a running supplicant to exit
    pub fn stop(&self) {
        self.wake.set_bits(WAKE_STOP);
    }

    /// Detach the wake-up handlers from the interrupt lines
    pub fn deinit(&self) {
        for (id, handler) in self.isr_handlers.lock().drain(..) {
            self.sw_intr.delete_handler(id, &handler);
        }
        self.stop();
    }

    fn check_panic(&self) {
        if !self.subcore_panicked() || self.panic_handled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hook = self.panic_hook.lock().clone();
        match hook {
            Some(hook) => hook(),
            None => error!(target: "service", "sub core panicked"),
        }
    }
}

/// Split `line` into pieces of at most `max` bytes on char boundaries
fn chunks(line: &str, max: usize) -> Vec<&str> {
    if line.is_empty() {
        return vec![line];
    }
    let mut out = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // a single char wider than a slot
            break;
        }
        out.push(&rest[..end]);
        rest = &rest[end..];
    }
    out
}

fn print_handler(req: &ServiceRequest) {
    let text = String::from_utf8_lossy(req.params());
    info!(target: "amp_print", "{}", text.trim_end_matches('\0'));
}

/// A reserved request slot being filled on the sub core
pub struct ServiceRequestBuf {
    queue: Arc<Mutex<Virtqueue>>,
    mem: Arc<SharedMem>,
    offset: u32,
    capacity: u16,
    armed: bool,
}

impl ServiceRequestBuf {
    pub fn params_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot was allocated to us and has not been sent yet
        unsafe {
            self.mem
                .bytes_mut(self.offset + SERVICE_HEADER_SIZE as u32, self.capacity as usize)
        }
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

impl Drop for ServiceRequestBuf {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // already tagged UNSET_SRV_ID by create_request
        self.mem.atomic_u16(self.offset + PARAM_LEN_OFFSET).store(0, Ordering::Relaxed);
        if let Err(e) = self.queue.lock().send(self.offset, SERVICE_HEADER_SIZE) {
            warn!(target: "service", "request slot {:#x} lost: {}", self.offset, e);
        }
    }
}

/// A received request; owns its slot until destroyed
pub struct ServiceRequest {
    queue: Arc<Mutex<Virtqueue>>,
    mem: Arc<SharedMem>,
    offset: u32,
    id: u16,
    len: u16,
    freed: bool,
}

impl ServiceRequest {
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn params(&self) -> &[u8] {
        // SAFETY: the sub core does not touch the slot until we free it
        unsafe {
            self.mem
                .bytes(self.offset + SERVICE_HEADER_SIZE as u32, self.len as usize)
        }
    }

    /// Return the slot to the sub core
    pub fn destroy(mut self) -> Result<()> {
        self.freed = true;
        self.queue.lock().free(self.offset)
    }
}

impl Drop for ServiceRequest {
    fn drop(&mut self) {
        if !self.freed {
            if let Err(e) = self.queue.lock().free(self.offset) {
                warn!(target: "service", "failed to free request slot {:#x}: {}", self.offset, e);
            }
        }
    }
}

impl fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}
