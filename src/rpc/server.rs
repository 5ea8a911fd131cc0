use super::packet::{PacketHeader, RPC_HEADER_SIZE};
use super::{STATUS_INVALID_CMD, STATUS_OK};
use crate::error::{AmpError, Result};
use crate::rpmsg::{EndpointHandler, ExecContext, RpmsgDevice, RpmsgMessage, DATA_DEFAULT};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Queue depth used when `Dispatch::Queued { depth: 0 }` is requested
const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Where requests are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Inside the endpoint handler, as soon as the request arrives
    Inline,
    /// Handed to [`RpcServer::run`] through a bounded queue; a full queue drops the request
    Queued { depth: usize },
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Endpoint address the server listens on
    pub server_id: u16,
    pub dispatch: Dispatch,
    /// Capacity of the service table
    pub max_services: usize,
    /// Request bytes passed to a handler; longer requests are truncated
    pub req_buf_len: u16,
    /// Response bytes a handler may write
    pub resp_buf_len: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            dispatch: Dispatch::Queued {
                depth: DEFAULT_QUEUE_DEPTH,
            },
            max_services: 8,
            req_buf_len: 64,
            resp_buf_len: 64,
        }
    }
}

/// One request as seen by a service handler
///
/// A response goes back only if the handler sets a non-zero response length.
pub struct ServiceCall<'a> {
    cmd_id: u16,
    req: &'a [u8],
    resp: &'a mut [u8],
    resp_len: u16,
    status: u16,
}

impl<'a> ServiceCall<'a> {
    pub fn cmd_id(&self) -> u16 {
        self.cmd_id
    }

    pub fn request(&self) -> &[u8] {
        self.req
    }

    /// Response buffer, `resp_buf_len` bytes
    pub fn response_mut(&mut self) -> &mut [u8] {
        self.resp
    }

    /// Set how many bytes of the response buffer to send (clamped to its size)
    pub fn set_response_len(&mut self, len: usize) {
        self.resp_len = len.min(self.resp.len()) as u16;
    }

    /// Copy `data` into the response buffer and send that much
    pub fn respond(&mut self, data: &[u8]) {
        let n = data.len().min(self.resp.len());
        self.resp[..n].copy_from_slice(&data[..n]);
        self.resp_len = n as u16;
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }
}

/// Command handler bound to one command id
pub type ServiceHandler = Arc<dyn Fn(&mut ServiceCall<'_>) + Send + Sync>;

struct Digest {
    client_addr: u16,
    msg: RpmsgMessage,
}

struct Scratch {
    req: Vec<u8>,
    resp: Vec<u8>,
}

struct ServerInner {
    dev: Arc<RpmsgDevice>,
    server_id: u16,
    dispatch: Dispatch,
    running: AtomicBool,
    services: Mutex<Vec<Option<(u16, ServiceHandler)>>>,
    scratch: Mutex<Scratch>,
    queue_tx: Mutex<Option<SyncSender<Digest>>>,
    queue_rx: Mutex<Option<Receiver<Digest>>>,
}

/// Server side of an RPC link
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Bind the server endpoint on `dev`
    pub fn init(dev: Arc<RpmsgDevice>, config: RpcServerConfig) -> Result<Self> {
        if config.req_buf_len == 0 || config.resp_buf_len == 0 {
            return Err(AmpError::InvalidArg("rpc server buffers must be non-empty"));
        }
        if config.max_services == 0 {
            return Err(AmpError::InvalidArg("rpc server needs at least one service slot"));
        }

        let (queue_tx, queue_rx) = match config.dispatch {
            Dispatch::Inline => (None, None),
            Dispatch::Queued { depth } => {
                let depth = if depth == 0 { DEFAULT_QUEUE_DEPTH } else { depth };
                let (tx, rx) = sync_channel(depth);
                (Some(tx), Some(rx))
            }
        };

        let mut services = Vec::with_capacity(config.max_services);
        services.resize_with(config.max_services, || None);

        let inner = Arc::new(ServerInner {
            dev,
            server_id: config.server_id,
            dispatch: config.dispatch,
            running: AtomicBool::new(true),
            services: Mutex::new(services),
            scratch: Mutex::new(Scratch {
                req: vec![0; config.req_buf_len as usize],
                resp: vec![0; config.resp_buf_len as usize],
            }),
            queue_tx: Mutex::new(queue_tx),
            queue_rx: Mutex::new(queue_rx),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        let handler: EndpointHandler = Arc::new(move |msg: RpmsgMessage, ctx: ExecContext| {
            if let Some(inner) = weak.upgrade() {
                inner.on_request(msg, ctx);
            }
        });
        inner.dev.create_endpoint(config.server_id, Some(handler))?;
        debug!(target: "rpc", "server {:#x} up ({:?})", config.server_id, config.dispatch);

        Ok(Self { inner })
    }

    /// Unbind the endpoint and drop queued requests
    pub fn deinit(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.dev.delete_endpoint(self.inner.server_id);
        self.inner.queue_tx.lock().take();
        if let Some(rx) = self.inner.queue_rx.lock().as_ref() {
            // queued messages return their slots as they drop
            while rx.try_recv().is_ok() {}
        }
    }

    /// Register `handler` for `cmd_id`
    ///
    /// Fails with [`AmpError::Exist`] if the id is taken, even when free slots
    /// remain, and with [`AmpError::NoMem`] when the table is full.
    pub fn add_service(&self, cmd_id: u16, handler: ServiceHandler) -> Result<()> {
        let mut services = self.inner.services.lock();
        let mut empty = None;
        let mut exists = false;
        for (idx, slot) in services.iter().enumerate() {
            match slot {
                None => {
                    empty.get_or_insert(idx);
                }
                Some((id, _)) if *id == cmd_id => exists = true,
                Some(_) => {}
            }
        }

        if exists {
            return Err(AmpError::Exist);
        }
        let len = services.len();
        let idx = empty.ok_or(AmpError::NoMem {
            max: len,
            got: len + 1,
        })?;
        services[idx] = Some((cmd_id, handler));
        Ok(())
    }

    pub fn del_service(&self, cmd_id: u16) -> Result<()> {
        let mut services = self.inner.services.lock();
        let mut found = false;
        for slot in services.iter_mut() {
            if matches!(slot, Some((id, _)) if *id == cmd_id) {
                *slot = None;
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(AmpError::NotFound)
        }
    }

    /// Execute at most one queued request, waiting up to `timeout_ms` for it
    ///
    /// Returns whether a request was served. Only valid with
    /// [`Dispatch::Queued`].
    pub fn run(&self, timeout_ms: u32) -> Result<bool> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(AmpError::InvalidState);
        }
        let queue = self.inner.queue_rx.lock();
        let rx = queue.as_ref().ok_or(AmpError::NotSupported)?;
        match rx.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
            Ok(digest) => {
                drop(queue);
                self.inner.exec_and_send(digest.msg, digest.client_addr);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(AmpError::InvalidState),
        }
    }

    /// Serve requests on a named thread until [`deinit`](Self::deinit)
    pub fn spawn(&self, name: &str) -> Result<JoinHandle<()>> {
        let server = self.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match server.run(50) {
                    Ok(_) => {}
                    Err(AmpError::InvalidState) => break,
                    Err(e) => {
                        error!(target: "rpc", "server loop stopped: {}", e);
                        break;
                    }
                }
            })
            .map_err(AmpError::Spawn)
    }

    #[inline]
    pub fn server_id(&self) -> u16 {
        self.inner.server_id
    }
}

impl ServerInner {
    fn on_request(&self, msg: RpmsgMessage, _ctx: ExecContext) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let client_addr = msg.src();

        match self.dispatch {
            Dispatch::Inline => self.exec_and_send(msg, client_addr),
            Dispatch::Queued { .. } => {
                let queue = self.queue_tx.lock();
                let Some(tx) = queue.as_ref() else {
                    return;
                };
                match tx.try_send(Digest { client_addr, msg }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        warn!(target: "rpc", "request queue full, dropping request from {:#x}", client_addr);
                    }
                }
            }
        }
    }

    fn exec_and_send(&self, msg: RpmsgMessage, client_addr: u16) {
        let mut scratch = self.scratch.lock();
        let Scratch { req, resp } = &mut *scratch;

        let Some((header, payload)) = PacketHeader::decode(msg.data()) else {
            warn!(target: "rpc", "short request packet from {:#x}", client_addr);
            return;
        };
        let req_len = payload.len().min(req.len());
        req[..req_len].copy_from_slice(&payload[..req_len]);
        if let Err(e) = msg.destroy() {
            error!(target: "rpc", "failed to release request: {}", e);
        }

        let handler = self
            .services
            .lock()
            .iter()
            .flatten()
            .find(|(id, _)| *id == header.cmd_id)
            .map(|(_, h)| h.clone());

        let mut call = ServiceCall {
            cmd_id: header.cmd_id,
            req: &req[..req_len],
            resp: &mut resp[..],
            resp_len: 0,
            status: STATUS_OK,
        };
        match handler {
            Some(handler) => handler(&mut call),
            None => {
                debug!(target: "rpc", "invalid cmd {:#x} from {:#x}", header.cmd_id, client_addr);
                call.status = STATUS_INVALID_CMD;
                call.resp[0] = 0;
                call.resp_len = 1;
            }
        }

        if call.resp_len == 0 {
            return;
        }

        let max = self.dev.max_payload_size() as usize;
        let msg_len = (call.resp_len as usize).min(max - RPC_HEADER_SIZE);
        let mut out = match self.dev.create_message(max, DATA_DEFAULT) {
            Ok(out) => out,
            Err(e) => {
                error!(target: "rpc", "no buffer for response to {:#x}: {}", client_addr, e);
                return;
            }
        };
        let buf = out.data_mut();
        PacketHeader {
            msg_id: header.msg_id,
            cmd_id: header.cmd_id,
            status: call.status,
            msg_len: msg_len as u16,
        }
        .encode(buf);
        buf[RPC_HEADER_SIZE..RPC_HEADER_SIZE + msg_len].copy_from_slice(&call.resp[..msg_len]);

        if let Err(e) = self
            .dev
            .send_nocopy(self.server_id, client_addr, out, (RPC_HEADER_SIZE + msg_len) as u16)
        {
            error!(target: "rpc", "response to {:#x} lost: {}", client_addr, e);
        }
    }
}
