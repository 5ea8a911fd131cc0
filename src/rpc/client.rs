use super::packet::{PacketHeader, RPC_HEADER_SIZE};
use super::STATUS_PENDING;
use crate::error::{AmpError, Result};
use crate::rpmsg::{EndpointHandler, ExecContext, RpmsgDevice, RpmsgMessage, DATA_DEFAULT};
use log::{debug, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Hook that services the link when no interrupt does (typically `dev.poll()`)
pub type PollFn = Arc<dyn Fn() + Send + Sync>;

/// Runs once when the response of a command arrives
///
/// Called from the endpoint handler, which may be interrupt context.
pub type CompletionFn = Box<dyn FnOnce(&RpcCommand) + Send>;

/// Client endpoint addressing
#[derive(Clone, Default)]
pub struct RpcClientConfig {
    /// Local endpoint address
    pub client_id: u16,
    /// Server endpoint address
    pub server_id: u16,
    /// Called by [`RpcClient::poll`]
    pub poll: Option<PollFn>,
}

struct CommandState {
    cmd_id: u16,
    status: u16,
    req: Vec<u8>,
    resp: Vec<u8>,
    resp_len: u16,
    on_complete: Option<CompletionFn>,
}

/// One request and the slot its response lands in
///
/// Cloning yields another handle to the same command.
#[derive(Clone)]
pub struct RpcCommand {
    state: Arc<Mutex<CommandState>>,
}

impl RpcCommand {
    /// `resp_capacity` bounds how many response bytes are kept
    pub fn new(cmd_id: u16, req: &[u8], resp_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CommandState {
                cmd_id,
                status: STATUS_PENDING,
                req: req.to_vec(),
                resp: vec![0; resp_capacity],
                resp_len: 0,
                on_complete: None,
            })),
        }
    }

    /// Register a completion callback
    pub fn on_complete(self, f: impl FnOnce(&RpcCommand) + Send + 'static) -> Self {
        self.state.lock().on_complete = Some(Box::new(f));
        self
    }

    pub fn cmd_id(&self) -> u16 {
        self.state.lock().cmd_id
    }

    pub fn status(&self) -> u16 {
        self.state.lock().status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == STATUS_PENDING
    }

    /// Bytes of response kept
    pub fn resp_len(&self) -> u16 {
        self.state.lock().resp_len
    }

    pub fn response(&self) -> Vec<u8> {
        let state = self.state.lock();
        state.resp[..state.resp_len as usize].to_vec()
    }

    fn same(&self, other: &RpcCommand) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn complete(&self, status: u16, payload: &[u8]) {
        let on_complete = {
            let mut state = self.state.lock();
            let n = payload.len().min(state.resp.len());
            state.resp[..n].copy_from_slice(&payload[..n]);
            state.resp_len = n as u16;
            state.status = status;
            state.on_complete.take()
        };
        if let Some(f) = on_complete {
            f(self);
        }
    }
}

impl fmt::Debug for RpcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RpcCommand")
            .field("cmd_id", &state.cmd_id)
            .field("status", &format_args!("{:#06x}", state.status))
            .field("resp_len", &state.resp_len)
            .finish()
    }
}

struct ClientState {
    running: bool,
    pending_id: u16,
    pending: Option<RpcCommand>,
}

struct ClientInner {
    dev: Arc<RpmsgDevice>,
    client_id: u16,
    server_id: u16,
    poll: Option<PollFn>,
    state: Mutex<ClientState>,
}

/// Client side of an RPC link
///
/// At most one command is in flight at a time.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Bind the client endpoint on `dev`
    pub fn init(dev: Arc<RpmsgDevice>, config: RpcClientConfig) -> Result<Self> {
        let inner = Arc::new(ClientInner {
            dev,
            client_id: config.client_id,
            server_id: config.server_id,
            poll: config.poll,
            state: Mutex::new(ClientState {
                running: true,
                pending_id: 0,
                pending: None,
            }),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        let handler: EndpointHandler = Arc::new(move |msg: RpmsgMessage, ctx: ExecContext| {
            if let Some(inner) = weak.upgrade() {
                inner.on_response(msg, ctx);
            }
        });
        inner.dev.create_endpoint(config.client_id, Some(handler))?;
        debug!(target: "rpc", "client {:#x} -> server {:#x}", config.client_id, config.server_id);

        Ok(Self { inner })
    }

    /// Unbind the endpoint; later calls fail with [`AmpError::InvalidState`]
    pub fn deinit(&self) {
        let mut state = self.inner.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        state.pending = None;
        drop(state);
        let _ = self.inner.dev.delete_endpoint(self.inner.client_id);
    }

    /// Send `cmd` to the server and make it the pending command
    ///
    /// Fails with [`AmpError::NotAllowed`] while another command is pending,
    /// and with [`AmpError::NotFound`] when no TX slot is free (retry later).
    pub fn execute_cmd(&self, cmd: &RpcCommand) -> Result<()> {
        let inner = &self.inner;
        let (cmd_id, req) = {
            let state = cmd.state.lock();
            (state.cmd_id, state.req.clone())
        };
        let pkt_len = RPC_HEADER_SIZE + req.len();
        let msg_len = u16::try_from(req.len()).map_err(|_| AmpError::NoMem {
            max: inner.dev.max_payload_size() as usize,
            got: pkt_len,
        })?;

        let (msg, msg_id) = {
            let mut state = inner.state.lock();
            if !state.running {
                return Err(AmpError::InvalidState);
            }
            if state.pending.is_some() {
                return Err(AmpError::NotAllowed);
            }

            let mut msg = inner.dev.create_message(pkt_len, DATA_DEFAULT)?;

            cmd.state.lock().status = STATUS_PENDING;
            state.pending_id = state.pending_id.wrapping_add(1);
            let msg_id = state.pending_id;

            let buf = msg.data_mut();
            PacketHeader {
                msg_id,
                cmd_id,
                status: STATUS_PENDING,
                msg_len,
            }
            .encode(buf);
            buf[RPC_HEADER_SIZE..].copy_from_slice(&req);

            state.pending = Some(cmd.clone());
            (msg, msg_id)
        };

        trace!(target: "rpc", "execute cmd {:#x} msg_id {}", cmd_id, msg_id);
        if let Err(e) = inner
            .dev
            .send_nocopy(inner.client_id, inner.server_id, msg, pkt_len as u16)
        {
            inner.state.lock().pending = None;
            return Err(e);
        }
        Ok(())
    }

    /// Run the configured poll hook
    pub fn poll(&self) {
        if !self.inner.state.lock().running {
            return;
        }
        if let Some(poll) = &self.inner.poll {
            poll();
        }
    }

    /// Drop the pending command without waiting for its response
    ///
    /// The command keeps its pending status; a late response is discarded.
    pub fn cancel(&self) -> Option<RpcCommand> {
        self.inner.state.lock().pending.take()
    }

    /// Poll until `cmd` completes or `timeout_ms` elapses
    ///
    /// On timeout the pending slot is released so the next command can go out.
    pub fn wait(&self, cmd: &RpcCommand, timeout_ms: u32) -> Result<u16> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let status = cmd.status();
            if status != STATUS_PENDING {
                return Ok(status);
            }
            if !self.inner.state.lock().running {
                return Err(AmpError::InvalidState);
            }
            if Instant::now() >= deadline {
                let mut state = self.inner.state.lock();
                if state.pending.as_ref().map_or(false, |p| p.same(cmd)) {
                    state.pending = None;
                }
                return Err(AmpError::Timeout(timeout_ms));
            }
            self.poll();
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    #[inline]
    pub fn client_id(&self) -> u16 {
        self.inner.client_id
    }

    #[inline]
    pub fn server_id(&self) -> u16 {
        self.inner.server_id
    }
}

impl ClientInner {
    fn on_response(&self, msg: RpmsgMessage, ctx: ExecContext) {
        let Some((header, payload)) = PacketHeader::decode(msg.data()) else {
            debug!(target: "rpc", "short response packet from {:#x}", msg.src());
            return;
        };

        let cmd = {
            let mut state = self.state.lock();
            if !state.running || header.msg_id != state.pending_id {
                None
            } else {
                state.pending.take()
            }
        };

        match cmd {
            Some(cmd) => {
                trace!(target: "rpc", "response msg_id {} status {:#06x} ({:?})", header.msg_id, header.status, ctx);
                cmd.complete(header.status, payload);
            }
            None => debug!(target: "rpc", "stale response msg_id {}", header.msg_id),
        }
        // msg dropped here, returning the slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::link;
    use crate::rpc::STATUS_OK;

    fn reply(dev: &RpmsgDevice, to: u16, msg_id: u16, status: u16, payload: &[u8]) {
        let mut buf = vec![0u8; RPC_HEADER_SIZE + payload.len()];
        PacketHeader {
            msg_id,
            cmd_id: 0,
            status,
            msg_len: payload.len() as u16,
        }
        .encode(&mut buf);
        buf[RPC_HEADER_SIZE..].copy_from_slice(payload);
        if !dev.search_endpoint(0x80) {
            dev.create_endpoint(0x80, None).unwrap();
        }
        dev.send(0x80, to, &buf).unwrap();
    }

    fn client(dev: Arc<RpmsgDevice>) -> RpcClient {
        let poll_dev = dev.clone();
        RpcClient::init(
            dev,
            RpcClientConfig {
                client_id: 0x40,
                server_id: 0x80,
                poll: Some(Arc::new(move || while poll_dev.poll().is_ok() {})),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_second_command_rejected_while_pending() {
        let (main, sub) = link();
        let client = client(main);

        let first = RpcCommand::new(1, b"a", 4);
        let second = RpcCommand::new(2, b"b", 4);
        client.execute_cmd(&first).unwrap();
        assert!(matches!(client.execute_cmd(&second), Err(AmpError::NotAllowed)));

        // request reached the peer with msg_id 1
        while sub.poll().is_ok() {}
        reply(&sub, 0x40, 1, STATUS_OK, b"ok");
        assert_eq!(client.wait(&first, 1000).unwrap(), STATUS_OK);
        assert_eq!(first.response(), b"ok");

        client.execute_cmd(&second).unwrap();
    }

    #[test]
    fn test_stale_response_ignored() {
        let (main, sub) = link();
        let client = client(main);
        let cmd = RpcCommand::new(1, b"", 4);
        client.execute_cmd(&cmd).unwrap();

        reply(&sub, 0x40, 99, STATUS_OK, b"no");
        client.poll();
        assert!(cmd.is_pending());
    }

    #[test]
    fn test_wait_timeout_releases_slot() {
        let (main, _sub) = link();
        let client = client(main);
        let cmd = RpcCommand::new(3, b"x", 4);
        client.execute_cmd(&cmd).unwrap();

        assert!(matches!(client.wait(&cmd, 10), Err(AmpError::Timeout(10))));
        assert!(cmd.is_pending());
        client.execute_cmd(&RpcCommand::new(4, b"y", 4)).unwrap();
    }

    #[test]
    fn test_cancel_and_deinit() {
        let (main, _sub) = link();
        let client = client(main.clone());
        let cmd = RpcCommand::new(3, b"x", 4);
        client.execute_cmd(&cmd).unwrap();
        assert!(client.cancel().is_some());
        assert!(client.cancel().is_none());

        client.deinit();
        assert!(!main.search_endpoint(0x40));
        assert!(matches!(
            client.execute_cmd(&RpcCommand::new(1, b"", 1)),
            Err(AmpError::InvalidState)
        ));
    }

    #[test]
    fn test_response_truncated_to_capacity() {
        let (main, sub) = link();
        let client = client(main);
        let cmd = RpcCommand::new(1, b"", 2);
        client.execute_cmd(&cmd).unwrap();
        reply(&sub, 0x40, 1, STATUS_OK, b"abcdef");
        client.poll();
        assert_eq!(cmd.resp_len(), 2);
        assert_eq!(cmd.response(), b"ab");
    }

    #[test]
    fn test_oversized_request() {
        let (main, _sub) = link();
        let client = client(main.clone());
        let req = vec![0u8; main.max_payload_size() as usize];
        assert!(matches!(
            client.execute_cmd(&RpcCommand::new(1, &req, 1)),
            Err(AmpError::NoMem { .. })
        ));
    }

    #[test]
    fn test_completion_callback() {
        let (main, sub) = link();
        let client = client(main);
        let (tx, rx) = std::sync::mpsc::channel();
        let cmd = RpcCommand::new(1, b"", 4).on_complete(move |c| {
            tx.send(c.status()).unwrap();
        });
        client.execute_cmd(&cmd).unwrap();
        reply(&sub, 0x40, 1, 0x1234, b"");
        client.poll();
        assert_eq!(rx.try_recv().unwrap(), 0x1234);
    }

    #[test]
    fn test_duplicate_client_endpoint() {
        let (main, _sub) = link();
        let _first = client(main.clone());
        assert!(matches!(
            RpcClient::init(main, RpcClientConfig { client_id: 0x40, ..Default::default() }),
            Err(AmpError::Exist)
        ));
    }
}
