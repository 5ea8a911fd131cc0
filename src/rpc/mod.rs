//! Request/response commands on top of RPMsg
//!
//! A [`RpcClient`] sends one command at a time to a [`RpcServer`] endpoint and
//! matches the response by message id. The server looks the command id up in
//! its service table and replies with the handler's status and response bytes.

mod client;
mod packet;
mod server;

pub use client::{CompletionFn, PollFn, RpcClient, RpcClientConfig, RpcCommand};
pub use packet::{PacketHeader, RPC_HEADER_SIZE};
pub use server::{Dispatch, RpcServer, RpcServerConfig, ServiceCall, ServiceHandler};

/// Command completed
pub const STATUS_OK: u16 = 0x0000;
/// Server could not take the request
pub const STATUS_SERVER_BUSY: u16 = 0xffff;
/// No service registered for the command id
pub const STATUS_INVALID_CMD: u16 = 0xfffe;
/// Service handler reported failure
pub const STATUS_EXEC_FAILED: u16 = 0xfffd;
/// No response yet
pub const STATUS_PENDING: u16 = 0xfffc;

#[cfg(test)]
pub(crate) mod testing {
    use crate::platform::{CoreId, HostPlatform};
    use crate::rpmsg::{RpmsgConfig, RpmsgDevice};
    use crate::shm::SharedMem;
    use crate::sw_intr::SwIntr;
    use crate::sys_info::SysInfo;
    use std::sync::Arc;

    /// Polled RPMsg pair: (main, sub)
    pub(crate) fn link() -> (Arc<RpmsgDevice>, Arc<RpmsgDevice>) {
        let mem = Arc::new(SharedMem::anonymous(64 * 1024).unwrap());
        let (pm, ps) = HostPlatform::pair();
        let main_info = SysInfo::new(mem.clone(), CoreId::Main).unwrap();
        let sub_info = SysInfo::new(mem.clone(), CoreId::Sub).unwrap();
        main_info.init();
        let main_intr = Arc::new(SwIntr::new(mem.clone(), CoreId::Main, Arc::new(pm), 8).unwrap());
        let sub_intr = Arc::new(SwIntr::new(mem, CoreId::Sub, Arc::new(ps), 8).unwrap());

        let config = RpmsgConfig {
            queue_len: 4,
            item_size: 64,
            poll: true,
            ..Default::default()
        };
        let main = RpmsgDevice::main_init(&main_info, main_intr, &config).unwrap();
        let sub = RpmsgDevice::sub_init(&sub_info, sub_intr, &config).unwrap();
        (main, sub)
    }
}
