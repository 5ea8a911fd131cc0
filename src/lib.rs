//! amp_link - Lock-free inter-core transport over shared memory
//!
//! Two cores (or two threads standing in for them) share one memory region
//! and a pair of software interrupt lines. On top of that this crate layers:
//!
//! # Architecture
//!
//! - **Sys-info**: a directory of id-tagged blobs the main core publishes
//! - **Sw-intr**: 32 logical interrupt lines multiplexed onto one physical line
//! - **Events**: cross-core bit words, polled or bound to native wait objects
//! - **Virtqueue**: single-producer/single-consumer descriptor ring
//! - **RPMsg**: endpoint-addressed messages over a virtqueue pair
//! - **RPC**: one-outstanding-request client/server over RPMsg
//! - **Service**: sub-to-main system requests (remote print, panic report)
//!
//! [`AmpCore`] brings up the lower layers for one core.

pub mod amp;
pub mod error;
pub mod event;
pub mod platform;
pub mod queue;
pub mod rpc;
pub mod rpmsg;
pub mod service;
pub mod shm;
pub mod sw_intr;
pub mod sys_info;

pub use amp::{AmpConfig, AmpCore};
pub use error::{AmpError, Result};
pub use event::{Event, EventGroup, EventTable, WAIT_FOREVER};
pub use platform::{CoreId, HostPlatform, Platform};
pub use queue::{Role, Virtqueue};
pub use rpc::{RpcClient, RpcClientConfig, RpcCommand, RpcServer, RpcServerConfig};
pub use rpmsg::{ExecContext, RpmsgConfig, RpmsgDevice, RpmsgMessage};
pub use service::SystemService;
pub use shm::SharedMem;
pub use sw_intr::{SwIntr, SwIntrId};
pub use sys_info::SysInfo;
