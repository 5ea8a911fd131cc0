//! RPC client on the main core calling services on the sub core
//!
//! The server runs its queued dispatch on a worker thread and exposes:
//!   1 - add two little-endian u32 values
//!   2 - reverse a byte string
//!   3 - always fail with EXEC_FAILED

use amp_link::rpc::{Dispatch, ServiceCall, STATUS_EXEC_FAILED, STATUS_OK};
use amp_link::{
    AmpConfig, AmpCore, CoreId, HostPlatform, RpcClient, RpcClientConfig, RpcCommand, RpcServer, RpcServerConfig,
    RpmsgConfig, SharedMem,
};
use std::sync::Arc;

const CLIENT_ADDR: u16 = 0x10;
const SERVER_ADDR: u16 = 0x20;

const CMD_ADD: u16 = 1;
const CMD_REVERSE: u16 = 2;
const CMD_FAIL: u16 = 3;

fn add(call: &mut ServiceCall<'_>) {
    let req = call.request();
    if req.len() < 8 {
        call.set_status(STATUS_EXEC_FAILED);
        call.respond(&[0]);
        return;
    }
    let a = u32::from_le_bytes([req[0], req[1], req[2], req[3]]);
    let b = u32::from_le_bytes([req[4], req[5], req[6], req[7]]);
    call.respond(&a.wrapping_add(b).to_le_bytes());
}

fn reverse(call: &mut ServiceCall<'_>) {
    let mut data = call.request().to_vec();
    data.reverse();
    call.respond(&data);
}

fn main() {
    let config = AmpConfig::default();
    let mem = Arc::new(SharedMem::anonymous(config.region_size).unwrap());
    let (pm, ps) = HostPlatform::pair();
    let (pm, ps) = (Arc::new(pm), Arc::new(ps));

    let main = AmpCore::init(CoreId::Main, mem.clone(), pm.clone(), &config).unwrap();
    let sub = AmpCore::init(CoreId::Sub, mem, ps.clone(), &config).unwrap();
    let _main_isr = pm.spawn_isr(main.sw_intr().clone(), "main_isr").unwrap();
    let _sub_isr = ps.spawn_isr(sub.sw_intr().clone(), "sub_isr").unwrap();

    let server = RpcServer::init(
        sub.rpmsg(&RpmsgConfig::default()).unwrap(),
        RpcServerConfig {
            server_id: SERVER_ADDR,
            dispatch: Dispatch::Queued { depth: 4 },
            ..Default::default()
        },
    )
    .unwrap();
    server.add_service(CMD_ADD, Arc::new(add)).unwrap();
    server.add_service(CMD_REVERSE, Arc::new(reverse)).unwrap();
    server
        .add_service(
            CMD_FAIL,
            Arc::new(|call: &mut ServiceCall<'_>| {
                call.set_status(STATUS_EXEC_FAILED);
                call.respond(b"nope");
            }),
        )
        .unwrap();
    let worker = server.spawn("rpc_server").unwrap();

    let client = RpcClient::init(
        main.rpmsg(&RpmsgConfig::default()).unwrap(),
        RpcClientConfig {
            client_id: CLIENT_ADDR,
            server_id: SERVER_ADDR,
            poll: None,
        },
    )
    .unwrap();

    let mut req = Vec::new();
    req.extend_from_slice(&40u32.to_le_bytes());
    req.extend_from_slice(&2u32.to_le_bytes());

    let calls = [
        ("add 40 + 2", RpcCommand::new(CMD_ADD, &req, 4)),
        ("reverse", RpcCommand::new(CMD_REVERSE, b"amp_link", 16)),
        ("fail", RpcCommand::new(CMD_FAIL, b"", 16)),
        ("unknown", RpcCommand::new(0x77, b"?", 4)),
    ];

    for (name, cmd) in &calls {
        if let Err(e) = client.execute_cmd(cmd) {
            eprintln!("[Client] {}: execute failed: {}", name, e);
            continue;
        }
        match client.wait(cmd, 1000) {
            Ok(STATUS_OK) => println!("[Client] {}: ok {:?}", name, cmd.response()),
            Ok(status) => println!("[Client] {}: status {:#06x} {:?}", name, status, cmd.response()),
            Err(e) => eprintln!("[Client] {}: {}", name, e),
        }
    }

    client.deinit();
    server.deinit();
    let _ = worker.join();
}
