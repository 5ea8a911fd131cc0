//! Benchmarking cases:
//!   * one slot through alloc/send/recv/free
//!   * a full ring of 16 slots per iteration
//!   * RPMsg send + poll on a polled device pair

use std::hint::black_box;
use std::sync::Arc;

use amp_link::platform::HostPlatform;
use amp_link::{CoreId, Role, RpmsgConfig, RpmsgDevice, SharedMem, SwIntr, SysInfo, Virtqueue};
use criterion::{criterion_group, criterion_main, Criterion};

fn ring_pair(len: u16, item: u16) -> (Virtqueue, Virtqueue) {
    let mem = Arc::new(SharedMem::anonymous(64 * 1024).unwrap());
    let main_info = SysInfo::new(mem.clone(), CoreId::Main).unwrap();
    let sub_info = SysInfo::new(mem, CoreId::Sub).unwrap();
    main_info.init();
    let master = Virtqueue::main_init(&main_info, len, item, Role::master(), 0x0100).unwrap();
    let remote = Virtqueue::sub_init(&sub_info, Role::remote(), 0x0100).unwrap();
    (master, remote)
}

pub fn virtqueue_benchmark(c: &mut Criterion) {
    let (mut master, mut remote) = ring_pair(16, 128);
    let payload = [0xa5u8; 64];

    c.bench_function("vq_round_trip_1", |b| {
        b.iter(|| {
            let buf = master.alloc(64).unwrap();
            master.write_buffer(buf, &payload).unwrap();
            master.send(buf, 64).unwrap();
            let (rx, len) = remote.recv().unwrap();
            black_box(len);
            remote.free(rx).unwrap();
        })
    });

    c.bench_function("vq_round_trip_16", |b| {
        b.iter(|| {
            for _ in 0..16 {
                let buf = master.alloc(64).unwrap();
                master.send(buf, 64).unwrap();
            }
            while let Ok((rx, _)) = remote.recv() {
                remote.free(black_box(rx)).unwrap();
            }
        })
    });
}

pub fn rpmsg_benchmark(c: &mut Criterion) {
    let mem = Arc::new(SharedMem::anonymous(64 * 1024).unwrap());
    let (pm, ps) = HostPlatform::pair();
    let main_info = SysInfo::new(mem.clone(), CoreId::Main).unwrap();
    let sub_info = SysInfo::new(mem.clone(), CoreId::Sub).unwrap();
    main_info.init();
    let main_intr = Arc::new(SwIntr::new(mem.clone(), CoreId::Main, Arc::new(pm), 4).unwrap());
    let sub_intr = Arc::new(SwIntr::new(mem, CoreId::Sub, Arc::new(ps), 4).unwrap());

    let config = RpmsgConfig {
        notify: false,
        poll: true,
        ..Default::default()
    };
    let main = RpmsgDevice::main_init(&main_info, main_intr, &config).unwrap();
    let sub = RpmsgDevice::sub_init(&sub_info, sub_intr, &config).unwrap();
    sub.create_endpoint(1, None).unwrap();
    main.create_endpoint(2, None).unwrap();

    c.bench_function("rpmsg_send_poll_64", |b| {
        let data = [7u8; 64];
        b.iter(|| {
            main.send(2, 1, black_box(&data)).unwrap();
            sub.poll().unwrap();
        })
    });
}

criterion_group! {
    name = virtqueue_benches;
    config = Criterion::default().sample_size(500);
    targets = virtqueue_benchmark, rpmsg_benchmark
}

criterion_main! {
    virtqueue_benches
}
