//! RPMsg ping-pong between two simulated cores
//!
//! The sub core echoes every message it receives on endpoint 1 back to the
//! sender; the main core sends numbered pings and reports round-trip latency.
//!
//! Usage: rpmsg_ping [iterations]

use amp_link::{AmpConfig, AmpCore, CoreId, ExecContext, HostPlatform, RpmsgConfig, RpmsgMessage, SharedMem};
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

const ECHO_EPT: u16 = 1;
const PING_EPT: u16 = 2;

fn main() {
    let iterations: u32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);

    println!("╔══════════════════════════════════════════════════╗");
    println!("║            amp_link RPMsg ping-pong              ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    let config = AmpConfig::default();
    let mem = match SharedMem::anonymous(config.region_size) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            eprintln!("[Ping] Failed to map shared region: {}", e);
            std::process::exit(1);
        }
    };
    let (pm, ps) = HostPlatform::pair();
    let (pm, ps) = (Arc::new(pm), Arc::new(ps));

    let main = AmpCore::init(CoreId::Main, mem.clone(), pm.clone(), &config).unwrap();
    let sub = AmpCore::init(CoreId::Sub, mem, ps.clone(), &config).unwrap();
    let _main_isr = pm.spawn_isr(main.sw_intr().clone(), "main_isr").unwrap();
    let _sub_isr = ps.spawn_isr(sub.sw_intr().clone(), "sub_isr").unwrap();

    let main_dev = main.rpmsg(&RpmsgConfig::default()).unwrap();
    let sub_dev = sub.rpmsg(&RpmsgConfig::default()).unwrap();
    println!("[Ping] Link up, max payload {} bytes", main_dev.max_payload_size());

    // echo from interrupt context: copy out, release the slot, send back
    let echo_dev = Arc::downgrade(&sub_dev);
    sub_dev
        .create_endpoint(
            ECHO_EPT,
            Some(Arc::new(move |msg: RpmsgMessage, _ctx: ExecContext| {
                let Some(dev) = echo_dev.upgrade() else { return };
                let data = msg.data().to_vec();
                let reply_to = msg.src();
                drop(msg);
                while let Err(e) = dev.send(ECHO_EPT, reply_to, &data) {
                    if !e.is_transient() {
                        eprintln!("[Echo] send failed: {}", e);
                        return;
                    }
                    std::hint::spin_loop();
                }
            })),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    main_dev
        .create_endpoint(
            PING_EPT,
            Some(Arc::new(move |msg: RpmsgMessage, _ctx: ExecContext| {
                if msg.len() < 4 {
                    return;
                }
                let mut seq = [0u8; 4];
                seq.copy_from_slice(&msg.data()[..4]);
                let _ = tx.lock().send(u32::from_le_bytes(seq));
            })),
        )
        .unwrap();

    let mut total = Duration::ZERO;
    let mut worst = Duration::ZERO;
    let mut lost = 0u32;
    let start = Instant::now();

    for seq in 0..iterations {
        let sent = Instant::now();
        if let Err(e) = main_dev.send(PING_EPT, ECHO_EPT, &seq.to_le_bytes()) {
            eprintln!("[Ping] send {} failed: {}", seq, e);
            lost += 1;
            continue;
        }
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(echo) if echo == seq => {
                let rtt = sent.elapsed();
                total += rtt;
                worst = worst.max(rtt);
            }
            Ok(echo) => {
                eprintln!("[Ping] expected {} got {}", seq, echo);
                lost += 1;
            }
            Err(_) => lost += 1,
        }
    }

    let elapsed = start.elapsed();
    let ok = iterations - lost;
    println!();
    println!("[Ping] {} round trips in {:.2?} ({} lost)", ok, elapsed, lost);
    if ok > 0 {
        println!(
            "[Ping] avg {:.2} µs, max {:.2} µs, {:.0} msg/s",
            total.as_secs_f64() * 1e6 / ok as f64,
            worst.as_secs_f64() * 1e6,
            ok as f64 / elapsed.as_secs_f64()
        );
    }
}
