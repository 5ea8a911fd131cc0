//! Event bits bouncing between two simulated cores
//!
//! The sub core waits for bit 0, answers with bit 1, and stops once the main
//! core sets bit 31.
//!
//! Usage: event_pair [rounds]

use amp_link::{AmpConfig, AmpCore, CoreId, HostPlatform, SharedMem, WAIT_FOREVER};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const PING: u32 = 1 << 0;
const PONG: u32 = 1 << 1;
const STOP: u32 = 1 << 31;

fn main() {
    let rounds: u32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    println!("[Events] {} rounds", rounds);

    let config = AmpConfig {
        supplicant: false,
        ..Default::default()
    };
    let mem = Arc::new(SharedMem::anonymous(config.region_size).unwrap());
    let (pm, ps) = HostPlatform::pair();
    let (pm, ps) = (Arc::new(pm), Arc::new(ps));

    let main = AmpCore::init(CoreId::Main, mem.clone(), pm.clone(), &config).unwrap();
    let sub = Arc::new(AmpCore::init(CoreId::Sub, mem, ps.clone(), &config).unwrap());
    let _main_isr = pm.spawn_isr(main.sw_intr().clone(), "main_isr").unwrap();
    let _sub_isr = ps.spawn_isr(sub.sw_intr().clone(), "sub_isr").unwrap();

    let responder = {
        let sub = sub.clone();
        thread::spawn(move || {
            let mut answered = 0u32;
            loop {
                let bits = match sub.wait(PING | STOP, true, false, WAIT_FOREVER) {
                    Ok(bits) => bits,
                    Err(e) => {
                        eprintln!("[Sub] wait failed: {}", e);
                        break;
                    }
                };
                if bits & STOP != 0 {
                    break;
                }
                sub.notify(PONG);
                answered += 1;
            }
            answered
        })
    };

    let start = Instant::now();
    let mut timeouts = 0;
    for _ in 0..rounds {
        main.notify(PING);
        match main.wait(PONG, true, false, 1000) {
            Ok(bits) if bits & PONG != 0 => {}
            _ => timeouts += 1,
        }
    }
    let elapsed = start.elapsed();

    main.notify(STOP);
    let answered = responder.join().unwrap_or(0);
    println!(
        "[Events] {} answered, {} timeouts, {:.2} µs per round",
        answered,
        timeouts,
        elapsed.as_secs_f64() * 1e6 / rounds.max(1) as f64
    );
}
