//! Per-core bring-up
//!
//! [`AmpCore::init`] wires one core onto the shared region in the order the
//! layers depend on each other: interrupt multiplexer, sys-info directory,
//! system service, then the default event words.

use crate::error::{AmpError, Result};
use crate::event::{Event, EventGroup, EventTable};
use crate::platform::{CoreId, Platform};
use crate::rpmsg::{RpmsgConfig, RpmsgDevice};
use crate::service::{SystemService, SERVICE_ITEM_SIZE, SERVICE_QUEUE_LEN};
use crate::shm::SharedMem;
use crate::sw_intr::{IntrHandler, SwIntr, SwIntrId, DEFAULT_HANDLER_TABLE_LEN};
use crate::sys_info::{SysInfo, SYS_INFO_ID_EVENT_MAIN, SYS_INFO_ID_EVENT_SUB};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Default event words plus four application bindings
pub const DEFAULT_EVENT_TABLE_LEN: usize = 5;

/// Bring-up parameters shared by both cores
#[derive(Debug, Clone)]
pub struct AmpConfig {
    /// Name of the POSIX shared memory object
    pub region_name: String,
    /// Size of the shared region in bytes
    pub region_size: usize,
    /// Slots in the interrupt handler table
    pub sw_intr_table_len: usize,
    /// Slots in the event binding table
    pub event_table_len: usize,
    pub service_queue_len: u16,
    pub service_item_size: u16,
    /// Run the system service channel and the main core's supplicant
    pub supplicant: bool,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            region_name: "amp_link".to_string(),
            region_size: 64 * 1024,
            sw_intr_table_len: DEFAULT_HANDLER_TABLE_LEN,
            event_table_len: DEFAULT_EVENT_TABLE_LEN,
            service_queue_len: SERVICE_QUEUE_LEN,
            service_item_size: SERVICE_ITEM_SIZE,
            supplicant: true,
        }
    }
}

impl AmpConfig {
    /// Create (main core) or open (sub core) the named region
    pub fn map_region(&self, core: CoreId) -> Result<SharedMem> {
        match core {
            CoreId::Main => SharedMem::create(&self.region_name, self.region_size),
            CoreId::Sub => SharedMem::open(&self.region_name),
        }
    }
}

/// One core attached to the link
pub struct AmpCore {
    core: CoreId,
    sys_info: Arc<SysInfo>,
    sw_intr: Arc<SwIntr>,
    events: Arc<EventTable>,
    event_handler: IntrHandler,
    // word this core notifies
    local_event: Event,
    // word the peer notifies
    peer_event: Event,
    service: Option<Arc<SystemService>>,
    supplicant: Mutex<Option<JoinHandle<()>>>,
}

impl AmpCore {
    /// Attach `core` to `mem`
    ///
    /// The main core must finish before the sub core starts: it lays out
    /// every reserved structure the sub core looks up.
    pub fn init(
        core: CoreId,
        mem: Arc<SharedMem>,
        platform: Arc<dyn Platform>,
        config: &AmpConfig,
    ) -> Result<Self> {
        let sw_intr = Arc::new(SwIntr::new(
            mem.clone(),
            core,
            platform,
            config.sw_intr_table_len,
        )?);
        sw_intr.init()?;

        let sys_info = Arc::new(SysInfo::new(mem, core)?);
        sys_info.init();

        let service = match (config.supplicant, core) {
            (false, _) => None,
            (true, CoreId::Main) => Some(SystemService::main_init(
                &sys_info,
                sw_intr.clone(),
                config.service_queue_len,
                config.service_item_size,
            )?),
            (true, CoreId::Sub) => Some(SystemService::sub_init(&sys_info, sw_intr.clone())?),
        };

        let (local_id, peer_id) = match core {
            CoreId::Main => (SYS_INFO_ID_EVENT_MAIN, SYS_INFO_ID_EVENT_SUB),
            CoreId::Sub => (SYS_INFO_ID_EVENT_SUB, SYS_INFO_ID_EVENT_MAIN),
        };
        let (local_event, peer_event) = if core.is_main() {
            (
                Event::create(sys_info.clone(), sw_intr.clone(), local_id)?,
                Event::create(sys_info.clone(), sw_intr.clone(), peer_id)?,
            )
        } else {
            (
                Event::open(sys_info.clone(), sw_intr.clone(), local_id)?,
                Event::open(sys_info.clone(), sw_intr.clone(), peer_id)?,
            )
        };

        let events = Arc::new(EventTable::new(sys_info.clone(), config.event_table_len));
        events.bind(peer_id, Arc::new(EventGroup::new()))?;
        let event_handler = events.isr_handler();
        sw_intr.add_handler(SwIntrId::EVENT, event_handler.clone())?;

        // last, so a failed bring-up leaves no thread behind
        let supplicant = match &service {
            Some(svc) if core.is_main() => Some(svc.spawn_supplicant("amp_supp")?),
            _ => None,
        };

        info!(target: "amp", "{:?} core up", core);
        Ok(Self {
            core,
            sys_info,
            sw_intr,
            events,
            event_handler,
            local_event,
            peer_event,
            service,
            supplicant: Mutex::new(supplicant),
        })
    }

    /// Bring up an RPMsg device on this core and hook it to the interrupt line
    pub fn rpmsg(&self, config: &RpmsgConfig) -> Result<Arc<RpmsgDevice>> {
        let dev = match self.core {
            CoreId::Main => RpmsgDevice::main_init(&self.sys_info, self.sw_intr.clone(), config)?,
            CoreId::Sub => RpmsgDevice::sub_init(&self.sys_info, self.sw_intr.clone(), config)?,
        };
        if !config.poll {
            dev.intr_enable()?;
        }
        Ok(dev)
    }

    /// Set `mask` on this core's event word and interrupt the peer
    pub fn notify(&self, mask: u32) -> u32 {
        self.local_event.notify(mask)
    }

    /// Block until the peer sets `mask` or `timeout_ms` elapses
    pub fn wait(&self, mask: u32, clear_on_exit: bool, wait_for_all: bool, timeout_ms: u32) -> Result<u32> {
        self.events
            .wait(self.peer_event.sysinfo_id(), mask, clear_on_exit, wait_for_all, timeout_ms)
    }

    /// Clear bits the peer has set
    pub fn clear(&self, mask: u32) -> Result<u32> {
        self.events.clear(self.peer_event.sysinfo_id(), mask)
    }

    /// Run this core's interrupt service routine once
    pub fn handle_interrupt(&self) -> bool {
        self.sw_intr.handle_interrupt()
    }

    /// Stop the supplicant and detach from the interrupt lines
    pub fn shutdown(&self) {
        self.sw_intr.delete_handler(SwIntrId::EVENT, &self.event_handler);
        if let Some(svc) = &self.service {
            svc.deinit();
        }
        if let Some(handle) = self.supplicant.lock().take() {
            if handle.join().is_err() {
                debug!(target: "amp", "supplicant thread panicked");
            }
        }
    }

    /// System service channel, when enabled
    pub fn service(&self) -> Result<&Arc<SystemService>> {
        self.service.as_ref().ok_or(AmpError::NotSupported)
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    #[inline]
    pub fn sys_info(&self) -> &Arc<SysInfo> {
        &self.sys_info
    }

    #[inline]
    pub fn sw_intr(&self) -> &Arc<SwIntr> {
        &self.sw_intr
    }

    #[inline]
    pub fn events(&self) -> &Arc<EventTable> {
        &self.events
    }

    #[inline]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        self.sw_intr.platform()
    }
}

impl Drop for AmpCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WAIT_FOREVER;
    use crate::platform::HostPlatform;
    use crate::rpmsg::{ExecContext, RpmsgMessage};
    use crate::sys_info::SYS_INFO_ID_VQUEUE;
    use std::sync::mpsc;
    use std::time::Duration;

    fn cores(config: &AmpConfig) -> (AmpCore, AmpCore, Arc<HostPlatform>, Arc<HostPlatform>) {
        let mem = Arc::new(SharedMem::anonymous(config.region_size).unwrap());
        let (pm, ps) = HostPlatform::pair();
        let (pm, ps) = (Arc::new(pm), Arc::new(ps));
        let main = AmpCore::init(CoreId::Main, mem.clone(), pm.clone(), config).unwrap();
        let sub = AmpCore::init(CoreId::Sub, mem, ps.clone(), config).unwrap();
        (main, sub, pm, ps)
    }

    #[test]
    fn test_bring_up_publishes_reserved_entries() {
        let (main, sub, _, _) = cores(&AmpConfig::default());
        for id in [SYS_INFO_ID_EVENT_MAIN, SYS_INFO_ID_EVENT_SUB] {
            assert_eq!(main.sys_info().get(id).unwrap().1, 4);
            assert_eq!(sub.sys_info().get(id).unwrap(), main.sys_info().get(id).unwrap());
        }
        assert!(main.service().is_ok());
        assert!(sub.service().is_ok());
    }

    #[test]
    fn test_sub_without_main_fails() {
        let mem = Arc::new(SharedMem::anonymous(16 * 1024).unwrap());
        let config = AmpConfig {
            supplicant: false,
            ..Default::default()
        };
        let err = AmpCore::init(CoreId::Sub, mem, Arc::new(HostPlatform::loopback()), &config);
        assert!(matches!(err, Err(AmpError::NotFound)));
    }

    #[test]
    fn test_events_cross_cores() {
        let config = AmpConfig {
            supplicant: false,
            ..Default::default()
        };
        let (main, sub, pm, _) = cores(&config);

        sub.notify(0b101);
        assert!(pm.wait_irq(Duration::from_secs(1)));
        assert!(main.handle_interrupt());
        assert_eq!(main.wait(0b001, true, false, WAIT_FOREVER).unwrap(), 0b101);
        assert_eq!(main.clear(0b100).unwrap(), 0b100);
        assert_eq!(main.wait(0b001, false, false, 0).unwrap(), 0);
    }

    #[test]
    fn test_rpmsg_over_interrupts() {
        let config = AmpConfig {
            supplicant: false,
            ..Default::default()
        };
        let (main, sub, _, ps) = cores(&config);
        let main_dev = main.rpmsg(&RpmsgConfig::default()).unwrap();
        let sub_dev = sub.rpmsg(&RpmsgConfig::default()).unwrap();
        assert_eq!(
            main.sys_info().get(SYS_INFO_ID_VQUEUE).unwrap(),
            sub.sys_info().get(SYS_INFO_ID_VQUEUE).unwrap()
        );

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        sub_dev
            .create_endpoint(
                2,
                Some(Arc::new(move |msg: RpmsgMessage, ctx: ExecContext| {
                    let _ = tx.lock().send((msg.data().to_vec(), ctx));
                })),
            )
            .unwrap();

        let _isr = ps.spawn_isr(sub.sw_intr().clone(), "sub_isr").unwrap();
        main_dev.create_endpoint(1, None).unwrap();
        main_dev.send(1, 2, b"ping").unwrap();
        let (data, ctx) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(ctx, ExecContext::Isr);
    }

    #[test]
    fn test_remote_print_reaches_supplicant() {
        let (main, sub, pm, _) = cores(&AmpConfig::default());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let svc = main.service().unwrap();
        svc.unregister_handler(crate::service::SERVICE_ID_PRINT).unwrap();
        svc.register_handler(
            crate::service::SERVICE_ID_PRINT,
            Arc::new(move |req: &crate::service::ServiceRequest| {
                let _ = tx.lock().send(req.params().to_vec());
            }),
        )
        .unwrap();

        let _isr = pm.spawn_isr(main.sw_intr().clone(), "main_isr").unwrap();
        sub.service().unwrap().print_remote(format_args!("hi {}", 1)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"hi 1");
    }
}
