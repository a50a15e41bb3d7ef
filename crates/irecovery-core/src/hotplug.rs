//! Hot-plug monitor: tracks device arrivals and removals and fans events
//! out to registered listeners.
//!
//! The registries are library-global and lazily created. The first
//! subscription starts a polling worker (500 ms sweeps over the USB bus);
//! the last unsubscription stops it and drops every tracked device. The
//! listener set and the device set are guarded by separate mutexes that
//! are never held at the same time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nusb::MaybeFuture;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::info::DeviceInfo;
use crate::kis;
use crate::protocol::Mode;
use crate::protocol::constants::{APPLE_VENDOR_ID, RECOGNISED_PIDS};
use crate::transport::{NusbTransport, UsbTransport};

/// Sweep interval of the polling worker.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const KIS_INFO_ATTEMPTS: u32 = 10;
const KIS_INFO_BACKOFF: Duration = Duration::from_millis(500);

/// A device arrival or removal.
///
/// Removals carry the mode the device was last observed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Add {
        mode: Mode,
        device_info: DeviceInfo,
    },
    Remove {
        mode: Mode,
        device_info: DeviceInfo,
    },
}

/// Handle identifying one subscription; pass back to unsubscribe.
#[derive(Debug)]
pub struct EventContext {
    id: u64,
}

/// Platform-stable identity of an attached device for add/remove pairing.
type Location = String;

struct Listener {
    id: u64,
    callback: Box<dyn Fn(&DeviceEvent) + Send + Sync>,
}

struct TrackedDevice {
    location: Location,
    mode: Mode,
    device_info: DeviceInfo,
    alive: bool,
}

struct HotplugState {
    listeners: Mutex<Vec<Listener>>,
    devices: Mutex<Vec<TrackedDevice>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl HotplugState {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn dispatch(&self, event: &DeviceEvent) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            (listener.callback)(event);
        }
    }
}

fn state() -> &'static HotplugState {
    static STATE: OnceLock<HotplugState> = OnceLock::new();
    STATE.get_or_init(HotplugState::new)
}

/// Register a listener for device add/remove events. The first listener
/// starts the background worker.
pub fn device_event_subscribe(
    callback: impl Fn(&DeviceEvent) + Send + Sync + 'static,
) -> Result<EventContext> {
    crate::ensure_init();
    let state = state();

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    state.listeners.lock().unwrap().push(Listener {
        id,
        callback: Box::new(callback),
    });

    let mut worker = state.worker.lock().unwrap();
    if worker.is_none() {
        state.running.store(true, Ordering::SeqCst);
        info!("starting hotplug worker");
        *worker = Some(
            thread::Builder::new()
                .name("irecovery-hotplug".into())
                .spawn(move || worker_loop(state))
                .map_err(|_| Error::Unknown)?,
        );
    }

    Ok(EventContext { id })
}

/// Remove a listener. The last removal stops the worker and drops every
/// tracked device; events already in flight are simply not delivered to
/// the removed listener.
pub fn device_event_unsubscribe(context: EventContext) -> Result<()> {
    let state = state();

    let remaining = {
        let mut listeners = state.listeners.lock().unwrap();
        listeners.retain(|l| l.id != context.id);
        listeners.len()
    };

    if remaining == 0 {
        state.running.store(false, Ordering::SeqCst);
        let handle = state.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            info!("stopping hotplug worker");
            let _ = handle.join();
        }
        state.devices.lock().unwrap().clear();
    }

    Ok(())
}

/// Whether the background worker is currently alive.
pub fn worker_running() -> bool {
    state().worker.lock().unwrap().is_some()
}

fn worker_loop(state: &'static HotplugState) {
    while state.running.load(Ordering::SeqCst) {
        process_sweep(state, enumerate_candidates());

        if state.listeners.lock().unwrap().is_empty() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    debug!("hotplug worker exiting");
}

/// One polling sweep: mark everything dead, revive what is still present,
/// add what is new, then report whatever stayed dead as removed.
fn process_sweep<F>(state: &HotplugState, candidates: Vec<(Location, Mode, F)>)
where
    F: FnOnce() -> Option<DeviceInfo>,
{
    {
        let mut devices = state.devices.lock().unwrap();
        for device in devices.iter_mut() {
            device.alive = false;
        }
    }

    for (location, mode, resolve) in candidates {
        let known = {
            let mut devices = state.devices.lock().unwrap();
            match devices.iter_mut().find(|d| d.location == location) {
                Some(device) => {
                    device.alive = true;
                    true
                }
                None => false,
            }
        };
        if !known {
            handle_add(state, location, mode, resolve);
        }
    }

    let removed: Vec<TrackedDevice> = {
        let mut devices = state.devices.lock().unwrap();
        let mut kept = Vec::new();
        let mut gone = Vec::new();
        for device in devices.drain(..) {
            if device.alive {
                kept.push(device);
            } else {
                gone.push(device);
            }
        }
        *devices = kept;
        gone
    };
    for device in removed {
        handle_remove(state, device);
    }
}

fn handle_add<F>(state: &HotplugState, location: Location, mode: Mode, resolve: F)
where
    F: FnOnce() -> Option<DeviceInfo>,
{
    let Some(device_info) = resolve() else {
        debug!(location = %location, "could not read identity of new device");
        return;
    };

    info!(location = %location, mode = %mode, "device added");
    state.devices.lock().unwrap().push(TrackedDevice {
        location,
        mode,
        device_info: device_info.clone(),
        alive: true,
    });

    state.dispatch(&DeviceEvent::Add { mode, device_info });
}

fn handle_remove(state: &HotplugState, device: TrackedDevice) {
    info!(location = %device.location, mode = %device.mode, "device removed");
    state.dispatch(&DeviceEvent::Remove {
        mode: device.mode,
        device_info: device.device_info,
    });
}

type Candidate = (Location, Mode, Box<dyn FnOnce() -> Option<DeviceInfo>>);

fn enumerate_candidates() -> Vec<Candidate> {
    let devices = match nusb::list_devices().wait() {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "device enumeration failed");
            return Vec::new();
        }
    };

    devices
        .filter(|d| d.vendor_id() == APPLE_VENDOR_ID && RECOGNISED_PIDS.contains(&d.product_id()))
        .filter_map(|device_info| {
            let mode = Mode::from_pid(device_info.product_id())?;
            let location = format!("{:?}", device_info.id());
            let resolve: Box<dyn FnOnce() -> Option<DeviceInfo>> =
                Box::new(move || resolve_identity(&device_info, mode));
            Some((location, mode, resolve))
        })
        .collect()
}

/// Open the device just long enough to learn who it is. KIS devices need
/// the full enable + info sequence and may take a while to come up.
fn resolve_identity(candidate: &nusb::DeviceInfo, mode: Mode) -> Option<DeviceInfo> {
    if mode == Mode::PortDfu {
        for attempt in 0..KIS_INFO_ATTEMPTS {
            if let Ok(transport) = NusbTransport::open(candidate) {
                let mut sequence = 0u16;
                if kis::enable(&transport, &mut sequence).is_ok()
                    && let Ok((_, mut info)) = kis::load_device_info(&transport, &mut sequence)
                {
                    info.pid = mode.pid();
                    return Some(info);
                }
            }
            debug!(attempt, "KIS identity not ready, backing off");
            thread::sleep(KIS_INFO_BACKOFF);
        }
        warn!("KIS device never answered the info request");
        return None;
    }

    let transport = NusbTransport::open(candidate).ok()?;
    let serial = transport
        .serial_number_index()
        .and_then(|index| transport.get_string_descriptor_ascii(index))
        .ok()?;
    let mut info = DeviceInfo::from_iboot_string(&serial);
    info.pid = mode.pid();
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collecting_state() -> (Arc<Mutex<Vec<DeviceEvent>>>, HotplugState) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let state = HotplugState::new();
        let sink = events.clone();
        state.listeners.lock().unwrap().push(Listener {
            id: 1,
            callback: Box::new(move |event| sink.lock().unwrap().push(event.clone())),
        });
        (events, state)
    }

    fn candidate(
        location: &str,
        mode: Mode,
        ecid: u64,
    ) -> (Location, Mode, impl FnOnce() -> Option<DeviceInfo>) {
        (
            location.to_string(),
            mode,
            move || {
                Some(DeviceInfo {
                    ecid: Some(ecid),
                    pid: mode.pid(),
                    ..Default::default()
                })
            },
        )
    }

    #[test]
    fn test_add_then_remove_ordering() {
        let (events, state) = collecting_state();

        process_sweep(&state, vec![candidate("1-2", Mode::Recovery2, 0xAA)]);
        process_sweep(
            &state,
            Vec::<(Location, Mode, fn() -> Option<DeviceInfo>)>::new(),
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            DeviceEvent::Add {
                mode: Mode::Recovery2,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            DeviceEvent::Remove {
                mode: Mode::Recovery2,
                ..
            }
        ));
    }

    #[test]
    fn test_steady_state_emits_nothing() {
        let (events, state) = collecting_state();

        process_sweep(&state, vec![candidate("1-2", Mode::Dfu, 0xAA)]);
        process_sweep(&state, vec![candidate("1-2", Mode::Dfu, 0xAA)]);
        process_sweep(&state, vec![candidate("1-2", Mode::Dfu, 0xAA)]);

        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(state.devices.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_carries_last_observed_mode() {
        let (events, state) = collecting_state();

        process_sweep(&state, vec![candidate("3-1", Mode::Dfu, 0x11)]);
        process_sweep(
            &state,
            Vec::<(Location, Mode, fn() -> Option<DeviceInfo>)>::new(),
        );

        match &events.lock().unwrap()[1] {
            DeviceEvent::Remove { mode, device_info } => {
                assert_eq!(*mode, Mode::Dfu);
                assert_eq!(device_info.ecid, Some(0x11));
            }
            other => panic!("expected removal, got {other:?}"),
        }
    }

    #[test]
    fn test_readd_is_a_fresh_event() {
        let (events, state) = collecting_state();

        process_sweep(&state, vec![candidate("1-5", Mode::Recovery1, 1)]);
        process_sweep(
            &state,
            Vec::<(Location, Mode, fn() -> Option<DeviceInfo>)>::new(),
        );
        // Same location reappears in a different mode.
        process_sweep(&state, vec![candidate("1-5", Mode::Recovery3, 2)]);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[2],
            DeviceEvent::Add {
                mode: Mode::Recovery3,
                ..
            }
        ));
    }

    #[test]
    fn test_unresolvable_device_is_not_tracked() {
        let (events, state) = collecting_state();

        process_sweep(
            &state,
            vec![("2-9".to_string(), Mode::Dfu, || None::<DeviceInfo>)],
        );

        assert!(events.lock().unwrap().is_empty());
        assert!(state.devices.lock().unwrap().is_empty());
    }

    #[test]
    fn test_two_locations_tracked_independently() {
        let (events, state) = collecting_state();

        process_sweep(
            &state,
            vec![
                candidate("1-1", Mode::Dfu, 1),
                candidate("1-2", Mode::Recovery2, 2),
            ],
        );
        process_sweep(&state, vec![candidate("1-2", Mode::Recovery2, 2)]);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        match &events[2] {
            DeviceEvent::Remove { device_info, .. } => {
                assert_eq!(device_info.ecid, Some(1));
            }
            other => panic!("expected removal, got {other:?}"),
        }
        assert_eq!(state.devices.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_subscribe_unsubscribe_lifecycle() {
        let context = device_event_subscribe(|_event| {}).unwrap();
        assert!(worker_running());

        let second = device_event_subscribe(|_event| {}).unwrap();
        device_event_unsubscribe(second).unwrap();
        assert!(worker_running());

        device_event_unsubscribe(context).unwrap();
        assert!(!worker_running());
        assert!(state().devices.lock().unwrap().is_empty());
    }
}
