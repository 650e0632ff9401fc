//! Bezel input poller.
//!
//! A dedicated thread reads the bezel's EC registers on a fixed cadence,
//! detects rising-edge button presses and slider movement, and pushes the
//! matching trigger-event commands into the action queue. The edge logic
//! lives in [`BezelState`] so it can be exercised without a timer or an
//! EC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::action::ActionQueue;
use crate::ec::manager::{AcpiNamespace, EcManager};
use crate::ec::status::EcStatus;

/// Button state bitmask register in ACPI namespace 0.
pub const REG_BUTTON_STATE: u32 = 0x27;
/// Slider position register (0–255).
pub const REG_SLIDER_POS: u32 = 0x28;
/// Bezel device id register.
pub const REG_DEVICE_ID: u32 = 0xEF;
/// Bezel firmware version register.
pub const REG_FIRMWARE_VERSION: u32 = 0xF6;

/// Event ids fired for button presses, one per bitmask bit.
pub const BUTTON_EVENTS: [u32; 6] = [
    0x0001_0000,
    0x0001_0001,
    0x0001_0002,
    0x0001_0003,
    0x0001_0004,
    0x0001_0005,
];

/// Event id fired when the slider moves.
pub const SLIDER_CHANGED_EVENT: u32 = 0x0002_0002;

/// Device id check interval, in poll ticks (~5 s at the 50 ms cadence).
const PRESENCE_CHECK_TICKS: u32 = 100;

/// Consecutive read failures between log lines.
const FAILURE_LOG_INTERVAL: u32 = 100;

/// Edge detection and presence tracking, independent of timing.
#[derive(Debug)]
pub struct BezelState {
    last_buttons: u8,
    last_slider: u8,
    first_sample: bool,
    present: bool,
    device_id: u8,
}

impl BezelState {
    /// State with no baseline; the first sample only captures one.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_buttons: 0,
            last_slider: 0,
            first_sample: true,
            present: false,
            device_id: 0xFF,
        }
    }

    /// Feeds one (buttons, slider) sample and returns the event ids to
    /// synthesize: one per rising button edge, plus the slider event when
    /// the position moved.
    pub fn process_sample(&mut self, buttons: u8, slider: u8) -> Vec<u32> {
        if self.first_sample {
            self.last_buttons = buttons;
            self.last_slider = slider;
            self.first_sample = false;
            return Vec::new();
        }

        let mut events = Vec::new();

        let pressed = buttons & !self.last_buttons;
        if pressed != 0 {
            for (bit, event_id) in BUTTON_EVENTS.iter().enumerate() {
                if pressed & (1 << bit) != 0 {
                    debug!(
                        button = bit + 1,
                        "button pressed, state {:#04x} -> {:#04x}", self.last_buttons, buttons
                    );
                    events.push(*event_id);
                }
            }
        }
        self.last_buttons = buttons;

        if slider != self.last_slider {
            debug!(from = self.last_slider, to = slider, "slider moved");
            events.push(SLIDER_CHANGED_EVENT);
            self.last_slider = slider;
        }

        events
    }

    /// Feeds a device id sample; returns the new presence when it flipped.
    pub fn process_device_id(&mut self, device_id: u8) -> Option<bool> {
        self.device_id = device_id;
        let present = device_id != 0xFF && device_id != 0x00;
        if present == self.present {
            return None;
        }
        self.present = present;
        Some(present)
    }

    /// Whether the bezel was present at the last check.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.present
    }
}

impl Default for BezelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for the running poller thread.
pub struct BezelPoller {
    stop: Arc<AtomicBool>,
    present: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl BezelPoller {
    /// Starts polling `manager` every `period`, pushing synthesized
    /// events into `queue`.
    #[must_use]
    pub fn start(manager: Arc<EcManager>, queue: Arc<ActionQueue>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let present = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_present = Arc::clone(&present);
        let worker = std::thread::Builder::new()
            .name("patrol-bezel".into())
            .spawn(move || {
                poll_loop(&manager, &queue, period, &thread_stop, &thread_present);
            })
            .ok();
        if worker.is_none() {
            warn!("failed to spawn bezel poller thread");
        }

        Self {
            stop,
            present,
            worker,
        }
    }

    /// Whether the bezel was present at the last device id check.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Relaxed)
    }

    /// Shares the presence flag, updated as the poller tracks the device
    /// id register.
    #[must_use]
    pub fn presence_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.present)
    }

    /// Stops the poller and joins its thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("bezel poller panicked");
            }
        }
    }
}

impl Drop for BezelPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    manager: &EcManager,
    queue: &ActionQueue,
    period: Duration,
    stop: &AtomicBool,
    present: &AtomicBool,
) {
    let mut state = BezelState::new();
    let mut failures: u32 = 0;
    let mut presence_tick: u32 = 0;

    // Initial device probe, before the cadence starts.
    let (status, data) = manager.acpi_read(AcpiNamespace::Ns0, REG_DEVICE_ID, 1);
    if status.is_success() {
        if let Some(&device_id) = data.first() {
            if let Some(now_present) = state.process_device_id(device_id) {
                present.store(now_present, Ordering::Relaxed);
            }
        }
    }
    if state.is_present() {
        let (status, version) = manager.acpi_read(AcpiNamespace::Ns0, REG_FIRMWARE_VERSION, 1);
        if status.is_success() {
            info!(
                device_id = state.device_id,
                firmware = version.first().copied().unwrap_or(0),
                "bezel detected"
            );
        }
    } else {
        info!(device_id = state.device_id, "bezel not detected, polling anyway");
    }

    // Drift-compensated cadence: ticks land on the grid, not on "period
    // after the previous tick finished".
    let mut next_tick = Instant::now() + period;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        }
        next_tick += period;

        let (status, data) = manager.acpi_read(AcpiNamespace::Ns0, REG_BUTTON_STATE, 1);
        let buttons = if status.is_success() {
            data.first().copied()
        } else {
            None
        };
        let Some(buttons) = buttons else {
            failures += 1;
            if failures % FAILURE_LOG_INTERVAL == 1 {
                warn!(%status, failures, "failed to read button state");
            }
            continue;
        };
        failures = 0;

        let (status, slider_data) = manager.acpi_read(AcpiNamespace::Ns0, REG_SLIDER_POS, 1);
        let slider = if status == EcStatus::Success {
            slider_data.first().copied().unwrap_or(state.last_slider)
        } else {
            state.last_slider
        };

        presence_tick += 1;
        if presence_tick >= PRESENCE_CHECK_TICKS {
            presence_tick = 0;
            let (status, data) = manager.acpi_read(AcpiNamespace::Ns0, REG_DEVICE_ID, 1);
            if status.is_success() {
                if let Some(&device_id) = data.first() {
                    if let Some(now_present) = state.process_device_id(device_id) {
                        present.store(now_present, Ordering::Relaxed);
                        info!(
                            device_id,
                            present = now_present,
                            "bezel presence changed"
                        );
                    }
                }
            }
        }

        for event_id in state.process_sample(buttons, slider) {
            let command_id = queue.trigger_event(event_id);
            debug!(event_id, command_id, "bezel event queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::port::PortBus;
    use crate::ec::sim::{Firmware, SimulatedEc};
    use crate::ec::transport::EcTransport;

    #[test]
    fn first_sample_sets_baseline_without_events() {
        let mut state = BezelState::new();
        assert!(state.process_sample(0x3F, 128).is_empty());
        // No change afterwards, still nothing.
        assert!(state.process_sample(0x3F, 128).is_empty());
    }

    #[test]
    fn rising_edge_maps_bit_to_event() {
        let mut state = BezelState::new();
        let _ = state.process_sample(0x00, 0);

        let events = state.process_sample(0x04, 0);
        assert_eq!(events, vec![BUTTON_EVENTS[2]]);

        // Held button is not a new press; release produces nothing.
        assert!(state.process_sample(0x04, 0).is_empty());
        assert!(state.process_sample(0x00, 0).is_empty());
    }

    #[test]
    fn simultaneous_presses_fire_in_bit_order() {
        let mut state = BezelState::new();
        let _ = state.process_sample(0x00, 0);

        let events = state.process_sample(0x21, 0);
        assert_eq!(events, vec![BUTTON_EVENTS[0], BUTTON_EVENTS[5]]);
    }

    #[test]
    fn slider_movement_fires_one_event() {
        let mut state = BezelState::new();
        let _ = state.process_sample(0, 10);

        assert_eq!(state.process_sample(0, 11), vec![SLIDER_CHANGED_EVENT]);
        assert!(state.process_sample(0, 11).is_empty());
    }

    #[test]
    fn presence_flips_only_on_change() {
        let mut state = BezelState::new();
        assert_eq!(state.process_device_id(0xFF), None);
        assert_eq!(state.process_device_id(0x42), Some(true));
        assert_eq!(state.process_device_id(0x42), None);
        assert_eq!(state.process_device_id(0x00), Some(false));
    }

    #[test]
    fn poller_queues_button_press_from_simulated_ec() {
        let (firmware, registers) = Firmware::acpi_registers();
        let ec = SimulatedEc::new(0x220, firmware);
        let transport = EcTransport::new(ec as Arc<dyn PortBus>, 0x220)
            .with_response_timeout(Duration::from_millis(200));
        let manager = Arc::new(EcManager::start(transport));
        let queue = Arc::new(ActionQueue::new());

        let mut poller = BezelPoller::start(
            Arc::clone(&manager),
            Arc::clone(&queue),
            Duration::from_millis(5),
        );

        // Let the poller take its baseline, then press button 3 (bit 2).
        std::thread::sleep(Duration::from_millis(60));
        registers.lock().unwrap()[REG_BUTTON_STATE as usize] = 0x04;
        std::thread::sleep(Duration::from_millis(60));
        poller.stop();

        let pending = queue.take_pending();
        let trigger_ids: Vec<u32> = pending.iter().map(|c| c.event_id).collect();
        assert!(
            trigger_ids.contains(&BUTTON_EVENTS[2]),
            "expected button 3 event in {trigger_ids:?}"
        );
    }
}
