use log::{info, warn};

use crate::{
    config::IDLE_TIMEOUT_MS,
    platform::SleepControl,
    state::DeviceState,
    types::WakeCause,
};

/// Idle tracking and the hand-over into deep sleep.
#[derive(Debug, Clone)]
pub struct PowerManager {
    idle_timeout_ms: u32,
}

impl Default for PowerManager {
    fn default() -> Self {
        Self::new(IDLE_TIMEOUT_MS)
    }
}

impl PowerManager {
    pub fn new(idle_timeout_ms: u32) -> Self {
        Self { idle_timeout_ms }
    }

    pub fn idle_timeout_ms(&self) -> u32 {
        self.idle_timeout_ms
    }

    /// Rebuilds the volatile state that depends on why the device booted.
    /// The press that woke the device is queued so it still fires a webhook.
    pub fn on_wake(&self, cause: WakeCause, state: &DeviceState) {
        info!("wake cause: {}", cause.as_str());
        if cause == WakeCause::ButtonWake {
            let pending = state.push_press();
            info!("woken by button press, {pending} press(es) pending");
        }
    }

    pub fn should_sleep(&self, state: &DeviceState, now_ms: u32) -> bool {
        !state.in_flight()
            && state.pending() == 0
            && state.idle_for(now_ms) >= self.idle_timeout_ms
    }

    /// Moves the button from the interrupt over to the deep-sleep wake source.
    ///
    /// Returns `false` and leaves the interrupt attached if a press was queued
    /// before the interrupt was detached, or if the wake source could not be
    /// armed; the caller must keep running.
    pub fn prepare_sleep<P: SleepControl>(&self, platform: &mut P, state: &DeviceState) -> bool {
        platform.detach_button_interrupt();

        if state.pending() > 0 {
            info!("press arrived while preparing for sleep, staying awake");
            if let Err(err) = platform.attach_button_interrupt() {
                warn!("failed to re-attach button interrupt: {err:#}");
            }
            return false;
        }

        if let Err(err) = platform.arm_button_wake() {
            warn!("failed to arm button wake, staying awake: {err:#}");
            if let Err(err) = platform.attach_button_interrupt() {
                warn!("failed to re-attach button interrupt: {err:#}");
            }
            return false;
        }

        info!("entering deep sleep, press the button to wake");
        platform.flush_diagnostics();
        true
    }
}
