use std::sync::Arc;

use crate::{
    connectivity::WifiStation,
    provisioning::{ApStartup, ProvisioningPortal},
    store::KeyValueStore,
    webhook::WebhookTransport,
};

/// Monotonic millisecond clock that wraps at `u32::MAX`.
pub trait Clock: Clone {
    fn now_ms(&self) -> u32;
    fn sleep_ms(&self, ms: u32);
}

/// Steps needed to hand the button line over from the interrupt to the
/// deep-sleep wake logic.
pub trait SleepControl {
    fn detach_button_interrupt(&mut self);
    fn attach_button_interrupt(&mut self) -> anyhow::Result<()>;
    /// Wake from deep sleep while the button line is held low.
    fn arm_button_wake(&mut self) -> anyhow::Result<()>;
    fn flush_diagnostics(&mut self);
}

/// Everything the firmware needs from the hardware it runs on.
pub trait Board: SleepControl {
    type Clock: Clock;
    type Station: WifiStation;
    type Transport: WebhookTransport;
    type Store: KeyValueStore + Clone;

    fn clock(&self) -> Self::Clock;
    fn station(&mut self) -> &mut Self::Station;
    fn transport(&mut self) -> &mut Self::Transport;
    fn random_u32(&mut self) -> u32;

    /// Brings up the access point, the captive DNS responder and the portal
    /// HTTP server. The servers keep running until the boot ends.
    fn start_portal(
        &mut self,
        ap_ssid: &str,
        portal: Arc<ProvisioningPortal<Self::Store>>,
    ) -> anyhow::Result<ApStartup>;
}
