use std::sync::Arc;

use anyhow::bail;
use log::{info, warn};

use crate::{
    config::{
        DeviceConfig, LINK_LOSS_RECONNECT_MS, LOOP_TICK_MS, RESTART_FLUSH_DELAY_MS,
        TX_POWER_PROFILE,
    },
    connectivity::{ConnectionState, ConnectivityManager, WifiStation},
    platform::{Board, Clock},
    power::PowerManager,
    provisioning::{ap_ssid, ProvisioningPortal},
    state::DeviceState,
    store::ConfigStore,
    types::{BootExit, OperatingMode, WakeCause},
    webhook::WebhookDispatcher,
};

/// Result of running one operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next(OperatingMode),
    Exit(BootExit),
}

/// Mode a boot starts in. A held button or missing credentials go straight
/// to the portal.
pub fn select_boot_mode(config: &DeviceConfig, button_held: bool) -> OperatingMode {
    if button_held {
        info!("button held at boot, forcing provisioning");
        return OperatingMode::Provisioning;
    }
    if config.credentials().is_none() {
        info!("no saved wifi credentials");
        return OperatingMode::Provisioning;
    }
    OperatingMode::Connecting
}

/// Drives one boot of the device, from wake to restart or deep sleep.
pub struct Firmware<B: Board> {
    board: B,
    store: ConfigStore<B::Store>,
    state: Arc<DeviceState>,
    config: DeviceConfig,
    connectivity: ConnectivityManager,
    dispatcher: WebhookDispatcher,
    power: PowerManager,
}

impl<B: Board> Firmware<B> {
    /// `state` must be the same instance the button interrupt writes to.
    pub fn new(board: B, store: ConfigStore<B::Store>, state: Arc<DeviceState>) -> Self {
        Self {
            board,
            store,
            state,
            config: DeviceConfig::default(),
            connectivity: ConnectivityManager::new(TX_POWER_PROFILE),
            dispatcher: WebhookDispatcher::new(),
            power: PowerManager::default(),
        }
    }

    pub fn with_power(mut self, power: PowerManager) -> Self {
        self.power = power;
        self
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    pub fn boot(&mut self, wake: WakeCause, button_held: bool) -> anyhow::Result<BootExit> {
        self.power.on_wake(wake, &self.state);
        self.state.touch(self.board.clock().now_ms());

        self.config = self.store.load();
        info!(
            "loaded config: ssid `{}` ({} chars), password {} chars, webhook {} `{}`",
            self.config.ssid,
            self.config.ssid.chars().count(),
            self.config.password.chars().count(),
            self.config.webhook_method.as_str(),
            self.config.webhook_url
        );

        let mut mode = select_boot_mode(&self.config, button_held);
        info!("boot mode: {}", mode.as_str());

        loop {
            let step = match mode {
                OperatingMode::Provisioning => self.run_provisioning(),
                OperatingMode::Connecting => self.run_connecting(),
                OperatingMode::Operational => self.run_operational(),
            };

            match step {
                Step::Exit(exit) => {
                    info!("leaving {} with {exit:?}", mode.as_str());
                    return Ok(exit);
                }
                Step::Next(next) if mode.can_transition_to(next) => {
                    info!("mode {} -> {}", mode.as_str(), next.as_str());
                    mode = next;
                }
                Step::Next(next) => {
                    bail!("illegal mode transition {} -> {}", mode.as_str(), next.as_str())
                }
            }
        }
    }

    fn run_provisioning(&mut self) -> Step {
        let clock = self.board.clock();
        let ssid = ap_ssid(self.board.random_u32());
        let portal = Arc::new(ProvisioningPortal::new(
            self.store.clone(),
            self.state.clone(),
        ));

        match self.board.start_portal(&ssid, portal.clone()) {
            Ok(startup) if startup.is_running() => {
                info!("provisioning portal up on `{ssid}` ({startup:?})");
            }
            Ok(startup) => warn!("access point unavailable ({startup:?}), portal unreachable"),
            Err(err) => warn!("failed to start provisioning portal: {err:#}"),
        }

        loop {
            if portal.restart_requested() {
                info!("configuration saved, restarting");
                clock.sleep_ms(RESTART_FLUSH_DELAY_MS);
                return Step::Exit(BootExit::Restart);
            }
            clock.sleep_ms(LOOP_TICK_MS);
        }
    }

    fn run_connecting(&mut self) -> Step {
        match self.connect_station() {
            ConnectionState::Connected => Step::Next(OperatingMode::Operational),
            state => {
                warn!("wifi {}, falling back to provisioning", state.as_str());
                Step::Next(OperatingMode::Provisioning)
            }
        }
    }

    /// Runs the connection cycles with the saved credentials. Button state is
    /// untouched, so presses queued meanwhile survive a successful reconnect.
    fn connect_station(&mut self) -> ConnectionState {
        let Some(credentials) = self.config.credentials() else {
            return ConnectionState::Failed;
        };

        let clock = self.board.clock();
        self.connectivity
            .connect(self.board.station(), &clock, &credentials)
    }

    fn run_operational(&mut self) -> Step {
        let clock = self.board.clock();
        let mut link_lost_since: Option<u32> = None;
        info!(
            "operational, {} press(es) pending, sleeping after {} s idle",
            self.state.pending(),
            self.power.idle_timeout_ms() / 1000
        );

        loop {
            let now = clock.now_ms();

            if self.board.station().is_connected() {
                if link_lost_since.take().is_some() {
                    info!("wifi link restored");
                }

                self.dispatcher.poll(
                    &self.state,
                    &self.config,
                    self.board.transport(),
                    &clock,
                );

                if self.power.should_sleep(&self.state, clock.now_ms()) {
                    if self.power.prepare_sleep(&mut self.board, &self.state) {
                        return Step::Exit(BootExit::DeepSleep);
                    }
                    // Start a fresh idle window before trying again.
                    self.state.touch(clock.now_ms());
                }
            } else {
                let since = *link_lost_since.get_or_insert_with(|| {
                    warn!("wifi link lost, holding {} queued press(es)", self.state.pending());
                    now
                });
                if now.wrapping_sub(since) >= LINK_LOSS_RECONNECT_MS {
                    warn!(
                        "wifi down for {} s, reconnecting",
                        LINK_LOSS_RECONNECT_MS / 1000
                    );
                    link_lost_since = None;
                    if self.connect_station() != ConnectionState::Connected {
                        warn!(
                            "wifi unrecoverable, falling back to provisioning with {} press(es) queued",
                            self.state.pending()
                        );
                        return Step::Next(OperatingMode::Provisioning);
                    }
                    info!("wifi reconnected, {} press(es) pending", self.state.pending());
                    continue;
                }
            }

            clock.sleep_ms(LOOP_TICK_MS);
        }
    }
}
