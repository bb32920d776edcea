use log::{info, warn};

use crate::{
    config::{
        Credentials, TxPowerProfile, CONNECT_CYCLES, CONNECT_CYCLE_BACKOFF_MS,
        CONNECT_POLLS_PER_CYCLE, CONNECT_POLL_INTERVAL_MS, DISCONNECT_SETTLE_MS,
    },
    platform::Clock,
};

/// Station-mode radio control.
pub trait WifiStation {
    fn disconnect(&mut self) -> anyhow::Result<()>;
    fn set_tx_power(&mut self, profile: TxPowerProfile) -> anyhow::Result<()>;
    /// Starts associating with the network. Must not wait for the result.
    fn begin(&mut self, credentials: &Credentials) -> anyhow::Result<()>;
    fn is_connected(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting { cycle: u8 },
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting { .. } => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
        }
    }
}

/// Bounded, fixed-interval station connection.
///
/// Worst case before giving up is
/// `CONNECT_CYCLES * (DISCONNECT_SETTLE_MS + CONNECT_POLLS_PER_CYCLE * CONNECT_POLL_INTERVAL_MS)`
/// plus the backoff between cycles.
#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    state: ConnectionState,
    tx_power: TxPowerProfile,
}

impl ConnectivityManager {
    pub fn new(tx_power: TxPowerProfile) -> Self {
        Self {
            state: ConnectionState::Idle,
            tx_power,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect<W: WifiStation, C: Clock>(
        &mut self,
        station: &mut W,
        clock: &C,
        credentials: &Credentials,
    ) -> ConnectionState {
        info!("connecting to wifi `{}`", credentials.ssid);

        for cycle in 1..=CONNECT_CYCLES {
            self.state = ConnectionState::Connecting { cycle };
            info!("wifi connection cycle {cycle}/{CONNECT_CYCLES}");

            if self.run_cycle(station, clock, credentials) {
                info!("wifi connected on cycle {cycle}");
                self.state = ConnectionState::Connected;
                return self.state;
            }

            warn!("wifi connection cycle {cycle}/{CONNECT_CYCLES} failed");
            if cycle < CONNECT_CYCLES {
                clock.sleep_ms(CONNECT_CYCLE_BACKOFF_MS);
            }
        }

        warn!("all {CONNECT_CYCLES} wifi connection cycles failed");
        self.state = ConnectionState::Failed;
        self.state
    }

    fn run_cycle<W: WifiStation, C: Clock>(
        &self,
        station: &mut W,
        clock: &C,
        credentials: &Credentials,
    ) -> bool {
        if let Err(err) = station.disconnect() {
            warn!("wifi disconnect before connecting failed: {err:#}");
        }
        clock.sleep_ms(DISCONNECT_SETTLE_MS);

        if let Err(err) = station.set_tx_power(self.tx_power) {
            warn!(
                "failed to set wifi tx power to {} dBm: {err:#}",
                self.tx_power.dbm()
            );
        }

        if let Err(err) = station.begin(credentials) {
            warn!("wifi connect request rejected: {err:#}");
            return false;
        }

        for poll in 1..=CONNECT_POLLS_PER_CYCLE {
            clock.sleep_ms(CONNECT_POLL_INTERVAL_MS);
            if station.is_connected() {
                return true;
            }
            if poll % 3 == 1 {
                info!("wifi status poll {poll}/{CONNECT_POLLS_PER_CYCLE}: not connected");
            }
        }

        false
    }
}
