/// Minimum spacing between two accepted button edges.
pub const DEBOUNCE_WINDOW_MS: u32 = 300;

/// Full station connection cycles before falling back to provisioning.
pub const CONNECT_CYCLES: u8 = 3;
/// Status polls per connection cycle.
pub const CONNECT_POLLS_PER_CYCLE: u8 = 10;
pub const CONNECT_POLL_INTERVAL_MS: u32 = 1_000;
/// Delay after the forced disconnect at the start of every cycle.
pub const DISCONNECT_SETTLE_MS: u32 = 1_000;
/// Pause between failed cycles; skipped after the last one.
pub const CONNECT_CYCLE_BACKOFF_MS: u32 = 3_000;

/// Radio transmit power used for both station and access point.
pub const TX_POWER_PROFILE: TxPowerProfile = TxPowerProfile::Low;

pub const AP_SSID_PREFIX: &str = "HookButton-";
pub const AP_CHANNEL: u8 = 1;
pub const AP_MAX_CONNECTIONS: u16 = 4;
pub const AP_RETRY_DELAY_MS: u32 = 1_000;

/// Idle time in operational mode before entering deep sleep.
pub const IDLE_TIMEOUT_MS: u32 = 60_000;
pub const LOOP_TICK_MS: u32 = 100;
/// Wait after boot before the button level is sampled, so the press that
/// woke the device has been released.
pub const BOOT_SETTLE_MS: u32 = 1_000;
/// Grace period for the portal response to reach the client before restarting.
pub const RESTART_FLUSH_DELAY_MS: u32 = 1_000;
/// Continuous station link loss tolerated in operational mode before the
/// connection cycles are run again.
pub const LINK_LOSS_RECONNECT_MS: u32 = 10_000;

pub const WEBHOOK_TIMEOUT_MS: u32 = 15_000;
pub const WEBHOOK_MAX_RESPONSE_BODY: usize = 1_024;

/// Transmit power options for the radio.
///
/// `Low` exists for boards whose ceramic antenna sits too close to the
/// crystal; they fail to associate at full power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPowerProfile {
    Low,
    Max,
}

impl TxPowerProfile {
    pub fn dbm(self) -> f32 {
        match self {
            Self::Low => 8.5,
            Self::Max => 19.5,
        }
    }

    /// Value in the 0.25 dBm units used by the radio driver.
    pub fn quarter_dbm(self) -> i8 {
        match self {
            Self::Low => 34,
            Self::Max => 78,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookMethod {
    #[default]
    Get,
    Post,
}

impl WebhookMethod {
    /// Anything other than a case-insensitive `POST` is treated as `GET`.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("POST") {
            Self::Post
        } else {
            Self::Get
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub ssid: String,
    pub password: String,
    pub webhook_url: String,
    pub webhook_method: WebhookMethod,
    pub webhook_headers: String,
    pub webhook_payload: String,
}

impl DeviceConfig {
    pub fn trim(&mut self) {
        trim_in_place(&mut self.ssid);
        trim_in_place(&mut self.password);
        trim_in_place(&mut self.webhook_url);
        trim_in_place(&mut self.webhook_headers);
        trim_in_place(&mut self.webhook_payload);
    }

    pub fn trimmed(mut self) -> Self {
        self.trim();
        self
    }

    /// Station credentials, present only when both SSID and password are set.
    pub fn credentials(&self) -> Option<Credentials> {
        let ssid = self.ssid.trim();
        let password = self.password.trim();
        if ssid.is_empty() || password.is_empty() {
            return None;
        }

        Some(Credentials {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    pub fn has_webhook(&self) -> bool {
        !self.webhook_url.trim().is_empty()
    }
}

fn trim_in_place(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}
