pub mod button;
pub mod config;
pub mod connectivity;
pub mod dns;
pub mod firmware;
pub mod platform;
pub mod power;
pub mod provisioning;
pub mod state;
pub mod store;
pub mod types;
pub mod webhook;

pub use button::ButtonMonitor;
pub use config::{Credentials, DeviceConfig, TxPowerProfile, WebhookMethod};
pub use connectivity::{ConnectionState, ConnectivityManager, WifiStation};
pub use firmware::{select_boot_mode, Firmware, Step};
pub use platform::{Board, Clock, SleepControl};
pub use power::PowerManager;
pub use provisioning::{
    ApSettings, ApStartup, PortalMethod, PortalRequest, PortalResponse, ProvisioningPortal,
    SoftAp,
};
pub use state::DeviceState;
pub use store::{ConfigStore, KeyValueStore, MemoryStore};
pub use types::{BootExit, OperatingMode, WakeCause};
pub use webhook::{
    DispatchOutcome, WebhookDispatcher, WebhookError, WebhookRequest, WebhookResponse,
    WebhookTransport,
};
