//! Captive configuration portal served from the device's own access point.
//!
//! Routing and form handling live here so the ESP HTTP server and the host
//! simulator answer every request identically. The platform layer only moves
//! bytes between its server and [`ProvisioningPortal::handle`].

pub mod form;
pub mod page;

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use log::{info, warn};
use thiserror::Error;

use crate::{
    config::{
        DeviceConfig, TxPowerProfile, WebhookMethod, AP_CHANNEL, AP_MAX_CONNECTIONS,
        AP_RETRY_DELAY_MS, AP_SSID_PREFIX, TX_POWER_PROFILE,
    },
    platform::Clock,
    state::DeviceState,
    store::{ConfigStore, KeyValueStore},
};

/// Paths operating systems fetch to detect a captive portal. All of them get
/// the configuration page.
pub const CAPTIVE_PROBE_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/connecttest.txt",
    "/redirect",
    "/hotspot-detect.html",
    "/canonical.html",
    "/success.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const SAVE_PATH: &str = "/save";

/// Access point parameters. `None` leaves the radio driver's default in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApSettings {
    pub ssid: String,
    pub channel: Option<u8>,
    pub max_connections: Option<u16>,
    pub tx_power: Option<TxPowerProfile>,
}

impl ApSettings {
    pub fn primary(ssid: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            channel: Some(AP_CHANNEL),
            max_connections: Some(AP_MAX_CONNECTIONS),
            tx_power: Some(TX_POWER_PROFILE),
        }
    }

    pub fn fallback(ssid: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            channel: None,
            max_connections: None,
            tx_power: None,
        }
    }
}

/// Open (no password) access point control.
pub trait SoftAp {
    fn start(&mut self, settings: &ApSettings) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApStartup {
    Started,
    /// The first start failed; the retry with driver defaults worked.
    StartedWithDefaults,
    /// Both attempts failed. The device keeps running without an AP.
    Failed,
}

impl ApStartup {
    pub fn is_running(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// `HookButton-NNNN`, with `NNNN` in `1000..=9999`.
pub fn ap_ssid(random: u32) -> String {
    format!("{AP_SSID_PREFIX}{}", 1_000 + random % 9_000)
}

/// Starts the access point, retrying once with default parameters after
/// [`AP_RETRY_DELAY_MS`].
pub fn start_soft_ap<A: SoftAp, C: Clock>(ap: &mut A, clock: &C, ssid: &str) -> ApStartup {
    match ap.start(&ApSettings::primary(ssid)) {
        Ok(()) => {
            info!("access point `{ssid}` started on channel {AP_CHANNEL}");
            return ApStartup::Started;
        }
        Err(err) => warn!("failed to start access point `{ssid}`: {err:#}"),
    }

    clock.sleep_ms(AP_RETRY_DELAY_MS);

    match ap.start(&ApSettings::fallback(ssid)) {
        Ok(()) => {
            info!("access point `{ssid}` started with default parameters");
            ApStartup::StartedWithDefaults
        }
        Err(err) => {
            warn!("access point retry failed, continuing without portal: {err:#}");
            ApStartup::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalMethod {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct PortalRequest<'a> {
    pub method: PortalMethod,
    /// Request target; a query string, if any, is ignored.
    pub path: &'a str,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub location: Option<String>,
}

impl PortalResponse {
    fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8",
            body,
            location: None,
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
            location: None,
        }
    }

    fn redirect(location: String) -> Self {
        Self {
            status: 302,
            content_type: "text/plain",
            body: String::new(),
            location: Some(location),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            302 => "Found",
            400 => "Bad Request",
            500 => "Internal Server Error",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

/// Builds a configuration from a submitted form. `ssid`, `password` and
/// `webhook` must be present, though they may be empty; the rest fall back to
/// defaults.
pub fn parse_submission(body: &[u8]) -> Result<DeviceConfig, SubmissionError> {
    let fields = form::parse_urlencoded(body);
    let field = |name: &str| {
        fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.trim().to_string())
    };
    let required = |name: &'static str| field(name).ok_or(SubmissionError::MissingField(name));

    Ok(DeviceConfig {
        ssid: required("ssid")?,
        password: required("password")?,
        webhook_url: required("webhook")?,
        webhook_method: field("webhook_method")
            .map(|value| WebhookMethod::parse(&value))
            .unwrap_or_default(),
        webhook_headers: field("webhook_headers").unwrap_or_default(),
        webhook_payload: field("webhook_payload").unwrap_or_default(),
    })
}

/// Request handling state for the configuration portal.
///
/// Shared between the main loop and the HTTP server task, so everything
/// mutable sits behind an atomic or a mutex.
pub struct ProvisioningPortal<S> {
    store: ConfigStore<S>,
    working: Mutex<DeviceConfig>,
    state: Arc<DeviceState>,
    restart_requested: AtomicBool,
    origin: Mutex<String>,
}

impl<S: KeyValueStore> ProvisioningPortal<S> {
    pub fn new(store: ConfigStore<S>, state: Arc<DeviceState>) -> Self {
        let working = store.load();
        Self {
            store,
            working: Mutex::new(working),
            state,
            restart_requested: AtomicBool::new(false),
            origin: Mutex::new("/".to_string()),
        }
    }

    /// Where unknown requests are redirected to, once the AP address is known.
    /// Sets where stray requests are redirected to.
    pub fn set_origin(&self, ip: Ipv4Addr, port: u16) {
        let origin = match port {
            80 => format!("http://{ip}/"),
            port => format!("http://{ip}:{port}/"),
        };
        *self.origin.lock().unwrap_or_else(PoisonError::into_inner) = origin;
    }

    pub fn origin(&self) -> String {
        self.origin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> DeviceConfig {
        self.working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Acquire)
    }

    pub fn handle(&self, request: &PortalRequest<'_>, now_ms: u32) -> PortalResponse {
        let path = request
            .path
            .split_once('?')
            .map_or(request.path, |(path, _)| path);

        match request.method {
            PortalMethod::Get if path == "/" || CAPTIVE_PROBE_PATHS.contains(&path) => {
                self.state.touch(now_ms);
                PortalResponse::html(200, page::config_page(&self.config()))
            }
            PortalMethod::Post if path == SAVE_PATH => {
                self.state.touch(now_ms);
                self.submit(request.body)
            }
            _ => PortalResponse::redirect(self.origin()),
        }
    }

    fn submit(&self, body: &[u8]) -> PortalResponse {
        let config = match parse_submission(body) {
            Ok(config) => config,
            Err(err) => {
                warn!("rejected configuration form: {err}");
                return PortalResponse::text(400, "Missing required fields");
            }
        };

        if let Err(err) = self.store.save(&config) {
            warn!("failed to persist configuration: {err:#}");
            return PortalResponse::text(500, "Failed to save configuration");
        }

        info!(
            "saved configuration for network `{}` (ssid {} chars, password {} chars), webhook {} {}",
            config.ssid,
            config.ssid.chars().count(),
            config.password.chars().count(),
            config.webhook_method.as_str(),
            config.webhook_url
        );

        *self.working.lock().unwrap_or_else(PoisonError::into_inner) = config;
        self.restart_requested.store(true, Ordering::Release);
        PortalResponse::html(200, page::SAVED_PAGE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    fn portal() -> (ProvisioningPortal<MemoryStore>, MemoryStore, Arc<DeviceState>) {
        let backend = MemoryStore::new();
        let state = Arc::new(DeviceState::new(0));
        let portal = ProvisioningPortal::new(ConfigStore::new(backend.clone()), state.clone());
        (portal, backend, state)
    }

    fn get(path: &str) -> PortalRequest<'_> {
        PortalRequest {
            method: PortalMethod::Get,
            path,
            body: &[],
        }
    }

    fn post<'a>(path: &'a str, body: &'a [u8]) -> PortalRequest<'a> {
        PortalRequest {
            method: PortalMethod::Post,
            path,
            body,
        }
    }

    #[test]
    fn root_and_probe_paths_serve_the_form() {
        let (portal, _, _) = portal();
        for path in std::iter::once("/").chain(CAPTIVE_PROBE_PATHS.iter().copied()) {
            let response = portal.handle(&get(path), 10);
            assert_eq!(response.status, 200, "{path}");
            assert!(response.body.contains("action=\"/save\""), "{path}");
        }
    }

    #[test]
    fn query_string_is_ignored_for_routing() {
        let (portal, _, _) = portal();
        let response = portal.handle(&get("/generate_204?x=1"), 0);
        assert_eq!(response.status, 200);
    }

    #[test]
    fn unknown_paths_redirect_to_origin() {
        let (portal, _, state) = portal();
        let response = portal.handle(&get("/favicon.ico"), 500);
        assert_eq!(response.status, 302);
        assert_eq!(response.location.as_deref(), Some("/"));
        assert_eq!(state.last_activity_ms(), 0);

        portal.set_origin(Ipv4Addr::new(192, 168, 4, 1), 80);
        let response = portal.handle(&post("/", b""), 0);
        assert_eq!(response.location.as_deref(), Some("http://192.168.4.1/"));

        portal.set_origin(Ipv4Addr::LOCALHOST, 8080);
        let response = portal.handle(&post("/", b""), 0);
        assert_eq!(response.location.as_deref(), Some("http://127.0.0.1:8080/"));
    }

    #[test]
    fn valid_submission_persists_and_requests_restart() {
        let (portal, backend, state) = portal();
        let body = b"ssid=+Home+&password=secret123&webhook=https%3A%2F%2Fexample.com%2Fhook&webhook_method=post&webhook_headers=X-Key%3A+1&webhook_payload=%7B%7D";

        let response = portal.handle(&post("/save", body), 7_000);

        assert_eq!(response.status, 200);
        assert!(response.body.contains("Configuration Saved"));
        assert!(portal.restart_requested());
        assert_eq!(state.last_activity_ms(), 7_000);

        let saved = ConfigStore::new(backend).load();
        assert_eq!(
            saved,
            DeviceConfig {
                ssid: "Home".to_string(),
                password: "secret123".to_string(),
                webhook_url: "https://example.com/hook".to_string(),
                webhook_method: WebhookMethod::Post,
                webhook_headers: "X-Key: 1".to_string(),
                webhook_payload: "{}".to_string(),
            }
        );
        assert_eq!(portal.config(), saved);
    }

    #[test]
    fn optional_fields_default() {
        let config = parse_submission(b"ssid=a&password=b&webhook=c").unwrap();
        assert_eq!(config.webhook_method, WebhookMethod::Get);
        assert_eq!(config.webhook_headers, "");
        assert_eq!(config.webhook_payload, "");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        for body in [
            &b"ssid=Home&password=secret123"[..],
            &b"ssid=Home&webhook=x"[..],
            &b"password=secret123&webhook=x"[..],
            &b""[..],
        ] {
            let (portal, backend, state) = portal();
            let response = portal.handle(&post("/save", body), 42);

            assert_eq!(response.status, 400);
            assert_eq!(response.content_type, "text/plain");
            assert_eq!(response.body, "Missing required fields");
            assert!(!portal.restart_requested());
            assert!(backend.is_empty());
            assert_eq!(state.last_activity_ms(), 42);
        }
    }

    #[test]
    fn blank_required_fields_are_saved_as_empty() {
        let (portal, backend, _state) = portal();

        let response = portal.handle(&post("/save", b"ssid=+++&password=&webhook="), 0);

        assert_eq!(response.status, 200);
        assert!(portal.restart_requested());
        let saved = ConfigStore::new(backend).load();
        assert_eq!(saved.ssid, "");
        assert_eq!(saved.credentials(), None);
    }

    #[test]
    fn submission_error_names_the_field() {
        assert_eq!(
            parse_submission(b"ssid=a&webhook=c"),
            Err(SubmissionError::MissingField("password"))
        );
    }

    #[test]
    fn store_failure_is_a_server_error_without_restart() {
        struct ReadOnly;
        impl KeyValueStore for ReadOnly {
            fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
                Ok(None)
            }
            fn put(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
                anyhow::bail!("flash is read-only")
            }
        }

        let state = Arc::new(DeviceState::new(0));
        let portal = ProvisioningPortal::new(ConfigStore::new(ReadOnly), state);
        let response = portal.handle(&post("/save", b"ssid=a&password=b&webhook=c"), 0);

        assert_eq!(response.status, 500);
        assert!(!portal.restart_requested());
        assert_eq!(portal.config(), DeviceConfig::default());
    }

    #[test]
    fn page_view_refreshes_activity() {
        let (portal, _, state) = portal();
        portal.handle(&get("/"), 1_234);
        assert_eq!(state.last_activity_ms(), 1_234);
    }

    #[test]
    fn ap_ssid_is_four_digits() {
        assert_eq!(ap_ssid(0), "HookButton-1000");
        assert_eq!(ap_ssid(8_999), "HookButton-9999");
        assert_eq!(ap_ssid(9_000), "HookButton-1000");
        assert_eq!(ap_ssid(u32::MAX).len(), "HookButton-".len() + 4);
    }

    #[derive(Clone, Default)]
    struct VirtualClock {
        now: Rc<Cell<u32>>,
    }

    impl Clock for VirtualClock {
        fn now_ms(&self) -> u32 {
            self.now.get()
        }

        fn sleep_ms(&self, ms: u32) {
            self.now.set(self.now.get() + ms);
        }
    }

    struct FlakyAp {
        failures: usize,
        attempts: Vec<ApSettings>,
    }

    impl SoftAp for FlakyAp {
        fn start(&mut self, settings: &ApSettings) -> anyhow::Result<()> {
            self.attempts.push(settings.clone());
            if self.attempts.len() <= self.failures {
                anyhow::bail!("radio not ready");
            }
            Ok(())
        }
    }

    #[test]
    fn ap_starts_first_time() {
        let mut ap = FlakyAp {
            failures: 0,
            attempts: Vec::new(),
        };
        let clock = VirtualClock::default();
        assert_eq!(start_soft_ap(&mut ap, &clock, "HookButton-1234"), ApStartup::Started);
        assert_eq!(ap.attempts, vec![ApSettings::primary("HookButton-1234")]);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn ap_retries_once_with_defaults() {
        let mut ap = FlakyAp {
            failures: 1,
            attempts: Vec::new(),
        };
        let clock = VirtualClock::default();
        let startup = start_soft_ap(&mut ap, &clock, "HookButton-1234");

        assert_eq!(startup, ApStartup::StartedWithDefaults);
        assert_eq!(ap.attempts[1], ApSettings::fallback("HookButton-1234"));
        assert_eq!(clock.now_ms(), AP_RETRY_DELAY_MS);
    }

    #[test]
    fn ap_gives_up_after_retry() {
        let mut ap = FlakyAp {
            failures: 5,
            attempts: Vec::new(),
        };
        let startup = start_soft_ap(&mut ap, &VirtualClock::default(), "HookButton-1234");

        assert_eq!(startup, ApStartup::Failed);
        assert!(!startup.is_running());
        assert_eq!(ap.attempts.len(), 2);
    }
}
