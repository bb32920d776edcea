//! Desktop simulator of the button. The firmware runs unchanged on a plain
//! thread; presses are typed on stdin and the portal is served over real
//! sockets on localhost.

use std::{
    collections::BTreeMap,
    io::{ErrorKind, Read as _},
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use rand_core::{OsRng, TryRngCore};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, UdpSocket},
    runtime::Handle,
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hookbutton_common::{
    config::{
        Credentials, TxPowerProfile, BOOT_SETTLE_MS, WEBHOOK_MAX_RESPONSE_BODY, WEBHOOK_TIMEOUT_MS,
    },
    dns,
    provisioning::{start_soft_ap, ApSettings, SoftAp},
    ApStartup, Board, BootExit, ButtonMonitor, Clock, ConfigStore, DeviceState, Firmware,
    KeyValueStore, PortalMethod, PortalRequest, ProvisioningPortal, SleepControl, WakeCause,
    WebhookError, WebhookMethod, WebhookRequest, WebhookResponse, WebhookTransport, WifiStation,
};

const DNS_PACKET_SIZE: usize = 512;

struct HostSettings {
    store_path: PathBuf,
    http_port: u16,
    dns_port: u16,
    hold_button_at_boot: bool,
    simulate_wifi_failure: bool,
}

impl HostSettings {
    fn from_env() -> Self {
        Self {
            store_path: std::env::var("HOOKBUTTON_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.hookbutton/store.json")),
            http_port: env_port("PORTAL_HTTP_PORT", 8080),
            dns_port: env_port("PORTAL_DNS_PORT", 5353),
            hold_button_at_boot: env_flag("HOLD_BUTTON_AT_BOOT"),
            simulate_wifi_failure: env_flag("SIMULATE_WIFI_FAILURE"),
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::trim),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    info!(
        "hookbutton simulator, store {}, press enter to push the button",
        settings.store_path.display()
    );

    let clock = HostClock::new();
    let button = Arc::new(ButtonBus::default());
    tokio::spawn(read_presses(button.clone(), clock.clone()));

    // The firmware blocks; it gets its own thread so the runtime stays free
    // for the portal servers and stdin.
    let runtime = Handle::current();
    let (done_tx, done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("firmware".into())
        .spawn(move || {
            let result = run_device(settings, clock, button, runtime);
            let _ = done_tx.send(result);
        })
        .context("failed to spawn firmware thread")?;

    tokio::select! {
        result = done_rx => result.context("firmware thread exited without a result")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

/// Boots the device over and over, the way the chip does after a restart or a
/// wake from deep sleep.
fn run_device(
    settings: HostSettings,
    clock: HostClock,
    button: Arc<ButtonBus>,
    runtime: Handle,
) -> anyhow::Result<()> {
    let store = FileStore::new(settings.store_path.clone());
    let mut wake = WakeCause::ColdBoot;
    let mut hold_button = settings.hold_button_at_boot;

    loop {
        info!("booting, wake cause {}", wake.as_str());
        clock.sleep_ms(BOOT_SETTLE_MS);

        let state = Arc::new(DeviceState::new(clock.now_ms()));
        button.clear_wake();
        button.attach_monitor(Arc::new(ButtonMonitor::new(state.clone())));

        let board = HostBoard {
            clock: clock.clone(),
            radio: HostRadio {
                fail_association: settings.simulate_wifi_failure,
                associated: false,
            },
            transport: HostTransport::new()?,
            button: button.clone(),
            runtime: runtime.clone(),
            http_port: settings.http_port,
            dns_port: settings.dns_port,
            portal_tasks: PortalTasks::default(),
        };

        let mut firmware = Firmware::new(board, ConfigStore::new(store.clone()), state);
        let exit = firmware.boot(wake, std::mem::take(&mut hold_button))?;
        // Drops the board, which stops the portal servers.
        drop(firmware);
        button.set_attached(false);

        wake = match exit {
            BootExit::Restart => {
                info!("restarting");
                WakeCause::ColdBoot
            }
            BootExit::DeepSleep => {
                info!("sleeping until the next press");
                button.wait_for_wake();
                WakeCause::ButtonWake
            }
        };
    }
}

async fn read_presses(button: Arc<ButtonBus>, clock: HostClock) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(_)) => button.press(clock.now_ms()),
            Ok(None) => {
                debug!("stdin closed, no more presses");
                return;
            }
            Err(err) => {
                warn!("failed to read stdin: {err}");
                return;
            }
        }
    }
}

#[derive(Clone)]
struct HostClock {
    start: Instant,
}

impl HostClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for HostClock {
    fn now_ms(&self) -> u32 {
        // Truncation wraps the same way the device uptime counter does.
        self.start.elapsed().as_millis() as u32
    }

    fn sleep_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}

/// Stands in for the GPIO line. While the interrupt is attached presses go to
/// the debounce monitor; otherwise they count as a deep-sleep wake.
#[derive(Default)]
struct ButtonBus {
    monitor: Mutex<Option<Arc<ButtonMonitor>>>,
    attached: AtomicBool,
    wake_pending: Mutex<bool>,
    woke: Condvar,
}

impl ButtonBus {
    fn attach_monitor(&self, monitor: Arc<ButtonMonitor>) {
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
        self.set_attached(true);
    }

    fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }

    fn press(&self, now_ms: u32) {
        if self.attached.load(Ordering::Acquire) {
            let monitor = self
                .monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(monitor) = monitor {
                if monitor.on_falling_edge(now_ms) {
                    info!("button pressed, {} pending", monitor.state().pending());
                } else {
                    debug!("press ignored as bounce");
                }
                return;
            }
        }

        *self
            .wake_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.woke.notify_all();
    }

    /// Forgets presses that landed while no boot was listening.
    fn clear_wake(&self) {
        *self
            .wake_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn wait_for_wake(&self) {
        let mut pending = self
            .wake_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*pending {
            pending = self
                .woke
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *pending = false;
    }
}

#[derive(Default, Serialize, Deserialize)]
#[serde(transparent)]
struct StoreDocument {
    entries: BTreeMap<String, String>,
}

/// Key/value store kept as a single JSON document on disk.
#[derive(Clone)]
struct FileStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn read_document(&self) -> anyhow::Result<StoreDocument> {
        let bytes = match std::fs::read(self.path.as_ref()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(StoreDocument::default()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read store {}", self.path.display())
                })
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse store {}", self.path.display()))
    }

    fn write_document(&self, document: &StoreDocument) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }
        let bytes = serde_json::to_vec_pretty(document).context("failed to encode store")?;
        std::fs::write(self.path.as_ref(), bytes)
            .with_context(|| format!("failed to write store {}", self.path.display()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_document()?.entries.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.read_document()?;
        document.entries.insert(key.to_string(), value.to_string());
        self.write_document(&document)
    }
}

/// Pretends to be the radio. Joining succeeds unless told otherwise.
struct HostRadio {
    fail_association: bool,
    associated: bool,
}

impl WifiStation for HostRadio {
    fn disconnect(&mut self) -> anyhow::Result<()> {
        self.associated = false;
        Ok(())
    }

    fn set_tx_power(&mut self, profile: TxPowerProfile) -> anyhow::Result<()> {
        debug!("tx power {} dBm", profile.dbm());
        Ok(())
    }

    fn begin(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        info!("joining `{}`", credentials.ssid);
        self.associated = !self.fail_association;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.associated
    }
}

impl SoftAp for HostRadio {
    fn start(&mut self, settings: &ApSettings) -> anyhow::Result<()> {
        self.associated = false;
        info!(
            "simulated access point `{}` (channel {:?}, max {:?} clients)",
            settings.ssid, settings.channel, settings.max_connections
        );
        Ok(())
    }
}

struct HostTransport {
    client: reqwest::blocking::Client,
}

impl HostTransport {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_millis(WEBHOOK_TIMEOUT_MS.into()))
            .build()
            .context("failed to build webhook client")?;
        Ok(Self { client })
    }
}

impl WebhookTransport for HostTransport {
    fn send(&mut self, request: &WebhookRequest) -> Result<WebhookResponse, WebhookError> {
        let method = match request.method {
            WebhookMethod::Get => reqwest::Method::GET,
            WebhookMethod::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(classify)?;
        let status = response.status().as_u16();
        let mut body = Vec::new();
        response
            .take(WEBHOOK_MAX_RESPONSE_BODY as u64)
            .read_to_end(&mut body)
            .map_err(|err| WebhookError::Transport(err.to_string()))?;

        Ok(WebhookResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

fn classify(err: reqwest::Error) -> WebhookError {
    if err.is_timeout() {
        WebhookError::Timeout
    } else {
        WebhookError::Transport(err.to_string())
    }
}

/// Portal server tasks, stopped when the boot that started them ends.
#[derive(Default)]
struct PortalTasks(Vec<JoinHandle<()>>);

impl Drop for PortalTasks {
    fn drop(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

struct HostBoard {
    clock: HostClock,
    radio: HostRadio,
    transport: HostTransport,
    button: Arc<ButtonBus>,
    runtime: Handle,
    http_port: u16,
    dns_port: u16,
    portal_tasks: PortalTasks,
}

impl SleepControl for HostBoard {
    fn detach_button_interrupt(&mut self) {
        self.button.set_attached(false);
    }

    fn attach_button_interrupt(&mut self) -> anyhow::Result<()> {
        self.button.set_attached(true);
        Ok(())
    }

    fn arm_button_wake(&mut self) -> anyhow::Result<()> {
        // Presses on the detached line already count as wakes.
        Ok(())
    }

    fn flush_diagnostics(&mut self) {}
}

impl Board for HostBoard {
    type Clock = HostClock;
    type Station = HostRadio;
    type Transport = HostTransport;
    type Store = FileStore;

    fn clock(&self) -> HostClock {
        self.clock.clone()
    }

    fn station(&mut self) -> &mut HostRadio {
        &mut self.radio
    }

    fn transport(&mut self) -> &mut HostTransport {
        &mut self.transport
    }

    fn random_u32(&mut self) -> u32 {
        OsRng
            .try_next_u32()
            .unwrap_or_else(|_| self.clock.now_ms())
    }

    fn start_portal(
        &mut self,
        ap_ssid: &str,
        portal: Arc<ProvisioningPortal<FileStore>>,
    ) -> anyhow::Result<ApStartup> {
        let startup = start_soft_ap(&mut self.radio, &self.clock, ap_ssid);
        if !startup.is_running() {
            return Ok(startup);
        }

        let ip = Ipv4Addr::LOCALHOST;
        portal.set_origin(ip, self.http_port);
        info!("portal reachable at {}", portal.origin());

        let app = Router::new().fallback(portal_handler).with_state(PortalApp {
            portal,
            clock: self.clock.clone(),
        });

        let _guard = self.runtime.enter();
        let http_addr = SocketAddr::from((ip, self.http_port));
        let listener = std::net::TcpListener::bind(http_addr)
            .with_context(|| format!("failed to bind portal on {http_addr}"))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        self.portal_tasks.0.push(self.runtime.spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("portal server stopped: {err}");
            }
        }));

        let dns_addr = SocketAddr::from((ip, self.dns_port));
        let socket = std::net::UdpSocket::bind(dns_addr)
            .with_context(|| format!("failed to bind dns responder on {dns_addr}"))?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        self.portal_tasks
            .0
            .push(self.runtime.spawn(answer_dns(socket, ip)));

        Ok(startup)
    }
}

#[derive(Clone)]
struct PortalApp {
    portal: Arc<ProvisioningPortal<FileStore>>,
    clock: HostClock,
}

async fn portal_handler(
    State(app): State<PortalApp>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let method = if method == Method::GET {
        PortalMethod::Get
    } else if method == Method::POST {
        PortalMethod::Post
    } else {
        PortalMethod::Other
    };
    let path = uri.path_and_query().map_or("/", |target| target.as_str());

    let response = app.portal.handle(
        &PortalRequest {
            method,
            path,
            body: &body,
        },
        app.clock.now_ms(),
    );

    let mut builder = axum::http::Response::builder()
        .status(response.status)
        .header(header::CONTENT_TYPE, response.content_type);
    if let Some(location) = &response.location {
        builder = builder.header(header::LOCATION, location.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn answer_dns(socket: UdpSocket, answer_ip: Ipv4Addr) {
    let mut packet = [0_u8; DNS_PACKET_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut packet).await {
            Ok(received) => received,
            Err(err) => {
                warn!("dns responder stopped: {err}");
                return;
            }
        };
        let Some(reply) = dns::build_response(&packet[..len], answer_ip) else {
            continue;
        };
        if let Err(err) = socket.send_to(&reply, peer).await {
            debug!("failed to answer {peer}: {err}");
        }
    }
}
