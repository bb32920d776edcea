use core::{convert::TryInto, ffi::c_void};
use std::{
    io::Write as _,
    net::{Ipv4Addr, UdpSocket},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, IOPin, Input, InterruptType, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    io::EspIOError,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{self, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use hookbutton_common::{
    config::{
        Credentials, TxPowerProfile, BOOT_SETTLE_MS, WEBHOOK_MAX_RESPONSE_BODY, WEBHOOK_TIMEOUT_MS,
    },
    dns,
    provisioning::{start_soft_ap, ApSettings, SoftAp},
    ApStartup, Board, BootExit, ButtonMonitor, Clock, ConfigStore, DeviceState, Firmware,
    KeyValueStore, PortalMethod, PortalRequest, PortalResponse, ProvisioningPortal, SleepControl,
    WakeCause, WebhookError, WebhookMethod, WebhookRequest, WebhookResponse, WebhookTransport,
    WifiStation,
};

const NVS_NAMESPACE: &str = "hookbutton";
const BUTTON_GPIO: i32 = 2;
const MAX_HTTP_BODY: usize = 4096;
const DNS_PACKET_SIZE: usize = 512;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let wake = read_wake_cause();
    info!("hookbutton starting, wake cause {}", wake.as_str());

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let clock = EspClock;
    let state = Arc::new(DeviceState::new(clock.now_ms()));
    let mut button = ButtonLine::new(
        pins.gpio2.downgrade(),
        Arc::new(ButtonMonitor::new(state.clone())),
    )
    .context("failed to configure button")?;

    clock.sleep_ms(BOOT_SETTLE_MS);
    let button_held = button.is_pressed();
    button
        .attach()
        .context("failed to attach button interrupt")?;

    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let board = EspBoard {
        clock,
        radio: EspRadio::new(wifi, sys_loop),
        transport: EspTransport,
        button,
        portal_server: None,
    };

    let mut firmware = Firmware::new(board, ConfigStore::new(nvs_store), state);
    let exit = firmware.boot(wake, button_held)?;
    finish_boot(exit)
}

fn finish_boot(exit: BootExit) -> ! {
    match exit {
        BootExit::Restart => unsafe { sys::esp_restart() },
        BootExit::DeepSleep => unsafe { sys::esp_deep_sleep_start() },
    }
}

fn read_wake_cause() -> WakeCause {
    let cause = unsafe { sys::esp_sleep_get_wakeup_cause() };
    match cause {
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_UNDEFINED => WakeCause::ColdBoot,
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_GPIO
        | sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0
        | sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT1 => WakeCause::ButtonWake,
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::TimerWake,
        _ => WakeCause::Other,
    }
}

fn check(rc: sys::esp_err_t, what: &str) -> anyhow::Result<()> {
    if rc == sys::ESP_OK {
        return Ok(());
    }
    Err(anyhow!("{what} failed with code {rc}"))
}

#[derive(Debug, Clone, Copy)]
struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u32 {
        uptime_ms()
    }

    fn sleep_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}

fn uptime_ms() -> u32 {
    (unsafe { sys::esp_timer_get_time() } / 1_000) as u32
}

/// Active-low button with a pull-up, serviced by a raw GPIO interrupt so the
/// handler stays armed while the main task blocks on a webhook call.
struct ButtonLine {
    pin: PinDriver<'static, AnyIOPin, Input>,
    monitor: Arc<ButtonMonitor>,
    attached: bool,
}

impl ButtonLine {
    fn new(pin: AnyIOPin, monitor: Arc<ButtonMonitor>) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_interrupt_type(InterruptType::NegEdge)?;

        let rc = unsafe { sys::gpio_install_isr_service(0) };
        if rc != sys::ESP_OK && rc != sys::ESP_ERR_INVALID_STATE {
            return Err(anyhow!("gpio_install_isr_service failed with code {rc}"));
        }

        Ok(Self {
            pin,
            monitor,
            attached: false,
        })
    }

    fn is_pressed(&self) -> bool {
        self.pin.is_low()
    }

    fn attach(&mut self) -> anyhow::Result<()> {
        if self.attached {
            return Ok(());
        }
        // The monitor outlives the handler: it is only dropped with `self`,
        // and `Drop` removes the handler first.
        let arg = Arc::as_ptr(&self.monitor) as *mut c_void;
        check(
            unsafe { sys::gpio_isr_handler_add(BUTTON_GPIO, Some(button_isr), arg) },
            "gpio_isr_handler_add",
        )?;
        check(
            unsafe { sys::gpio_intr_enable(BUTTON_GPIO) },
            "gpio_intr_enable",
        )?;
        self.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        unsafe {
            sys::gpio_intr_disable(BUTTON_GPIO);
            sys::gpio_isr_handler_remove(BUTTON_GPIO);
        }
        self.attached = false;
    }
}

impl Drop for ButtonLine {
    fn drop(&mut self) {
        self.detach();
    }
}

unsafe extern "C" fn button_isr(arg: *mut c_void) {
    let monitor = unsafe { &*(arg as *const ButtonMonitor) };
    monitor.on_falling_edge(uptime_ms());
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl KeyValueStore for NvsStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let Some(len) = nvs.str_len(key)? else {
            return Ok(None);
        };

        let mut buffer = vec![0_u8; len.max(1)];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(key, value)
            .with_context(|| format!("failed to write `{key}` to nvs"))?;
        Ok(())
    }
}

/// The single radio, used as station or as access point.
struct EspRadio {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    tx_power: Option<TxPowerProfile>,
}

impl EspRadio {
    fn new(wifi: EspWifi<'static>, sys_loop: EspSystemEventLoop) -> Self {
        Self {
            wifi,
            sys_loop,
            tx_power: None,
        }
    }

    /// Transmit power can only be set while the driver runs; a value set
    /// before that is applied on start.
    fn apply_tx_power(&self) -> anyhow::Result<()> {
        let Some(profile) = self.tx_power else {
            return Ok(());
        };
        if !self.wifi.is_started()? {
            return Ok(());
        }
        check(
            unsafe { sys::esp_wifi_set_max_tx_power(profile.quarter_dbm()) },
            "esp_wifi_set_max_tx_power",
        )?;
        info!("wifi tx power set to {} dBm", profile.dbm());
        Ok(())
    }

    fn ap_ip(&self) -> anyhow::Result<Ipv4Addr> {
        Ok(self.wifi.ap_netif().get_ip_info()?.ip)
    }
}

impl WifiStation for EspRadio {
    fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.wifi.is_started()? {
            self.wifi.disconnect()?;
        }
        Ok(())
    }

    fn set_tx_power(&mut self, profile: TxPowerProfile) -> anyhow::Result<()> {
        self.tx_power = Some(profile);
        self.apply_tx_power()
    }

    fn begin(&mut self, credentials: &Credentials) -> anyhow::Result<()> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
            if let Err(err) = self.apply_tx_power() {
                warn!("failed to apply wifi tx power: {err:#}");
            }
        }

        self.wifi.connect()?;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}

impl SoftAp for EspRadio {
    fn start(&mut self, settings: &ApSettings) -> anyhow::Result<()> {
        if self.wifi.is_started()? {
            let _ = self.wifi.disconnect();
            self.wifi.stop()?;
        }

        let mut conf = AccessPointConfiguration {
            ssid: settings
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("access point ssid too long"))?,
            auth_method: AuthMethod::None,
            ..Default::default()
        };
        if let Some(channel) = settings.channel {
            conf.channel = channel;
        }
        if let Some(max_connections) = settings.max_connections {
            conf.max_connections = max_connections;
        }

        {
            let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
            wifi.set_configuration(&Configuration::AccessPoint(conf))?;
            wifi.start()?;
            wifi.wait_netif_up()?;
        }

        self.tx_power = settings.tx_power;
        self.apply_tx_power()
    }
}

struct EspTransport;

impl WebhookTransport for EspTransport {
    fn send(&mut self, request: &WebhookRequest) -> Result<WebhookResponse, WebhookError> {
        let conf = HttpClientConfiguration {
            timeout: Some(Duration::from_millis(WEBHOOK_TIMEOUT_MS.into())),
            skip_cert_common_name_check: true,
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&conf).map_err(classify)?);

        let method = match request.method {
            WebhookMethod::Get => Method::Get,
            WebhookMethod::Post => Method::Post,
        };
        let body = request.body.as_deref().unwrap_or_default();
        let content_length = body.len().to_string();

        let mut headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if request.body.is_some() && !request.has_header("content-length") {
            headers.push(("Content-Length", content_length.as_str()));
        }

        let mut outgoing = client
            .request(method, &request.url, &headers)
            .map_err(classify_io)?;
        if request.body.is_some() {
            outgoing.write_all(body.as_bytes()).map_err(classify_io)?;
            outgoing.flush().map_err(classify_io)?;
        }

        let mut response = outgoing.submit().map_err(classify_io)?;
        let status = response.status();

        let mut buffer = vec![0_u8; WEBHOOK_MAX_RESPONSE_BODY];
        let mut filled = 0;
        while filled < buffer.len() {
            let read = response.read(&mut buffer[filled..]).map_err(classify_io)?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        Ok(WebhookResponse {
            status,
            body: String::from_utf8_lossy(&buffer[..filled]).into_owned(),
        })
    }
}

fn classify(err: EspError) -> WebhookError {
    let code = err.code();
    if code == sys::ESP_ERR_TIMEOUT as sys::esp_err_t
        || code == sys::ESP_ERR_HTTP_EAGAIN as sys::esp_err_t
    {
        WebhookError::Timeout
    } else {
        WebhookError::Transport(err.to_string())
    }
}

fn classify_io(err: EspIOError) -> WebhookError {
    classify(err.0)
}

struct EspBoard {
    clock: EspClock,
    radio: EspRadio,
    transport: EspTransport,
    button: ButtonLine,
    portal_server: Option<EspHttpServer<'static>>,
}

impl SleepControl for EspBoard {
    fn detach_button_interrupt(&mut self) {
        self.button.detach();
    }

    fn attach_button_interrupt(&mut self) -> anyhow::Result<()> {
        self.button.attach()
    }

    fn arm_button_wake(&mut self) -> anyhow::Result<()> {
        check(
            unsafe {
                sys::esp_deep_sleep_enable_gpio_wakeup(
                    1_u64 << BUTTON_GPIO,
                    sys::esp_deepsleep_gpio_wake_up_mode_t_ESP_GPIO_WAKEUP_GPIO_LOW,
                )
            },
            "esp_deep_sleep_enable_gpio_wakeup",
        )
    }

    fn flush_diagnostics(&mut self) {
        let _ = std::io::stdout().flush();
        thread::sleep(Duration::from_millis(50));
    }
}

impl Board for EspBoard {
    type Clock = EspClock;
    type Station = EspRadio;
    type Transport = EspTransport;
    type Store = NvsStore;

    fn clock(&self) -> EspClock {
        self.clock
    }

    fn station(&mut self) -> &mut EspRadio {
        &mut self.radio
    }

    fn transport(&mut self) -> &mut EspTransport {
        &mut self.transport
    }

    fn random_u32(&mut self) -> u32 {
        unsafe { sys::esp_random() }
    }

    fn start_portal(
        &mut self,
        ap_ssid: &str,
        portal: Arc<ProvisioningPortal<NvsStore>>,
    ) -> anyhow::Result<ApStartup> {
        let startup = start_soft_ap(&mut self.radio, &self.clock, ap_ssid);
        if !startup.is_running() {
            return Ok(startup);
        }

        let ip = self.radio.ap_ip().context("failed to read access point address")?;
        portal.set_origin(ip, 80);
        info!("portal reachable at http://{ip}/");

        self.portal_server = Some(create_portal_server(portal)?);
        spawn_dns_responder(ip)?;
        Ok(startup)
    }
}

fn create_portal_server(
    portal: Arc<ProvisioningPortal<NvsStore>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for (method, portal_method) in [
        (Method::Get, PortalMethod::Get),
        (Method::Post, PortalMethod::Post),
    ] {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
            let body = match portal_method {
                PortalMethod::Post => read_request_body(&mut req)?,
                _ => Vec::new(),
            };
            let path = req.uri().to_string();
            let response = portal.handle(
                &PortalRequest {
                    method: portal_method,
                    path: &path,
                    body: &body,
                },
                uptime_ms(),
            );
            write_portal_response(req, &response)
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_portal_response(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    response: &PortalResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(location) = response.location.as_deref() {
        headers.push(("Location", location));
    }

    req.into_response(response.status, Some(response.reason()), &headers)?
        .write_all(response.body.as_bytes())?;
    Ok(())
}

fn spawn_dns_responder(ip: Ipv4Addr) -> anyhow::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, dns::DNS_PORT))
        .context("failed to bind captive dns socket")?;

    thread::Builder::new()
        .name("captive-dns".into())
        .stack_size(4096)
        .spawn(move || {
            let mut packet = [0_u8; DNS_PACKET_SIZE];
            loop {
                let (len, peer) = match socket.recv_from(&mut packet) {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("captive dns receive error: {err}");
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                };
                let Some(reply) = dns::build_response(&packet[..len], ip) else {
                    continue;
                };
                if let Err(err) = socket.send_to(&reply, peer) {
                    warn!("captive dns send error: {err}");
                }
            }
        })
        .context("failed to spawn captive dns thread")?;

    info!("captive dns answering with {ip}");
    Ok(())
}
