use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    handle::RawHandle,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::{EspOta, EspOtaUpdate},
    sys::{EspError, ESP_ERR_HTTP_EAGAIN, ESP_ERR_OTA_VALIDATE_FAILED, ESP_ERR_TIMEOUT},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use camstream_common::{
    config::NetworkConfig,
    routes::{accept_trigger, trigger_error_status},
    Capability, DeviceControl, FirmwareDownload, FirmwareSource, FlashLight, FrameSink,
    HttpMethod, ImageState, LampPin, MultipartStreamEngine, OtaController, OtaError, OtaHandle,
    OtaRequest, PartitionError, ReadStatus, RuntimeConfig, Scheduler, ShutdownSignal,
    SourceError, ThreadScheduler, TransportError, UpdatePartition, UpdateTrigger, UpdateWriter,
    ROUTES,
};

use crate::{
    camera::{EspCamera, EspJpegEncoder},
    web,
};

const NVS_NAMESPACE: &str = "camstream";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BOOT_BLINK_MS: u64 = 300;
const HTTPD_STACK_SIZE: usize = 16 * 1024;
const STREAM_CTRL_PORT: u16 = 32_769;
/// Socket timeout of one firmware read. The controller watchdog owns the
/// inactivity window.
const FIRMWARE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

#[derive(Clone)]
struct SharedState {
    config: Arc<RuntimeConfig>,
    engine: Arc<MultipartStreamEngine>,
    camera: EspCamera,
    ota: OtaHandle,
    flash: Arc<Mutex<FlashLight<EspLamp>>>,
    shutdown: ShutdownSignal,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspLamp {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

/// Chunked response body of one stream client.
struct ResponseSink<W> {
    response: W,
}

/// Opens one ESP-IDF HTTP client connection per firmware download.
struct EspFirmwareSource {
    poll_timeout: Duration,
}

struct EspFirmwareDownload {
    conn: EspHttpConnection,
    status: u16,
    content_length: Option<i64>,
    received: u64,
}

/// The inactive OTA slot.
struct EspOtaPartition {
    ota: EspOta,
    fallback_capacity: u64,
}

struct EspOtaWriter<'a> {
    update: EspOtaUpdate<'a>,
}

struct EspDevice {
    shutdown: ShutdownSignal,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_build_defaults(&mut runtime);
    runtime.sanitize();

    if let Err(err) = nvs_store.save_runtime_config(&runtime) {
        warn!("failed to persist runtime config: {err:#}");
    }

    info!(
        "NVS config loaded: ssid=`{}`, http port {}, stream port {}, firmware url `{}`",
        runtime.network.wifi_ssid,
        runtime.network.http_port,
        runtime.network.stream_port,
        runtime.ota.firmware_url,
    );

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let Peripherals { modem, .. } = Peripherals::take()?;

    let camera = EspCamera::init(&runtime.camera).context("camera startup failed")?;
    let flash = init_flash(runtime.camera.flash_pin)?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let state = SharedState {
        engine: Arc::new(MultipartStreamEngine::new(&runtime.stream)),
        config: Arc::new(runtime),
        camera,
        ota: OtaHandle::new(),
        flash: Arc::new(Mutex::new(flash)),
        shutdown: ShutdownSignal::new(),
    };

    let server = create_http_server(&state)?;
    let stream_server = create_stream_server(&state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let _stream_server = stream_server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_build_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }

    if runtime.ota.firmware_url.is_empty() {
        if let Some(url) = option_env!("FIRMWARE_URL") {
            runtime.ota.firmware_url = url.to_string();
        }
    }
}

/// Drives the flash pin low, then blinks it once so a fresh boot is visible.
fn init_flash(pin: i32) -> anyhow::Result<FlashLight<EspLamp>> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("flash LED unavailable on GPIO{pin}"))?;
    let mut flash = FlashLight::new(EspLamp { pin: driver })
        .map_err(|err| anyhow!("failed to drive flash LED: {err}"))?;

    for _ in 0..2 {
        if let Err(err) = flash.toggle() {
            warn!("boot blink failed: {err}");
            break;
        }
        thread::sleep(Duration::from_millis(BOOT_BLINK_MS));
    }

    info!("flash LED ready on GPIO{pin}");
    Ok(flash)
}

fn create_http_server(state: &SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: state.config.network.http_port,
        stack_size: HTTPD_STACK_SIZE,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    register_routes(&mut server, state, |_| true)?;

    info!(
        "HTTP server listening on port {} (viewer at /cam)",
        state.config.network.http_port
    );
    Ok(server)
}

/// Second httpd instance for the stream. ESP-IDF runs every handler of one
/// server on a single task, so a stream on the main server would hold off
/// the other routes until the client disconnects.
fn create_stream_server(state: &SharedState) -> anyhow::Result<Option<EspHttpServer<'static>>> {
    let port = state.config.network.stream_port;
    if port == 0 {
        return Ok(None);
    }

    let conf = HttpConfiguration {
        http_port: port,
        ctrl_port: STREAM_CTRL_PORT,
        stack_size: HTTPD_STACK_SIZE,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    register_routes(&mut server, state, |capability| {
        capability == Capability::Stream
    })?;

    info!("stream server listening on port {port}");
    Ok(Some(server))
}

fn register_routes(
    server: &mut EspHttpServer<'static>,
    state: &SharedState,
    include: impl Fn(Capability) -> bool,
) -> anyhow::Result<()> {
    for route in ROUTES.iter().filter(|route| include(route.capability)) {
        let method = match route.method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
        };
        let capability = route.capability;
        let state = state.clone();

        server.fn_handler::<anyhow::Error, _>(route.path, method, move |req| {
            match capability {
                Capability::Stream => handle_stream(&state, req),
                Capability::TriggerUpdate => handle_trigger_update(&state, req),
                Capability::UpdateStatus => write_json(req, &state.ota.view()),
                Capability::FlashToggle => handle_flash_toggle(&state, req),
                Capability::Viewer => {
                    let page = web::viewer_page(state.config.network.stream_port);
                    req.into_response(
                        200,
                        Some("OK"),
                        &[("Content-Type", "text/html; charset=utf-8")],
                    )?
                    .write_all(page.as_bytes())?;
                    Ok(())
                }
            }
        })?;
    }

    Ok(())
}

fn handle_stream(state: &SharedState, req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    let headers = state.engine.response_headers();
    let headers: Vec<(&str, &str)> = headers
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect();
    let response = req.into_response(200, Some("OK"), &headers)?;

    let scheduler = ThreadScheduler::default();
    let mut camera = state.camera.clone();
    let mut encoder = EspJpegEncoder;

    let session = state
        .engine
        .open(ResponseSink { response }, scheduler.now_ms());
    let summary = state.engine.serve(
        session,
        &mut camera,
        &mut encoder,
        &scheduler,
        &state.shutdown,
    );
    debug!(
        "stream session {} sent {} frames ({} bytes), ended by {}",
        summary.session_id,
        summary.frames_sent,
        summary.bytes_sent,
        summary.error.reason()
    );

    Ok(())
}

fn handle_trigger_update(state: &SharedState, mut req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    let body = match read_request_body(&mut req) {
        Ok(body) => body,
        Err(err) => return write_error(req, 400, &err.to_string()),
    };

    let trigger = match UpdateTrigger::from_body(&body) {
        Ok(trigger) => trigger,
        Err(err) => return write_error(req, trigger_error_status(&err), &err.to_string()),
    };

    let (request, response) =
        match accept_trigger(&state.ota, &state.config.ota, trigger, monotonic_ms()) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("OTA trigger refused: {err}");
                return write_error(req, trigger_error_status(&err), &err.to_string());
            }
        };

    info!("OTA update triggered from {}", request.url);
    if let Err(err) = spawn_ota_worker(state, request) {
        state.ota.fail(&OtaError::Download(err.to_string()));
        return write_error(req, 500, &format!("{err:#}"));
    }

    write_json(req, &response)
}

fn handle_flash_toggle(state: &SharedState, req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    let lit = {
        let mut flash = state.flash.lock().unwrap_or_else(PoisonError::into_inner);
        match flash.toggle() {
            Ok(lit) => lit,
            Err(err) => return write_error(req, 500, &format!("failed to drive flash LED: {err}")),
        }
    };

    let text = web::flash_state_text(lit);
    info!("flash {text}");
    req.into_response(200, Some("OK"), &[("Content-Type", "text/plain")])?
        .write_all(text.as_bytes())?;
    Ok(())
}

fn spawn_ota_worker(state: &SharedState, request: OtaRequest) -> anyhow::Result<()> {
    let config = state.config.ota.clone();
    let handle = state.ota.clone();
    let device = EspDevice {
        shutdown: state.shutdown.clone(),
    };

    thread::Builder::new()
        .name("ota-apply".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let partition = match EspOtaPartition::take(config.partition_capacity) {
                Ok(partition) => partition,
                Err(err) => {
                    handle.fail(&OtaError::Begin(err));
                    return;
                }
            };
            let mut source = EspFirmwareSource {
                poll_timeout: FIRMWARE_POLL_TIMEOUT,
            };

            let mut controller = OtaController::new(&config, handle, partition, device);
            // Outcome is recorded in the shared handle and logged by the controller.
            let _ = controller.run(&request, &mut source, &ThreadScheduler::default());
        })
        .context("failed to spawn OTA worker")?;

    Ok(())
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
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

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!(
            "wifi credentials missing; build with WIFI_SSID/WIFI_PASS or store them in NVS"
        ));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                let ip = wifi.wifi().sta_netif().get_ip_info()?;
                info!("wifi connected on attempt {attempt}, camera ready at http://{}/cam", ip.ip);
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json_slice(value.as_bytes())?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = String::from_utf8(runtime.to_json_vec()?)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

impl LampPin for EspLamp {
    type Error = EspError;

    fn set_lit(&mut self, lit: bool) -> Result<(), EspError> {
        if lit {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        }
    }
}

impl<W> FrameSink for ResponseSink<W>
where
    W: Write,
{
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.response
            .write_all(bytes)
            .map_err(|err| TransportError(format!("{err:?}")))
    }
}

impl FirmwareSource for EspFirmwareSource {
    type Download = EspFirmwareDownload;

    fn get(&mut self, url: &str) -> Result<EspFirmwareDownload, SourceError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.poll_timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut conn = EspHttpConnection::new(&http_conf).map_err(source_error)?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(source_error)?;
        conn.initiate_response().map_err(source_error)?;

        let status = conn.status();
        let content_length = conn
            .header("content-length")
            .or_else(|| conn.header("Content-Length"))
            .and_then(|value| value.trim().parse::<i64>().ok());

        Ok(EspFirmwareDownload {
            conn,
            status,
            content_length,
            received: 0,
        })
    }
}

impl FirmwareDownload for EspFirmwareDownload {
    fn http_status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<i64> {
        self.content_length
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SourceError> {
        let read = match self.conn.read(buf) {
            Ok(read) => read,
            // Socket timeout: nothing arrived within one poll.
            Err(err) if is_poll_timeout(err.0.code()) => 0,
            Err(err) => return Err(source_error(err)),
        };
        self.received += read as u64;
        Ok(ReadStatus::from_poll(read, self.body_complete()))
    }
}

impl EspFirmwareDownload {
    /// An empty read ends the download only once the declared body has
    /// arrived or the client reports it complete.
    fn body_complete(&self) -> bool {
        let declared = self
            .content_length
            .is_some_and(|len| self.received >= len.max(0) as u64);
        // SAFETY: the handle stays valid while `conn` is alive.
        declared
            || unsafe {
                esp_idf_svc::sys::esp_http_client_is_complete_data_received(self.conn.handle())
            }
    }
}

impl EspOtaPartition {
    fn take(fallback_capacity: u64) -> Result<Self, PartitionError> {
        let ota = EspOta::new().map_err(partition_error)?;
        Ok(Self {
            ota,
            fallback_capacity,
        })
    }
}

impl UpdatePartition for EspOtaPartition {
    type Writer<'a> = EspOtaWriter<'a>;

    fn capacity(&self) -> u64 {
        let slot = unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if slot.is_null() {
            return self.fallback_capacity;
        }
        u64::from(unsafe { (*slot).size })
    }

    fn begin(&mut self, size: u64) -> Result<EspOtaWriter<'_>, PartitionError> {
        debug!("erasing OTA slot for a {size} byte image");
        let update = self.ota.initiate_update().map_err(partition_error)?;
        Ok(EspOtaWriter { update })
    }
}

impl UpdateWriter for EspOtaWriter<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), PartitionError> {
        self.update
            .write(data)
            .map(|_| ())
            .map_err(partition_error)
    }

    /// `esp_ota_end` verifies the image before the boot slot is switched.
    fn finalize(self) -> Result<ImageState, PartitionError> {
        match self.update.complete() {
            Ok(()) => Ok(ImageState::Valid),
            Err(err) if err.code() == ESP_ERR_OTA_VALIDATE_FAILED as i32 => {
                Ok(ImageState::Incomplete)
            }
            Err(err) => Err(partition_error(err)),
        }
    }

    fn abort(self) -> Result<(), PartitionError> {
        self.update.abort().map_err(partition_error)
    }
}

impl DeviceControl for EspDevice {
    fn restart(&self) {
        warn!("restarting into the new firmware");
        self.shutdown.trigger();
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn is_poll_timeout(code: i32) -> bool {
    let code = code.abs();
    code == ESP_ERR_HTTP_EAGAIN as i32 || code == ESP_ERR_TIMEOUT as i32
}

fn source_error(err: impl core::fmt::Debug) -> SourceError {
    SourceError(format!("{err:?}"))
}

fn partition_error(err: impl core::fmt::Debug) -> PartitionError {
    PartitionError(format!("{err:?}"))
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
