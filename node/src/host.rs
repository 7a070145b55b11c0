use std::{
    convert::Infallible,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::mpsc, sync::Notify};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use camstream_common::{
    routes::{accept_trigger, trigger_error_status},
    Capability, DeviceControl, FlashLight, FrameSink, HttpMethod, MultipartStreamEngine,
    OtaController, OtaError, OtaHandle, OtaRequest, RuntimeConfig, ShutdownSignal,
    ThreadScheduler, TransportError, TriggerError, UpdateTrigger, ROUTES,
};

use crate::{
    sim::{FilePartition, HttpFirmwareSource, ImageJpegEncoder, SimulatedLamp, TestPatternSource},
    web,
};

const STREAM_CHANNEL_DEPTH: usize = 4;
const FIRMWARE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SIMULATED_SENSOR_FPS: u32 = 25;

#[derive(Clone)]
struct AppState {
    config: Arc<RuntimeConfig>,
    engine: Arc<MultipartStreamEngine>,
    ota: OtaHandle,
    flash: Arc<Mutex<FlashLight<SimulatedLamp>>>,
    shutdown: ShutdownSignal,
    restart: Arc<Notify>,
    ota_worker: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    firmware_path: Arc<PathBuf>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Restart stand-in: stops the server so a supervisor can start the staged
/// image.
struct HostDevice {
    shutdown: ShutdownSignal,
    restart: Arc<Notify>,
}

/// Feeds multipart bytes from the blocking engine worker into the response
/// body. A send fails once the client has gone and the body was dropped.
struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    if let Err(err) = store.save_runtime_config(&runtime).await {
        warn!("failed to persist runtime config: {err:#}");
    }

    info!(
        "config loaded: camera {:?} {}, stream quality {}, firmware url `{}`",
        runtime.camera.frame_size,
        runtime.camera.pixel_format.as_str(),
        runtime.stream.jpeg_quality,
        runtime.ota.firmware_url,
    );

    let flash = FlashLight::new(SimulatedLamp).context("failed to init flash light")?;
    let app_state = AppState {
        engine: Arc::new(MultipartStreamEngine::new(&runtime.stream)),
        config: Arc::new(runtime),
        ota: OtaHandle::new(),
        flash: Arc::new(Mutex::new(flash)),
        shutdown: ShutdownSignal::new(),
        restart: Arc::new(Notify::new()),
        ota_worker: Arc::new(Mutex::new(None)),
        store,
    };

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = ROUTES
        .iter()
        .fold(Router::new(), |router, route| {
            router.route(route.path, bind(route.method, route.capability))
        })
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state.clone());

    let port = app_state.config.network.http_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind camera server at {addr}"))?;

    info!("camera node listening on http://{addr} (viewer at /cam)");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(app_state.clone()))
        .await?;

    app_state.shutdown.trigger();
    app_state.ota.abort();
    let worker = app_state
        .ota_worker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(worker) = worker {
        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => debug!("OTA worker stopped"),
            _ => warn!("OTA worker ended abnormally"),
        }
    }

    info!("camera node stopped");
    Ok(())
}

fn bind(method: HttpMethod, capability: Capability) -> MethodRouter<AppState> {
    let filter = match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
    };

    match capability {
        Capability::Stream => on(filter, handle_stream),
        Capability::TriggerUpdate => on(filter, handle_trigger_update),
        Capability::UpdateStatus => on(filter, handle_update_status),
        Capability::FlashToggle => on(filter, handle_flash_toggle),
        Capability::Viewer => on(filter, handle_viewer),
    }
}

async fn wait_for_shutdown(state: AppState) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("failed to listen for ctrl-c: {err}");
            }
            info!("shutdown requested");
        }
        _ = state.restart.notified() => {
            info!("restart requested after OTA update");
        }
    }
    state.shutdown.trigger();
    state.ota.abort();
}

async fn handle_stream(State(state): State<AppState>) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_DEPTH);
    let headers = state.engine.response_headers();

    let engine = state.engine.clone();
    let camera = state.config.camera.clone();
    let shutdown = state.shutdown.clone();

    tokio::task::spawn_blocking(move || {
        let mut source = TestPatternSource::new(&camera).with_frame_rate(SIMULATED_SENSOR_FPS);
        let mut encoder = ImageJpegEncoder;
        let scheduler = ThreadScheduler::default();

        let session = engine.open(ChannelSink { tx }, monotonic_ms());
        let summary = engine.serve(session, &mut source, &mut encoder, &scheduler, &shutdown);
        debug!(
            "stream session {} sent {} bytes, ended by {}",
            summary.session_id,
            summary.bytes_sent,
            summary.error.reason()
        );
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    for (name, value) in headers {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                response.headers_mut().insert(name, value);
            }
            Err(err) => warn!("invalid {name} header value `{value}`: {err}"),
        }
    }
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn handle_trigger_update(State(state): State<AppState>, body: Bytes) -> Response {
    let trigger = match UpdateTrigger::from_body(&body) {
        Ok(trigger) => trigger,
        Err(err) => return trigger_error_response(&err),
    };

    let (request, response) =
        match accept_trigger(&state.ota, &state.config.ota, trigger, monotonic_ms()) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("OTA trigger refused: {err}");
                return trigger_error_response(&err);
            }
        };

    info!("OTA update triggered from {}", request.url);
    if let Err(err) = spawn_ota_worker(&state, request) {
        state.ota.fail(&OtaError::Download(err.to_string()));
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"));
    }

    Json(response).into_response()
}

async fn handle_update_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ota.view())
}

async fn handle_flash_toggle(State(state): State<AppState>) -> Response {
    let mut flash = state.flash.lock().unwrap_or_else(PoisonError::into_inner);
    match flash.toggle() {
        Ok(lit) => {
            info!("flash {}", web::flash_state_text(lit));
            web::flash_state_text(lit).into_response()
        }
        Err(err) => match err {},
    }
}

async fn handle_viewer() -> impl IntoResponse {
    Html(web::viewer_page(0))
}

fn spawn_ota_worker(state: &AppState, request: OtaRequest) -> anyhow::Result<()> {
    let config = state.config.ota.clone();
    let handle = state.ota.clone();
    let partition = FilePartition::new(
        state.store.firmware_path.to_path_buf(),
        config.partition_capacity,
    );
    let read_timeout = Duration::from_millis(config.inactivity_timeout_ms);
    let device = HostDevice {
        shutdown: state.shutdown.clone(),
        restart: state.restart.clone(),
    };

    let worker = thread::Builder::new()
        .name("ota-apply".into())
        .spawn(move || {
            let mut source = match HttpFirmwareSource::new(FIRMWARE_CONNECT_TIMEOUT, read_timeout) {
                Ok(source) => source,
                Err(err) => {
                    handle.fail(&OtaError::Download(err.to_string()));
                    return;
                }
            };

            let mut controller = OtaController::new(&config, handle, partition, device);
            // Outcome is recorded in the shared handle and logged by the controller.
            let _ = controller.run(&request, &mut source, &ThreadScheduler::default());
        })
        .context("failed to spawn OTA worker")?;

    *state.ota_worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    Ok(())
}

impl FrameSink for ChannelSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(bytes))
            .map_err(|_| TransportError("client disconnected".to_string()))
    }
}

impl DeviceControl for HostDevice {
    fn restart(&self) {
        warn!("restarting: stopping server so the staged firmware can be started");
        self.shutdown.trigger();
        self.restart.notify_one();
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CAMSTREAM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.camstream"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            firmware_path: Arc::new(data_dir.join("firmware.bin")),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(RuntimeConfig::from_json_slice(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(url) = std::env::var("FIRMWARE_URL") {
        runtime.ota.firmware_url = url;
    }
    if let Some(port) = env_parse::<u16>("CAMSTREAM_HTTP_PORT") {
        runtime.network.http_port = port;
    }
    if let Some(timeout) = env_parse::<u64>("OTA_INACTIVITY_TIMEOUT_MS") {
        runtime.ota.inactivity_timeout_ms = timeout;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn trigger_error_response(err: &TriggerError) -> Response {
    let status = StatusCode::from_u16(trigger_error_status(err))
        .unwrap_or(StatusCode::BAD_REQUEST);
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
