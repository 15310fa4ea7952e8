use crate::codec::{self, EncodedFrame};
use crate::config::{validate_camera_id, AppConfig};
use crate::detect::{run_detector, BackendRegistry, Detection, ModelConfig, ProcessingTime};
use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};
use crate::ingest::{
    prepare_source, CameraSettings, PreparedSource, ReconnectPolicy, SourceKind,
};
use crate::rate::RateLimiter;
use crate::session::{Emission, SessionEnd, SessionHandle, StreamSession};
use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEAD_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const BOUNDARY: &str = "frame";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Inference rate per viewer; 0 runs the detector on every frame.
    pub target_fps: u32,
    pub reconnect: ReconnectPolicy,
    pub jpeg_quality: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8001".to_string(),
            target_fps: 60,
            reconnect: ReconnectPolicy::new(2, Duration::from_secs(5)),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ApiConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            target_fps: cfg.stream.target_fps,
            reconnect: cfg.stream.reconnect_policy(),
            jpeg_quality: cfg.stream.jpeg_quality,
        }
    }
}

/// State shared by every request worker.
pub struct AppState {
    cameras: HashMap<String, CameraSettings>,
    registry: Arc<BackendRegistry>,
    sessions: Mutex<ActiveSessions>,
}

#[derive(Default)]
struct ActiveSessions {
    closed: bool,
    viewers: HashMap<String, SessionHandle>,
}

impl AppState {
    pub fn new(cameras: HashMap<String, CameraSettings>, registry: Arc<BackendRegistry>) -> Self {
        Self {
            cameras,
            registry,
            sessions: Mutex::new(ActiveSessions::default()),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Sorted ids of cameras with a connected viewer.
    pub fn active_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().viewers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every session and refuse new viewers.
    pub fn stop_all(&self) {
        let handles: Vec<(String, SessionHandle)> = {
            let mut sessions = self.sessions();
            sessions.closed = true;
            sessions.viewers.drain().collect()
        };
        for (camera, handle) in handles {
            log::info!("api: stopping stream for camera {}", camera);
            handle.stop();
        }
    }

    fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn claim(&self, camera: &str, handle: SessionHandle) -> Claim<'_> {
        let mut sessions = self.sessions();
        if sessions.closed {
            return Claim::Closed;
        }
        if sessions.viewers.contains_key(camera) {
            return Claim::Busy;
        }
        sessions.viewers.insert(camera.to_string(), handle);
        Claim::Granted(ViewerSlot {
            state: self,
            camera: camera.to_string(),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, ActiveSessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Claim<'a> {
    Granted(ViewerSlot<'a>),
    Busy,
    Closed,
}

/// Frees the camera for the next viewer when the stream ends.
struct ViewerSlot<'a> {
    state: &'a AppState,
    camera: String,
}

impl Drop for ViewerSlot<'_> {
    fn drop(&mut self) {
        self.state.sessions().viewers.remove(&self.camera);
    }
}

pub struct ApiHandle {
    pub addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Stop accepting, end every stream and wait for the workers.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.state.stop_all();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<AppState>) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = self.state.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                log::error!("inference api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            state: self.state,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let cfg = Arc::new(cfg);
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let state = state.clone();
                workers.retain(|worker| !worker.is_finished());
                workers.push(std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &state) {
                        log::warn!("inference api request failed: {:#}", err);
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };

    state.stop_all();
    for worker in workers {
        if worker.join().is_err() {
            log::error!("inference api worker panicked");
        }
    }
    result
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, state: &AppState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.body_too_large {
        write_json_response(&mut stream, 413, &json!({"error": "payload_too_large"}))?;
        return Ok(());
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => {
            let page = index_page(&state.camera_ids());
            write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes())
        }
        ("GET", "/health") => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        ("GET", "/cv") | ("GET", "/cv/") => write_json_response(
            &mut stream,
            200,
            &json!({
                "message": "camstream inference api",
                "backend": state.registry.default_name(),
                "backends": state.registry.list(),
                "cameras": state.camera_ids(),
                "active": state.active_cameras(),
            }),
        ),
        ("GET", "/cv/config") => {
            write_json_response(&mut stream, 200, &json!(state.registry.model_config()))
        }
        ("POST", "/cv/set_config") => set_config(&mut stream, &request, state),
        ("POST", "/cv/infer_image") => infer_image(&mut stream, &request, state),
        ("GET", path) => match stream_camera(path) {
            Some(camera) => serve_stream(&mut stream, camera, cfg, state),
            None => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
        },
        _ => write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"})),
    }
}

/// `/cv/{camera}/infer_stream` -> `camera`.
fn stream_camera(path: &str) -> Option<&str> {
    let camera = path.strip_prefix("/cv/")?.strip_suffix("/infer_stream")?;
    if camera.is_empty() || camera.contains('/') {
        return None;
    }
    Some(camera)
}

fn set_config(stream: &mut TcpStream, request: &HttpRequest, state: &AppState) -> Result<()> {
    let config: ModelConfig = match serde_json::from_slice(&request.body) {
        Ok(config) => config,
        Err(err) => {
            return write_json_response(
                stream,
                400,
                &json!({"error": "invalid_config", "detail": err.to_string()}),
            )
        }
    };
    if let Err(err) = state.registry.configure(config) {
        return write_json_response(
            stream,
            400,
            &json!({"error": "invalid_config", "detail": format!("{:#}", err)}),
        );
    }
    let applied = state.registry.model_config();
    log::info!(
        "api: model configuration applied ({} classes, confidence {})",
        applied.classes.len(),
        applied.confidence_threshold
    );
    write_json_response(
        stream,
        200,
        &json!({"info": "configuration applied", "config": applied}),
    )
}

#[derive(Serialize)]
struct InferenceResponse<'a> {
    processing_time: ProcessingTime,
    results: &'a [Detection],
    filename: String,
    camera_id: String,
    timestamp: String,
}

fn infer_image(stream: &mut TcpStream, request: &HttpRequest, state: &AppState) -> Result<()> {
    let frame = match request_frame(request) {
        Ok(frame) => frame,
        Err(err) => {
            return write_json_response(
                stream,
                400,
                &json!({"error": "invalid_image", "detail": format!("{:#}", err)}),
            )
        }
    };
    let backend = match state.registry.instantiate_default() {
        Ok(backend) => backend,
        Err(err) => {
            log::warn!("api: no detector backend: {:#}", err);
            return write_json_response(stream, 503, &json!({"error": "no_backend"}));
        }
    };
    let detections = match run_detector(&backend, &frame) {
        Ok(detections) => detections,
        Err(err) => {
            log::warn!("api: inference failed: {:#}", err);
            return write_json_response(stream, 500, &json!({"error": "inference_failed"}));
        }
    };
    let response = InferenceResponse {
        processing_time: detections.processing_time,
        results: &detections.results,
        filename: request
            .query_value("filename")
            .unwrap_or_else(|| "upload".to_string()),
        camera_id: request.query_value("camera_id").unwrap_or_default(),
        timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
    };
    write_json_response(stream, 200, &json!(response))
}

fn request_frame(request: &HttpRequest) -> Result<Frame> {
    if request.body.is_empty() {
        bail!("request body is empty");
    }
    let content_type = request
        .headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or_default();
    if content_type.starts_with("application/json") {
        let encoded: EncodedFrame = serde_json::from_slice(&request.body)?;
        Ok(codec::decode(&encoded)?)
    } else {
        Frame::from_image_bytes(&request.body)
    }
}

fn serve_stream(
    stream: &mut TcpStream,
    camera: &str,
    cfg: &ApiConfig,
    state: &AppState,
) -> Result<()> {
    let camera = camera.to_lowercase();
    if validate_camera_id(&camera).is_err() || !state.cameras.contains_key(&camera) {
        return write_json_response(stream, 404, &json!({"error": "unknown_camera"}));
    }
    let backend = match state.registry.instantiate_default() {
        Ok(backend) => backend,
        Err(err) => {
            log::warn!("api: no detector backend: {:#}", err);
            return write_json_response(stream, 503, &json!({"error": "no_backend"}));
        }
    };
    let source = match prepare_source(
        &SourceKind::Stream(camera.clone()),
        &state.cameras,
        cfg.reconnect,
    ) {
        Ok(PreparedSource::Live(source)) => source,
        Ok(PreparedSource::Still(_)) => bail!("camera {} resolved to a still image", camera),
        Err(err) => {
            log::warn!("api: camera {} unavailable: {:#}", camera, err);
            return write_json_response(stream, 503, &json!({"error": "stream_unavailable"}));
        }
    };
    let mut session = StreamSession::new(
        camera.clone(),
        source,
        RateLimiter::from_fps(cfg.target_fps),
        backend,
    );

    let _slot = match state.claim(&camera, session.handle()) {
        Claim::Granted(slot) => slot,
        Claim::Busy => {
            return write_json_response(stream, 409, &json!({"error": "camera_busy"}));
        }
        Claim::Closed => {
            return write_json_response(stream, 503, &json!({"error": "shutting_down"}));
        }
    };
    if session.start().is_err() {
        return write_json_response(stream, 503, &json!({"error": "stream_unavailable"}));
    }

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    if let Err(err) = stream.write_all(header.as_bytes()) {
        session.handle().stop();
        return Err(err.into());
    }
    log::info!("api: streaming camera {}", camera);

    let quality = cfg.jpeg_quality;
    let end = session.run(|emission| write_part(stream, emission, quality));
    if end == SessionEnd::Exhausted {
        stream.write_all(format!("--{}--\r\n", BOUNDARY).as_bytes())?;
        stream.flush()?;
    }
    let stats = session.source_stats();
    log::info!(
        "api: stream for camera {} ended ({:?}, {} frames read, {} reconnects)",
        camera,
        end,
        stats.frames_read,
        stats.reconnects
    );
    Ok(())
}

fn write_part(stream: &mut TcpStream, emission: Emission, quality: u8) -> Result<()> {
    let Emission {
        sequence,
        mut frame,
        detections,
    } = emission;
    frame.draw_detections(&detections);
    let jpeg = frame.encode_jpeg(quality)?;
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Frame-Sequence: {}\r\nX-Detection-Count: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len(),
        sequence,
        detections.results.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

fn index_page(cameras: &[String]) -> String {
    let mut page = String::from(
        "<!doctype html>\n<html><head><title>camstream</title></head><body>\n<h1>camstream</h1>\n<ul>\n",
    );
    for camera in cameras {
        page.push_str(&format!(
            "<li><a href=\"/cv/{id}/infer_stream\">{id}</a></li>\n",
            id = camera
        ));
    }
    page.push_str("</ul>\n</body></html>\n");
    page
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            bail!("request head too large");
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            bail!("connection closed before end of request head");
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..head_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    let mut request = HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body: Vec::new(),
        body_too_large: false,
    };
    if content_length > MAX_BODY_BYTES {
        request.body_too_large = true;
        return Ok(request);
    }

    let mut body = data.split_off(head_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            bail!("connection closed before end of request body");
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    write_response(stream, status, "application/json", body.to_string().as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
    body_too_large: bool,
}

impl HttpRequest {
    fn query_value(&self, key: &str) -> Option<String> {
        let query = self.raw_path.split_once('?')?.1;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}
