use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camstream::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use camstream::ingest::CameraSettings;
use camstream::{codec, BackendRegistry, Frame, ModelConfig, ReconnectPolicy};

struct TestApi {
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(backend: &str) -> Result<Self> {
        let mut cameras = HashMap::new();
        for (id, url) in [
            ("short", "stub://short?width=32&height=24&fps=0&frames=3"),
            ("live", "stub://live?width=32&height=24&fps=20"),
            ("down", "stub://down?unreachable=true"),
        ] {
            cameras.insert(id.to_string(), CameraSettings::from_url(url));
        }
        let registry = BackendRegistry::builtin(backend, ModelConfig::default())?;
        let state = Arc::new(AppState::new(cameras, Arc::new(registry)));

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            target_fps: 0,
            reconnect: ReconnectPolicy::disabled(),
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, head: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.write_all(head.as_bytes())?;
        stream.write_all(body)?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has a header block");
        let headers = String::from_utf8_lossy(&response[..split]).to_string();
        Ok((headers, response[split + 4..].to_vec()))
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        self.request(
            &format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path),
            &[],
        )
    }

    fn post(&self, path: &str, content_type: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
        self.request(
            &format!(
                "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
                path,
                content_type,
                body.len()
            ),
            body,
        )
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn png_bytes(width: u32, height: u32) -> Result<Vec<u8>> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[test]
fn health_and_index_are_served() -> Result<()> {
    let api = TestApi::new("stub")?;

    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(String::from_utf8(body)?, r#"{"status":"ok"}"#);

    let (headers, body) = api.get("/")?;
    assert!(headers.contains("text/html"));
    assert!(String::from_utf8(body)?.contains("/cv/live/infer_stream"));

    let (headers, body) = api.get("/cv/")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["backend"], "stub");
    assert_eq!(value["cameras"], serde_json::json!(["down", "live", "short"]));
    Ok(())
}

#[test]
fn stream_emits_parts_and_closing_boundary() -> Result<()> {
    let api = TestApi::new("motion")?;

    let (headers, body) = api.get("/cv/short/infer_stream")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("multipart/x-mixed-replace; boundary=frame"));

    let text = String::from_utf8_lossy(&body);
    assert_eq!(text.matches("--frame\r\nContent-Type: image/jpeg").count(), 3);
    for sequence in 1..=3 {
        assert!(text.contains(&format!("X-Frame-Sequence: {}\r\n", sequence)));
    }
    assert!(text.contains("X-Detection-Count: "));
    assert!(text.ends_with("--frame--\r\n"));
    Ok(())
}

#[test]
fn stream_errors_map_to_status_codes() -> Result<()> {
    let api = TestApi::new("stub")?;

    let (headers, _) = api.get("/cv/nope/infer_stream")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, body) = api.get("/cv/down/infer_stream")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert!(String::from_utf8(body)?.contains("stream_unavailable"));

    let (headers, _) = api.request("DELETE /cv/live/infer_stream HTTP/1.1\r\n\r\n", &[])?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn second_viewer_gets_conflict_until_first_disconnects() -> Result<()> {
    let api = TestApi::new("stub")?;

    let mut first = TcpStream::connect(api.handle().addr)?;
    first.set_read_timeout(Some(Duration::from_secs(5)))?;
    first.write_all(b"GET /cv/live/infer_stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut buf = [0u8; 512];
    let n = first.read(&mut buf)?;
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));

    let (headers, body) = api.get("/cv/live/infer_stream")?;
    assert!(headers.contains("409 Conflict"));
    assert!(String::from_utf8(body)?.contains("camera_busy"));
    assert_eq!(api.handle().state().active_cameras(), vec!["live".to_string()]);

    drop(first);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !api.handle().state().active_cameras().is_empty() {
        assert!(Instant::now() < deadline, "session outlived its viewer");
        std::thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

#[test]
fn infer_image_accepts_image_bytes_and_transport_json() -> Result<()> {
    let api = TestApi::new("stub")?;

    let (headers, body) = api.post(
        "/cv/infer_image?filename=door.png&camera_id=front",
        "image/png",
        &png_bytes(8, 6)?,
    )?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["filename"], "door.png");
    assert_eq!(value["camera_id"], "front");
    assert!(value["results"].as_array().is_some());
    assert!(value["processing_time"]["detection"].is_number());
    assert!(value["timestamp"].is_string());

    let frame = Frame::from_rgb(4, 4, vec![7; 48])?;
    let json = serde_json::to_vec(&codec::encode(&frame))?;
    let (headers, _) = api.post("/cv/infer_image", "application/json", &json)?;
    assert!(headers.contains("200 OK"));

    let (headers, body) = api.post("/cv/infer_image", "image/png", b"not an image")?;
    assert!(headers.contains("400 Bad Request"));
    assert!(String::from_utf8(body)?.contains("invalid_image"));
    Ok(())
}

#[test]
fn set_config_validates_and_applies() -> Result<()> {
    let api = TestApi::new("motion")?;

    let (headers, _) = api.post("/cv/set_config", "application/json", br#"{"classes": []}"#)?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, body) = api.post(
        "/cv/set_config",
        "application/json",
        br#"{"classes": [{"id": 3, "name": "person"}], "confidence_threshold": 0.6}"#,
    )?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&body)?;
    assert!(value["info"].is_string());
    assert_eq!(value["config"]["classes"][0]["id"], 3);

    let (_, body) = api.get("/cv/config")?;
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["classes"][0]["name"], "person");
    assert_eq!(value["device"], "cpu");
    Ok(())
}
