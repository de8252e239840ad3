use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vms::api::{ApiConfig, ApiHandle, ApiServer};
use vms::config::{AnalysisSettings, PipelineConfig, SyntheticSettings};
use vms::StreamRegistry;

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Ok(Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

struct TestApi {
    registry: Arc<StreamRegistry>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let config = PipelineConfig {
            synthetic: SyntheticSettings {
                width: 64,
                height: 48,
                fps: 25,
            },
            ..PipelineConfig::default()
        };
        let registry = Arc::new(StreamRegistry::new(config, AnalysisSettings::default()));
        let api_handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            Arc::clone(&registry),
        )
        .spawn()?;
        Ok(Self {
            registry,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
        self.registry.shutdown();
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::new()?;
    let response = send(api.addr(), "GET", "/health", None)?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["status"], "ok");
    Ok(())
}

#[test]
fn stream_lifecycle_over_http() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();

    let created = send(
        addr,
        "POST",
        "/api/streams",
        Some(r#"{"url": "stub://gate", "id": "gate"}"#),
    )?;
    assert_eq!(created.status, 200);
    let body = created.json();
    assert_eq!(body["id"], "gate");
    assert_eq!(body["status"], "started");

    let duplicate = send(
        addr,
        "POST",
        "/api/streams",
        Some(r#"{"url": "stub://other", "id": "gate"}"#),
    )?;
    assert_eq!(duplicate.status, 400);
    assert_eq!(duplicate.json()["reason"], "AlreadyExists");

    let listed = send(addr, "GET", "/api/streams", None)?.json();
    let streams = listed.as_array().expect("stream list");
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0]["id"], "gate");
    assert_eq!(streams[0]["url"], "stub://gate");

    let status = send(addr, "GET", "/api/streams/gate/status", None)?.json();
    assert_eq!(status["running"], true);
    assert_eq!(status["is_local_file"], false);
    assert!(status.get("progress").is_none());
    assert!(status.get("detection_enabled").is_some());

    assert!(wait_for(|| {
        send(addr, "GET", "/api/streams/gate/detections", None)
            .map(|r| r.json().get("sequence").is_some())
            .unwrap_or(false)
    }));
    let detections = send(addr, "GET", "/api/streams/gate/detections", None)?.json();
    assert!(detections["detections"].is_array());
    assert!(detections["timestamp"].as_f64().unwrap() > 0.0);

    let snapshot = send(addr, "GET", "/api/streams/gate/snapshot", None)?;
    assert_eq!(snapshot.status, 200);
    assert!(snapshot.headers.contains("image/jpeg"));
    assert_eq!(&snapshot.body[..2], &[0xFF, 0xD8]);

    let deleted = send(addr, "DELETE", "/api/streams/gate", None)?;
    assert_eq!(deleted.status, 200);
    assert_eq!(deleted.json()["status"], "deleted");

    let gone = send(addr, "GET", "/api/streams/gate/status", None)?;
    assert_eq!(gone.status, 404);
    assert_eq!(gone.json()["reason"], "NotFound");
    assert!(api.registry.is_empty());
    Ok(())
}

#[test]
fn bad_create_requests_are_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();

    let missing_url = send(addr, "POST", "/api/streams", Some(r#"{"id": "x"}"#))?;
    assert_eq!(missing_url.status, 400);
    assert_eq!(missing_url.json()["error"], "invalid request: URL is required");

    let not_json = send(addr, "POST", "/api/streams", Some("url=stub://x"))?;
    assert_eq!(not_json.status, 400);
    assert_eq!(not_json.json()["reason"], "InvalidRequest");

    let unavailable = send(
        addr,
        "POST",
        "/api/streams",
        Some(r#"{"url": "/no/such/recording.mp4"}"#),
    )?;
    assert_eq!(unavailable.status, 400);
    assert_eq!(unavailable.json()["reason"], "SourceUnavailable");
    assert!(api.registry.is_empty());
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();

    assert_eq!(send(addr, "GET", "/api/nothing", None)?.status, 404);
    assert_eq!(send(addr, "DELETE", "/api/streams/ghost", None)?.status, 404);
    assert_eq!(send(addr, "GET", "/api/streams/ghost/snapshot", None)?.status, 404);
    assert_eq!(send(addr, "GET", "/api/streams/ghost/video_feed", None)?.status, 404);
    assert_eq!(send(addr, "PUT", "/api/streams", None)?.status, 405);
    assert_eq!(send(addr, "POST", "/api/streams/ghost/status", None)?.status, 405);
    assert_eq!(send(addr, "DELETE", "/api/stats", None)?.status, 405);
    Ok(())
}

#[test]
fn config_updates_apply_to_running_streams() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();
    send(
        addr,
        "POST",
        "/api/streams",
        Some(r#"{"url": "stub://dock", "id": "dock"}"#),
    )?;

    let config = send(addr, "GET", "/api/config", None)?.json();
    assert_eq!(config["motion"]["enabled"], true);
    assert_eq!(config["streams"]["dock"]["url"], "stub://dock");

    let updated = send(
        addr,
        "POST",
        "/api/config",
        Some(r#"{"motion": {"enabled": false, "threshold": 40}}"#),
    )?;
    assert_eq!(updated.status, 200);
    let updated = updated.json();
    assert_eq!(updated["motion"]["enabled"], false);
    assert_eq!(updated["motion"]["threshold"], 40);

    let status = send(addr, "GET", "/api/streams/dock/status", None)?.json();
    assert_eq!(status["motion_enabled"], false);

    let rejected = send(
        addr,
        "POST",
        "/api/config",
        Some(r#"{"detection": {"confidence": 2.0}}"#),
    )?;
    assert_eq!(rejected.status, 400);
    assert_eq!(
        api.registry.settings().detection,
        AnalysisSettings::default().detection
    );
    Ok(())
}

#[test]
fn stats_summarize_streams() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();
    for id in ["a", "b"] {
        let body = format!(r#"{{"url": "stub://{id}", "id": "{id}"}}"#);
        assert_eq!(send(addr, "POST", "/api/streams", Some(&body))?.status, 200);
    }
    let stats = send(addr, "GET", "/api/stats", None)?.json();
    assert_eq!(stats["total_streams"], 2);
    assert_eq!(stats["active_streams"], 2);
    assert_eq!(stats["streams"].as_array().unwrap().len(), 2);
    Ok(())
}

#[test]
fn video_feed_streams_jpeg_parts_until_stream_is_deleted() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();
    send(
        addr,
        "POST",
        "/api/streams",
        Some(r#"{"url": "stub://lane", "id": "lane"}"#),
    )?;

    let mut feed = TcpStream::connect(addr)?;
    feed.set_read_timeout(Some(Duration::from_secs(5)))?;
    feed.write_all(b"GET /api/streams/lane/video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while count_parts(&received) < 2 && Instant::now() < deadline {
        let n = feed.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(count_parts(&received) >= 2);

    // Deleting the stream ends the feed.
    assert_eq!(send(addr, "DELETE", "/api/streams/lane", None)?.status, 200);
    let mut rest = Vec::new();
    feed.read_to_end(&mut rest)?;
    Ok(())
}

fn count_parts(data: &[u8]) -> usize {
    let marker = b"Content-Type: image/jpeg";
    data.windows(marker.len()).filter(|w| *w == marker).count()
}
