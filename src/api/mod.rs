//! HTTP surface over the stream registry.
//!
//! A plain `TcpListener` accept loop with one short-lived thread per
//! connection. Every response closes the connection; the video feed keeps
//! its connection open until the pipeline stops, the client goes away or the
//! server shuts down.

use crate::config::SettingsPatch;
use crate::delivery;
use crate::error::StreamError;
use crate::registry::StreamRegistry;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<StreamRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<StreamRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("stream api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let registry = self.registry;
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, registry, shutdown_thread) {
                    log::error!("stream api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    registry: Arc<StreamRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let registry = Arc::clone(&registry);
                let shutdown = Arc::clone(&shutdown);
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &registry, &shutdown) {
                            log::warn!("stream api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("stream api could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateStreamRequest {
    url: Option<String>,
    id: Option<String>,
}

fn handle_connection(
    mut stream: TcpStream,
    registry: &StreamRegistry,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = request.method.as_str();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => write_json(&mut stream, 200, &json!({"status": "ok"})),

        ("GET", ["api", "streams"]) => write_json(&mut stream, 200, &json!(registry.list())),
        ("POST", ["api", "streams"]) => {
            let body: CreateStreamRequest = match serde_json::from_slice(&request.body) {
                Ok(body) => body,
                Err(err) => {
                    return write_error(
                        &mut stream,
                        &StreamError::InvalidRequest(format!("body must be JSON: {err}")),
                    )
                }
            };
            let Some(url) = body.url else {
                return write_error(
                    &mut stream,
                    &StreamError::InvalidRequest("URL is required".to_string()),
                );
            };
            match registry.create(body.id.as_deref(), &url) {
                Ok(id) => write_json(&mut stream, 200, &json!({"id": id, "status": "started"})),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        (_, ["api", "streams"]) => write_method_not_allowed(&mut stream),

        ("DELETE", ["api", "streams", id]) => match registry.delete(id) {
            Ok(()) => write_json(&mut stream, 200, &json!({"status": "deleted"})),
            Err(err) => write_error(&mut stream, &err),
        },
        (_, ["api", "streams", _]) => write_method_not_allowed(&mut stream),

        ("GET", ["api", "streams", id, "status"]) => match registry.get(id) {
            Ok(status) => write_json(&mut stream, 200, &json!(status)),
            Err(err) => write_error(&mut stream, &err),
        },
        ("GET", ["api", "streams", id, "detections"]) => match registry.latest_result(id) {
            Ok(Some(result)) => write_json(&mut stream, 200, &json!(result.as_ref())),
            Ok(None) => write_json(&mut stream, 200, &json!({"detections": []})),
            Err(err) => write_error(&mut stream, &err),
        },
        ("GET", ["api", "streams", id, "snapshot"]) => match registry.snapshot_jpeg(id) {
            Ok(jpeg) => write_response(&mut stream, 200, "image/jpeg", &jpeg),
            Err(err) => match err.downcast_ref::<StreamError>() {
                Some(stream_err) => write_error(&mut stream, stream_err),
                None => {
                    log::error!("snapshot for {} failed: {:#}", id, err);
                    write_json(&mut stream, 500, &json!({"error": "snapshot failed"}))
                }
            },
        },
        ("GET", ["api", "streams", id, "video_feed"]) => {
            serve_video_feed(&mut stream, registry, id, shutdown)
        }
        (_, ["api", "streams", _, "status" | "detections" | "snapshot" | "video_feed"]) => {
            write_method_not_allowed(&mut stream)
        }

        ("GET", ["api", "config"]) => write_json(&mut stream, 200, &config_view(registry)),
        ("POST", ["api", "config"]) => {
            let patch: SettingsPatch = match serde_json::from_slice(&request.body) {
                Ok(patch) => patch,
                Err(err) => {
                    return write_error(
                        &mut stream,
                        &StreamError::InvalidRequest(format!("body must be JSON: {err}")),
                    )
                }
            };
            match registry.update_settings(patch) {
                Ok(_) => write_json(&mut stream, 200, &config_view(registry)),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        (_, ["api", "config"]) => write_method_not_allowed(&mut stream),

        ("GET", ["api", "stats"]) => write_json(&mut stream, 200, &json!(registry.stats())),
        (_, ["api", "stats"]) => write_method_not_allowed(&mut stream),

        _ => write_json(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

/// Shared detection settings plus the configured streams.
fn config_view(registry: &StreamRegistry) -> Value {
    let settings = registry.settings();
    let streams: serde_json::Map<String, Value> = registry
        .list()
        .into_iter()
        .map(|status| (status.id, json!({"url": status.url})))
        .collect();
    json!({
        "detection": settings.detection,
        "motion": settings.motion,
        "streams": streams,
    })
}

fn serve_video_feed(
    stream: &mut TcpStream,
    registry: &StreamRegistry,
    id: &str,
    shutdown: &AtomicBool,
) -> Result<()> {
    let pipeline = match registry.pipeline(id) {
        Ok(pipeline) => pipeline,
        Err(err) => return write_error(stream, &err),
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        delivery::feed_content_type()
    );
    stream.write_all(header.as_bytes())?;

    let mut parts: u64 = 0;
    while pipeline.is_running() && !shutdown.load(Ordering::SeqCst) {
        let view = delivery::current_view(&pipeline);
        let jpeg = delivery::encode_jpeg(&view, delivery::JPEG_QUALITY)?;
        if let Err(err) = stream.write_all(&delivery::feed_part(&jpeg)) {
            log::debug!("video feed for {} closed by client after {} parts: {}", id, parts, err);
            return Ok(());
        }
        parts += 1;
        std::thread::sleep(delivery::FEED_INTERVAL);
    }
    log::debug!("video feed for {} ended after {} parts", id, parts);
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
        if !data.windows(4).any(|w| w == b"\r\n\r\n") && data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        write_json(stream, 413, &json!({"error": "payload_too_large"}))?;
        return Err(anyhow!("request body too large ({} bytes)", content_length));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, err: &StreamError) -> Result<()> {
    log::warn!("stream api: {}", err);
    write_json(
        stream,
        err.http_status(),
        &json!({"error": err.to_string(), "reason": err.reason()}),
    )
}

fn write_method_not_allowed(stream: &mut TcpStream) -> Result<()> {
    write_json(stream, 405, &json!({"error": "method_not_allowed"}))
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
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
    body: Vec<u8>,
}
