//! Simple HTTP API for inspecting the running monitor.
//!
//! Plain `std::net::TcpListener`, one request per connection.
//! Endpoints:
//!
//! - `GET /monitor/health`   — liveness, ingest and publisher counters
//! - `GET /monitor/snapshot` — current telemetry snapshot (JSON)
//! - `GET /monitor/run`      — run state and the last finished run
//! - `GET /monitor/layout`   — active layout and pixel → {chip, channel} lookup
//! - `GET /monitor/layout/load?name=<layout>` — load a layout from the catalog

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use pixmon::layout::{LayoutCatalog, PixelTables};

use crate::SharedMonitor;

/// Runs the HTTP API server (blocking; run it on a dedicated thread).
pub fn run_api_server(listener: TcpListener, monitor: SharedMonitor, catalog: LayoutCatalog) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("accept error: {e}");
                continue;
            }
        };

        // Set a short read timeout so we don't block forever on slow clients
        let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));

        if let Err(e) = handle_request(&stream, &monitor, &catalog) {
            tracing::debug!("request error: {e}");
        }
    }
}

/// Parses an HTTP request and dispatches to the appropriate handler.
fn handle_request(
    stream: &TcpStream,
    monitor: &SharedMonitor,
    catalog: &LayoutCatalog,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Parse: "GET /path?query HTTP/1.x"
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_response(stream, 400, r#"{"error":"bad request"}"#);
    }

    let (path, query) = match parts[1].split_once('?') {
        Some((p, q)) => (p, q),
        None => (parts[1], ""),
    };

    // Drain remaining headers (we don't need them)
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }
    }

    match path {
        "/monitor/health" => handle_health(stream, monitor),
        "/monitor/snapshot" => handle_snapshot(stream, monitor),
        "/monitor/run" => handle_run(stream, monitor),
        "/monitor/layout" => handle_layout(stream, monitor),
        "/monitor/layout/load" => handle_layout_load(stream, monitor, catalog, query),
        _ => send_response(stream, 404, r#"{"error":"not found"}"#),
    }
}

/// `GET /monitor/health` — liveness plus counters.
fn handle_health(
    stream: &TcpStream,
    monitor: &SharedMonitor,
) -> Result<(), Box<dyn std::error::Error>> {
    let m = monitor.lock().map_err(|e| format!("lock: {e}"))?;
    let agg = m.aggregator();

    let body = serde_json::json!({
        "status": "ok",
        "ingest": agg.stats(),
        "publisher": m.publisher().health(),
        "live_buckets": agg.live_buckets(),
        "records": agg.record_count(),
    });

    send_response(stream, 200, &body.to_string())
}

/// `GET /monitor/snapshot` — the telemetry a display would receive.
fn handle_snapshot(
    stream: &TcpStream,
    monitor: &SharedMonitor,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = monitor.lock().map_err(|e| format!("lock: {e}"))?.snapshot();
    send_response(stream, 200, &serde_json::to_string(&snapshot)?)
}

/// `GET /monitor/run` — run bookkeeping.
fn handle_run(
    stream: &TcpStream,
    monitor: &SharedMonitor,
) -> Result<(), Box<dyn std::error::Error>> {
    let m = monitor.lock().map_err(|e| format!("lock: {e}"))?;

    let body = serde_json::json!({
        "state": m.lifecycle().state(),
        "run": m.aggregator().run_state(),
        "last_run": m.lifecycle().last_run(),
    });

    send_response(stream, 200, &body.to_string())
}

/// `GET /monitor/layout` — the active layout and its chip lookup.
fn handle_layout(
    stream: &TcpStream,
    monitor: &SharedMonitor,
) -> Result<(), Box<dyn std::error::Error>> {
    let tables = monitor
        .lock()
        .map_err(|e| format!("lock: {e}"))?
        .aggregator()
        .pixels()
        .tables();
    send_response(stream, 200, &serde_json::to_string(&tables.report())?)
}

/// `GET /monitor/layout/load?name=<layout>` — builds the named layout and
/// swaps it in.
fn handle_layout_load(
    stream: &TcpStream,
    monitor: &SharedMonitor,
    catalog: &LayoutCatalog,
    query: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = parse_query(query);
    let Some(name) = params.get("name") else {
        return send_response(stream, 400, r#"{"error":"missing 'name' parameter"}"#);
    };

    let pixel_count = monitor
        .lock()
        .map_err(|e| format!("lock: {e}"))?
        .aggregator()
        .pixels()
        .pixel_count();

    // Build outside the lock; the loop keeps ingesting against the old tables.
    let tables = match catalog
        .load(name)
        .and_then(|layout| PixelTables::build(layout, pixel_count))
    {
        Ok(tables) => Arc::new(tables),
        Err(e) => {
            tracing::warn!(layout = %name, error = %e, "layout load rejected");
            let body = serde_json::json!({ "error": e.to_string() });
            return send_response(stream, 422, &body.to_string());
        }
    };

    monitor
        .lock()
        .map_err(|e| format!("lock: {e}"))?
        .aggregator_mut()
        .replace_layout(Arc::clone(&tables));

    send_response(stream, 200, &serde_json::to_string(&tables.report())?)
}

/// Sends a JSON HTTP response.
fn send_response(
    mut stream: &TcpStream,
    status: u16,
    body: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    write!(
        stream,
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    )?;

    Ok(())
}

/// Parses a query string into key-value pairs.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Mutex;

    use pixmon::monitor::MonitorLoop;
    use pixmon::publish::MemorySink;
    use pixmon::{MonitorConfig, SystemClock};
    use tempfile::tempdir;

    use crate::sink::spawn_publisher;

    fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(stream, "GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_endpoints() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("layout-small.json"),
            r#"{"name": "small", "chips": [[5, [10, 11]]]}"#,
        )
        .unwrap();

        let (sink, _publisher) = spawn_publisher(MemorySink::new()).unwrap();
        let monitor = MonitorLoop::new(MonitorConfig::default(), sink, SystemClock).unwrap();
        let monitor: SharedMonitor = Arc::new(Mutex::new(monitor));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let catalog = LayoutCatalog::new(dir.path());
        let shared = Arc::clone(&monitor);
        std::thread::spawn(move || run_api_server(listener, shared, catalog));

        let health = get(addr, "/monitor/health");
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        assert!(health.contains(r#""status":"ok""#));

        let snapshot = get(addr, "/monitor/snapshot");
        assert!(snapshot.contains(r#""rate_bypixel""#));

        let loaded = get(addr, "/monitor/layout/load?name=small");
        assert!(loaded.starts_with("HTTP/1.1 200 OK"));
        assert!(loaded.contains(r#""1-1-5""#));
        assert_eq!(
            monitor
                .lock()
                .unwrap()
                .aggregator()
                .pixels()
                .tables()
                .mapped_pixels(),
            2
        );

        let missing = get(addr, "/monitor/layout/load?name=nope");
        assert!(missing.starts_with("HTTP/1.1 422"));

        let run = get(addr, "/monitor/run");
        assert!(run.contains(r#""state":"not_running""#));

        assert!(get(addr, "/nowhere").starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("name=v2a&x=1&&flag");
        assert_eq!(params.get("name").map(String::as_str), Some("v2a"));
        assert_eq!(params.get("x").map(String::as_str), Some("1"));
        assert!(!params.contains_key("flag"));
    }
}
