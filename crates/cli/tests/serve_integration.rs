//! Integration tests for the `leadrun serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port with
//! the memory backend (and dry-run stages unless it needs real stage
//! calls), makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

const SECRET: &str = "s3cret";

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from process ID so separate test binaries don't
/// collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Write a seed file into a fresh temp dir. The dir must outlive the server.
fn seed_file() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("clients.json");
    let seed = serde_json::json!({
        "clients": [
            {"clientId": "acme", "clientName": "Acme", "status": "Active", "serviceLevel": 2},
            {"clientId": "globex", "clientName": "Globex", "status": "Active", "stream": 2}
        ]
    });
    std::fs::write(&path, seed.to_string()).expect("write seed");
    (dir, path)
}

/// Helper: start `leadrun serve` on the given port.
fn start_server(port: u16, seed: &PathBuf) -> Child {
    start_server_with(port, seed, true, &[])
}

/// Helper: start `leadrun serve`, optionally against real stage endpoints,
/// with extra environment.
fn start_server_with(port: u16, seed: &PathBuf, dry_run: bool, env: &[(&str, &str)]) -> Child {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_leadrun"));
    cmd.args(["--backend", "memory", "--seed"]).arg(seed).arg("serve");
    if dry_run {
        cmd.arg("--dry-run");
    }
    cmd.arg("--port").arg(port.to_string());
    for var in [
        "BATCH_PROCESSING_STREAM",
        "SMART_RESUME_RUN_ID",
        "MAX_STREAMS",
        "API_PUBLIC_BASE_URL",
        "LEADRUN_BACKEND",
        "PORT",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("WEBHOOK_SECRET", SECRET);
    cmd.envs(env.iter().copied());
    // Redirect stdout/stderr to avoid blocking
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().expect("failed to start leadrun serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            return child;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    child
}

/// Helper: make an HTTP request and return (status, body).
fn http(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut header_lines = String::new();
    for (name, value) in headers {
        header_lines.push_str(&format!("{}: {}\r\n", name, value));
    }
    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\n{}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        header_lines,
        body.len(),
        body
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    parse_http_response(&response)
}

fn bearer() -> String {
    format!("Bearer {}", SECRET)
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status_line = headers.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    // Handle chunked transfer encoding
    let body = if headers.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        decode_chunked(&body)
    } else {
        body
    };

    (status, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining[chunk_end..].trim_start_matches("\r\n");
    }

    result
}

fn stop(mut child: Child) {
    child.kill().ok();
    child.wait().ok();
}

#[test]
fn health_needs_no_auth() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let (status, body) = http(port, "GET", "/health", &[], None);
    stop(child);

    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["status"], "ok");
    assert!(json.get("version").is_some());
}

#[test]
fn status_requires_the_secret() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let (missing, _) = http(port, "GET", "/smart-resume-status", &[], None);
    let (wrong, body) = http(
        port,
        "GET",
        "/smart-resume-status",
        &[("Authorization", "Bearer nope")],
        None,
    );
    stop(child);

    assert_eq!(missing, 401);
    assert_eq!(wrong, 401);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert!(json["error"].is_string());
}

#[test]
fn status_reports_an_idle_lock() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let auth = bearer();
    let (status, body) = http(
        port,
        "GET",
        "/smart-resume-status",
        &[("Authorization", auth.as_str())],
        None,
    );
    stop(child);

    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["locked"], false);
    assert_eq!(json["isStale"], false);
    assert!(json["currentJobId"].is_null());
}

#[test]
fn trigger_accepts_with_webhook_header() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let (status, body) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[("x-webhook-secret", SECRET)],
        Some(r#"{"stream": 2}"#),
    );
    stop(child);

    assert_eq!(status, 202, "body: {}", body);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["stream"], 2);
    let job_id = json["jobId"].as_str().expect("jobId");
    assert!(job_id.starts_with("smart_resume_"));
    assert!(job_id.ends_with("_stream2"));
    let run_id = json["runId"].as_str().expect("runId");
    assert_eq!(run_id.len(), 13);
}

#[test]
fn second_trigger_while_running_is_a_conflict() {
    // Stage endpoint that accepts connections and never answers, so the
    // first run holds the lock for the rest of the test.
    let stages = std::net::TcpListener::bind("127.0.0.1:0").expect("bind stage listener");
    let stage_url = format!("http://{}", stages.local_addr().expect("stage addr"));

    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server_with(
        port,
        &seed,
        false,
        &[
            ("API_PUBLIC_BASE_URL", stage_url.as_str()),
            ("STORAGE_TIMEOUT_SECS", "120"),
        ],
    );

    let auth = bearer();
    let (first, first_body) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[("Authorization", auth.as_str())],
        Some(r#"{"stream": 1}"#),
    );
    let (second, second_body) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[("Authorization", auth.as_str())],
        Some(r#"{"stream": 1}"#),
    );
    stop(child);
    drop(stages);

    assert_eq!(first, 202, "body: {}", first_body);
    let started: serde_json::Value = serde_json::from_str(&first_body).expect("valid JSON");
    assert_eq!(second, 409, "body: {}", second_body);
    let json: serde_json::Value = serde_json::from_str(&second_body).expect("valid JSON");
    assert!(json["error"].is_string());
    let job_id = json["jobId"].as_str().expect("jobId");
    assert!(job_id.starts_with("smart_resume_"));
    assert_eq!(json["jobId"], started["jobId"]);
    assert_eq!(json["ageMinutes"], 0);
}

#[test]
fn trigger_with_empty_body_uses_default_stream() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let auth = bearer();
    let (status, body) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[("Authorization", auth.as_str())],
        None,
    );
    stop(child);

    assert_eq!(status, 202, "body: {}", body);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["stream"], 1);
}

#[test]
fn trigger_rejects_out_of_range_stream() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let auth = bearer();
    let (status, body) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[("Authorization", auth.as_str())],
        Some(r#"{"stream": 7}"#),
    );
    stop(child);

    assert_eq!(status, 400);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert!(json["error"].as_str().unwrap().contains("stream 7"));
}

#[test]
fn trigger_rejects_malformed_body() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let auth = bearer();
    let (status, _) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[("Authorization", auth.as_str())],
        Some("{stream"),
    );
    stop(child);

    assert_eq!(status, 400);
}

#[test]
fn trigger_without_secret_is_unauthorized() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let (status, _) = http(
        port,
        "POST",
        "/smart-resume-client-by-client",
        &[],
        Some("{}"),
    );
    stop(child);

    assert_eq!(status, 401);
}

#[test]
fn reset_on_idle_lock() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let auth = bearer();
    let (status, body) = http(
        port,
        "POST",
        "/reset-smart-resume-lock",
        &[("Authorization", auth.as_str())],
        Some(r#"{"forceTerminate": true}"#),
    );
    stop(child);

    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["reset"], false);
    assert_eq!(json["terminated"], false);
    assert!(json["previousJobId"].is_null());
}

#[test]
fn unknown_route_is_404() {
    let port = next_port();
    let (_dir, seed) = seed_file();
    let child = start_server(port, &seed);

    let auth = bearer();
    let (status, _) = http(
        port,
        "GET",
        "/no-such-route",
        &[("Authorization", auth.as_str())],
        None,
    );
    stop(child);

    assert_eq!(status, 404);
}

#[test]
fn serve_without_secret_exits_with_config_code() {
    let (_dir, seed) = seed_file();
    let status = Command::new(env!("CARGO_BIN_EXE_leadrun"))
        .args(["--backend", "memory", "--seed"])
        .arg(&seed)
        .args(["serve", "--dry-run", "--port", "1"])
        .env_remove("WEBHOOK_SECRET")
        .env_remove("SMART_RESUME_RUN_ID")
        .env_remove("BATCH_PROCESSING_STREAM")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .expect("run leadrun");
    assert_eq!(status.code(), Some(3));
}
