//! Integration tests for `stategraph serve`.
//!
//! Each test starts the server as a child process on a unique port with a
//! fresh SQLite file, speaks raw HTTP/1.1 to it, and checks the responses.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

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

struct Server {
    child: Child,
    port: u16,
    _dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// Helper: start `stategraph serve` on a fresh port and database.
fn start_server() -> Server {
    start_server_with_config(None)
}

/// Like [`start_server`], with `config` written to a TOML file and passed
/// as `--config`.
fn start_server_with_config(config: Option<&str>) -> Server {
    let port = next_port();
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("stategraph.db");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_stategraph"));
    cmd.arg("serve");
    if let Some(config) = config {
        let path = dir.path().join("stategraph.toml");
        std::fs::write(&path, config).expect("write config");
        cmd.arg("--config").arg(path);
    }
    cmd.arg("--port")
        .arg(port.to_string())
        .arg("--db")
        .arg(&db)
        .env_remove("STATEGRAPH_CONFIG")
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let child = cmd.spawn().expect("failed to start stategraph serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server {
        child,
        port,
        _dir: dir,
    }
}

/// Helper: send one request and return (status, body).
fn request(port: u16, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    stream
        .write_all(request.as_bytes())
        .expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

fn get(port: u16, path: &str) -> (u16, String) {
    request(port, "GET", path, "")
}

fn json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|e| panic!("invalid JSON body {body:?}: {e}"))
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status = headers
        .lines()
        .next()
        .unwrap_or("")
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let body = if headers
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked")
    {
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
        let chunk_end = (chunk_start + size).min(remaining.len());
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining.get(chunk_end + 2..).unwrap_or("");
    }
    result
}

fn create_state(port: u16, logic_id: &str) -> String {
    let (status, body) = request(
        port,
        "POST",
        "/api/v1/states",
        &format!(r#"{{"logic_id":"{logic_id}"}}"#),
    );
    assert_eq!(status, 201, "create {logic_id}: {body}");
    json(&body)["guid"].as_str().expect("guid").to_string()
}

fn tfstate(serial: i64, outputs: &[(&str, &str)]) -> String {
    let outputs: serde_json::Map<String, Value> = outputs
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                serde_json::json!({"value": v, "type": "string"}),
            )
        })
        .collect();
    serde_json::json!({
        "version": 4,
        "terraform_version": "1.9.0",
        "serial": serial,
        "lineage": "3f1c2a4e-8d7b-4c9e-a1f0-5b6d7e8f9a0b",
        "outputs": outputs,
        "resources": [],
    })
    .to_string()
}

fn lock_body(id: &str) -> String {
    serde_json::json!({
        "ID": id,
        "Operation": "OperationTypeApply",
        "Who": "ci@runner",
        "Version": "1.9.0",
    })
    .to_string()
}

#[test]
fn health_returns_200_with_version() {
    let server = start_server();
    let (status, body) = get(server.port, "/health");
    assert_eq!(status, 200);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn unknown_route_is_json_404() {
    let server = start_server();
    let (status, body) = get(server.port, "/nope");
    assert_eq!(status, 404);
    assert_eq!(json(&body)["error"], "not found");
}

#[test]
fn tfstate_round_trip() {
    let server = start_server();
    let guid = create_state(server.port, "network");
    let path = format!("/tfstate/{guid}");

    let (status, _) = get(server.port, &path);
    assert_eq!(status, 404, "fresh state has no content");

    let doc = tfstate(1, &[("vpc_id", "vpc-123")]);
    let (status, body) = request(server.port, "POST", &path, &doc);
    assert_eq!(status, 200, "{body}");

    let (status, body) = get(server.port, &path);
    assert_eq!(status, 200);
    let stored = json(&body);
    assert_eq!(stored["serial"], 1);
    assert_eq!(stored["outputs"]["vpc_id"]["value"], "vpc-123");

    let (status, body) = get(server.port, &format!("/api/v1/states/{guid}"));
    assert_eq!(status, 200);
    let info = json(&body);
    assert_eq!(info["state"]["serial"], 1);
    assert!(info["backend"]["address"]
        .as_str()
        .unwrap()
        .ends_with(&path));
}

#[test]
fn malformed_upload_is_rejected() {
    let server = start_server();
    let guid = create_state(server.port, "broken");
    let (status, _) = request(server.port, "POST", &format!("/tfstate/{guid}"), "{not json");
    assert_eq!(status, 400);
    let (status, _) = get(server.port, &format!("/tfstate/{guid}"));
    assert_eq!(status, 404);
}

#[test]
fn upload_to_unknown_state_is_404() {
    let server = start_server();
    let (status, _) = request(
        server.port,
        "POST",
        "/tfstate/0190a1b2-0000-7000-8000-000000000099",
        &tfstate(1, &[]),
    );
    assert_eq!(status, 404);
}

#[test]
fn lock_and_unlock_with_custom_verbs() {
    let server = start_server();
    let guid = create_state(server.port, "app");
    let lock_path = format!("/tfstate/{guid}/lock");
    let unlock_path = format!("/tfstate/{guid}/unlock");

    let (status, body) = request(server.port, "LOCK", &lock_path, &lock_body("lock-1"));
    assert_eq!(status, 200, "{body}");

    // Second lock reports the holder.
    let (status, body) = request(server.port, "LOCK", &lock_path, &lock_body("lock-2"));
    assert_eq!(status, 423);
    assert_eq!(json(&body)["ID"], "lock-1");

    // Writes must carry the holder's id.
    let doc = tfstate(1, &[]);
    let (status, _) = request(server.port, "POST", &format!("/tfstate/{guid}"), &doc);
    assert_eq!(status, 409);
    let (status, body) = request(
        server.port,
        "POST",
        &format!("/tfstate/{guid}?ID=lock-1"),
        &doc,
    );
    assert_eq!(status, 200, "{body}");

    let (status, _) = request(server.port, "UNLOCK", &unlock_path, &lock_body("lock-2"));
    assert_eq!(status, 409);
    let (status, body) = request(server.port, "UNLOCK", &unlock_path, &lock_body("lock-1"));
    assert_eq!(status, 200, "{body}");

    let (status, body) = request(server.port, "LOCK", &lock_path, &lock_body("lock-3"));
    assert_eq!(status, 200, "{body}");
}

#[test]
fn unconfigured_verbs_are_405() {
    let server = start_server();
    let guid = create_state(server.port, "verbs");
    let (status, _) = request(
        server.port,
        "PUT",
        &format!("/tfstate/{guid}/lock"),
        &lock_body("x"),
    );
    assert_eq!(status, 405);
    let (status, _) = request(server.port, "DELETE", &format!("/tfstate/{guid}"), "");
    assert_eq!(status, 405);
}

#[test]
fn dependency_flow_tracks_edge_status() {
    let server = start_server();
    let port = server.port;
    let network = create_state(port, "network");
    let app = create_state(port, "app");

    let (status, _) = request(
        port,
        "POST",
        &format!("/tfstate/{network}"),
        &tfstate(1, &[("vpc_id", "vpc-1")]),
    );
    assert_eq!(status, 200);

    let dep = serde_json::json!({
        "from_guid": network,
        "from_output": "vpc_id",
        "to_guid": app,
    })
    .to_string();
    let (status, body) = request(port, "POST", "/api/v1/dependencies", &dep);
    assert_eq!(status, 201, "{body}");
    let added = json(&body);
    assert_eq!(added["edge"]["to_input_name"], "vpc_id");
    assert_eq!(added["edge"]["status"], "dirty");
    let edge_id = added["edge"]["id"].as_i64().unwrap();

    let (status, body) = request(port, "POST", "/api/v1/dependencies", &dep);
    assert_eq!(status, 200);
    assert_eq!(json(&body)["already_exists"], true);

    // Consumer applies and picks up the output.
    let (status, _) = request(port, "POST", &format!("/tfstate/{app}"), &tfstate(1, &[]));
    assert_eq!(status, 200);
    let (_, body) = get(port, &format!("/api/v1/states/{app}/status"));
    assert_eq!(json(&body)["status"], "clean");

    // Producer changes the output.
    let (status, _) = request(
        port,
        "POST",
        &format!("/tfstate/{network}"),
        &tfstate(2, &[("vpc_id", "vpc-2")]),
    );
    assert_eq!(status, 200);
    let (_, body) = get(port, &format!("/api/v1/states/{app}/status"));
    assert_eq!(json(&body)["status"], "stale");

    let (status, body) = get(
        port,
        &format!("/api/v1/states/{app}/topology?direction=upstream"),
    );
    assert_eq!(status, 200);
    let topo = json(&body);
    assert_eq!(topo["layers"][0]["states"][0]["guid"], network.as_str());

    let (status, _) = request(port, "DELETE", &format!("/api/v1/dependencies/{edge_id}"), "");
    assert_eq!(status, 204);
    let (_, body) = get(port, &format!("/api/v1/states/{app}/dependencies"));
    assert_eq!(json(&body)["edges"].as_array().unwrap().len(), 0);
}

#[test]
fn cycle_is_rejected_over_http() {
    let server = start_server();
    let port = server.port;
    let a = create_state(port, "a");
    let b = create_state(port, "b");
    let edge = |from: &str, to: &str| {
        serde_json::json!({"from_guid": from, "from_output": "out", "to_guid": to}).to_string()
    };

    let (status, _) = request(port, "POST", "/api/v1/dependencies", &edge(&a, &b));
    assert_eq!(status, 201);
    let (status, body) = request(port, "POST", "/api/v1/dependencies", &edge(&b, &a));
    assert_eq!(status, 400, "{body}");
    assert_eq!(json(&body)["code"], "invalid_argument");
}

#[test]
fn list_states_filters_by_label() {
    let server = start_server();
    let port = server.port;
    for (logic_id, env) in [("net-prod", "prod"), ("net-dev", "dev")] {
        let body = serde_json::json!({"logic_id": logic_id, "labels": {"env": env}}).to_string();
        let (status, _) = request(port, "POST", "/api/v1/states", &body);
        assert_eq!(status, 201);
    }

    let (status, body) = get(port, "/api/v1/states?label.env=prod");
    assert_eq!(status, 200);
    let page = json(&body);
    let states = page["states"].as_array().unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0]["logic_id"], "net-prod");

    let (status, _) = get(port, "/api/v1/states?page_size=abc");
    assert_eq!(status, 400);
}

#[test]
fn put_serves_both_lock_and_unlock() {
    let server = start_server_with_config(Some(
        "[tfstate]\nlock_methods = [\"PUT\"]\nunlock_methods = [\"PUT\"]\n",
    ));
    let guid = create_state(server.port, "shared-verbs");
    let lock_path = format!("/tfstate/{guid}/lock");
    let unlock_path = format!("/tfstate/{guid}/unlock");

    let (status, body) = request(server.port, "PUT", &lock_path, &lock_body("lock-1"));
    assert_eq!(status, 200, "{body}");
    let (status, body) = request(server.port, "PUT", &lock_path, &lock_body("lock-2"));
    assert_eq!(status, 423, "{body}");

    let (status, body) = request(server.port, "PUT", &unlock_path, &lock_body("lock-1"));
    assert_eq!(status, 200, "{body}");
    let (status, body) = request(server.port, "PUT", &lock_path, &lock_body("lock-2"));
    assert_eq!(status, 200, "{body}");

    let (status, _) = request(server.port, "LOCK", &lock_path, &lock_body("lock-3"));
    assert_eq!(status, 405);
}
