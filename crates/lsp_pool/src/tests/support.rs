use super::*;

use std::path::{Path, PathBuf};

/// Fake language server speaking real `Content-Length` framing.
///
/// Behavior is selected by argv: `fake-lsp <mode> [delay_secs]`.
/// - `echo` (default): answers every request with a fixed definition array.
/// - `slow`: sleeps `delay_secs` before answering regular requests.
/// - `silent`: never answers regular requests (lifecycle still works).
/// - `crash`: exits with status 1 right after answering `initialize`.
/// - `chatty`: emits a server-to-client request and a `window/logMessage`
///   notification before every reply.
///
/// Any request with method `test/fail` is answered with a JSON-RPC error
/// envelope regardless of mode.
pub(super) const FAKE_SERVER: &str = r#"#!/usr/bin/env python3
import json
import sys
import time

mode = sys.argv[1] if len(sys.argv) > 1 else "echo"
delay = float(sys.argv[2]) if len(sys.argv) > 2 else 0.0

DEFINITION = [{"uri": "file:///a.ts", "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}}}]


def read_message():
    headers = {}
    while True:
        line = sys.stdin.buffer.readline()
        if not line:
            return None
        text = line.decode("utf-8").strip()
        if not text:
            break
        name, _, value = text.partition(":")
        headers[name.strip().lower()] = value.strip()
    length = int(headers.get("content-length", "0"))
    body = sys.stdin.buffer.read(length)
    if len(body) < length:
        return None
    return json.loads(body)


def send(payload):
    body = json.dumps(payload).encode("utf-8")
    sys.stdout.buffer.write(b"Content-Length: " + str(len(body)).encode() + b"\r\n\r\n")
    sys.stdout.buffer.write(body)
    sys.stdout.buffer.flush()


while True:
    msg = read_message()
    if msg is None:
        break
    method = msg.get("method")
    msg_id = msg.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"capabilities": {"definitionProvider": True}}})
        if mode == "crash":
            read_message()  # let the initialized notification land first
            sys.exit(1)
    elif method == "shutdown":
        send({"jsonrpc": "2.0", "id": msg_id, "result": None})
    elif method == "exit":
        sys.exit(0)
    elif msg_id is not None:
        if method == "test/fail":
            send({"jsonrpc": "2.0", "id": msg_id, "error": {"code": -32601, "message": "method not found"}})
            continue
        if mode == "silent":
            continue
        if mode == "slow" and delay > 0:
            time.sleep(delay)
        if mode == "chatty":
            send({"jsonrpc": "2.0", "id": 9001, "method": "workspace/configuration", "params": {"items": []}})
            send({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3, "message": "about to answer"}})
        send({"jsonrpc": "2.0", "id": msg_id, "result": DEFINITION})
"#;

/// The definition array the fake server answers with.
pub(super) fn expected_definition() -> serde_json::Value {
    serde_json::json!([{
        "uri": "file:///a.ts",
        "range": {
            "start": { "line": 0, "character": 0 },
            "end": { "line": 0, "character": 3 },
        },
    }])
}

pub(super) fn write_fake_server() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fake-lsp");
    std::fs::write(&path, FAKE_SERVER).expect("write fake server");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod fake server");
    }
    (dir, path)
}

/// Descriptor launching the fake server in the given mode.
pub(super) fn fake_descriptor(script: &Path, mode: &str) -> ServerDescriptor {
    ServerDescriptor::new(script.display().to_string()).arg(mode)
}

pub(super) fn fake_descriptor_with_delay(script: &Path, mode: &str, delay_secs: f64) -> ServerDescriptor {
    fake_descriptor(script, mode).arg(delay_secs.to_string())
}
