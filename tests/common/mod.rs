//! Common test helpers: scripted language servers run by `sh`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use jusu_lsp::lsp::{LaunchConfig, StderrMode};
use serde_json::{Value, json};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a shell script that plays a language server.
///
/// The script cannot parse frames, so it paces itself on line reads: the
/// first `read` returns once the first frame's header arrived, and every
/// later frame is reached after two more reads (the blank separator line,
/// then the previous body glued to the next header). Request ids are
/// assigned from 1 in send order, so replies can be scripted up front.
#[derive(Debug, Default)]
pub struct ScriptedServer {
    lines: Vec<String>,
    frames_seen: usize,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the next client frame has arrived; exits on EOF.
    pub fn await_frame(mut self) -> Self {
        let reads = if self.frames_seen == 0 { 1 } else { 2 };
        for _ in 0..reads {
            self.lines.push("read -r line || exit 0".to_string());
        }
        self.frames_seen += 1;
        self
    }

    /// Writes one framed message to stdout.
    pub fn send(mut self, message: &Value) -> Self {
        let body = serde_json::to_string(message).unwrap();
        assert!(!body.contains('\''), "script messages must not contain quotes");
        self.lines.push(format!(
            "printf 'Content-Length: {}\\r\\n\\r\\n%s' '{body}'",
            body.len()
        ));
        self
    }

    pub fn respond(self, id: u64, result: &Value) -> Self {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    pub fn respond_error(self, id: u64, code: i64, message: &str) -> Self {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }))
    }

    pub fn notify(self, method: &str, params: &Value) -> Self {
        self.send(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
    }

    /// Answers `initialize` (id 1) and consumes `initialized`.
    pub fn initialize(self) -> Self {
        self.await_frame()
            .respond(
                1,
                &json!({
                    "capabilities": {
                        "textDocumentSync": 1,
                        "hoverProvider": true,
                        "completionProvider": {}
                    },
                    "serverInfo": {"name": "jusu-test-server", "version": "0.0.1"}
                }),
            )
            .await_frame()
    }

    /// Answers `shutdown` with the given id, waits for `exit`, then exits.
    pub fn shutdown(self, id: u64) -> Self {
        self.await_frame()
            .respond(id, &Value::Null)
            .await_frame()
            .run("exit 0")
    }

    /// Appends a raw shell line.
    pub fn run(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn script(&self) -> String {
        let mut script = self.lines.join("\n");
        script.push('\n');
        script
    }

    /// Writes the script as `server.sh` under `dir`.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join("server.sh");
        std::fs::write(&path, self.script()).unwrap();
        path
    }

    /// Launch configuration running the script with `sh`.
    pub fn launch_config(&self, dir: &Path) -> LaunchConfig {
        LaunchConfig::new("sh")
            .arg(self.write_to(dir).to_string_lossy())
            .stderr(StderrMode::Capture)
    }
}

/// Whether a process with this id is still running.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// A `.jusu` document on disk.
pub fn write_document(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}
