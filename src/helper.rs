//! Transport to the privileged helper.
//!
//! The helper is started through `pkexec`, receives one JSON request on
//! stdin and answers with JSON lines on stdout. Lines tagged
//! `{"type":"log"}` are progress chatter and get forwarded to the log; the
//! last other line is the reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};
use crate::protocol::{OperationResult, ResultCode};

pub const HELPER_BINARY: &str = "lindy_helper";
pub const ELEVATION_PROGRAM: &str = "pkexec";
/// Payload keys naming the mount table and ownership ledger the helper
/// should work on.
pub const FSTAB_PATH_KEY: &str = "fstabPath";
pub const LEDGER_DIR_KEY: &str = "ledgerDir";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperRequest {
    pub action: String,
    pub payload: Value,
}

impl HelperRequest {
    pub fn new(action: &str, payload: Value) -> Self {
        Self {
            action: action.to_string(),
            payload,
        }
    }
}

/// The parsed reply plus the raw process streams.
#[derive(Debug, Clone, PartialEq)]
pub struct HelperReply {
    pub response: Value,
    pub stderr: String,
    pub stdout: String,
}

/// Seam between the protocols and the elevated process.
pub trait PrivilegedHelper: Send + Sync {
    fn invoke(&self, request: &HelperRequest) -> Result<HelperReply>;
}

/// Runs one request and folds every transport failure into an
/// [`OperationResult`].
pub fn call(helper: &dyn PrivilegedHelper, request: &HelperRequest) -> OperationResult {
    match call_value(helper, request) {
        Ok(reply) => match serde_json::from_value::<OperationResult>(reply.response.clone()) {
            Ok(mut result) => {
                result.stderr = merge_stream(&result.stderr, &reply.stderr);
                result.stdout = merge_stream(&result.stdout, &reply.stdout);
                result
            }
            Err(err) => OperationResult::error(
                ResultCode::Other("unrecognized_response".to_string()),
                format!("unrecognized helper response: {err}"),
            )
            .with_output(reply.stderr, reply.stdout),
        },
        Err(result) => result,
    }
}

/// Appends process output the reply didn't already carry. JSON lines (the
/// helper's log lines and the reply itself) are already accounted for.
fn merge_stream(reported: &str, raw: &str) -> String {
    let raw = raw
        .lines()
        .filter(|line| !is_json_line(line))
        .collect::<Vec<_>>()
        .join("\n");
    let raw = raw.trim();
    if raw.is_empty() || reported.contains(raw) {
        return reported.to_string();
    }
    if reported.trim().is_empty() {
        return raw.to_string();
    }
    format!("{}\n{raw}", reported.trim_end())
}

fn is_json_line(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('{') && serde_json::from_str::<Value>(line).is_ok()
}

/// Like [`call`] but leaves the reply shape to the caller.
pub fn call_value(helper: &dyn PrivilegedHelper, request: &HelperRequest) -> std::result::Result<HelperReply, OperationResult> {
    log::info!("helper action {}", request.action);
    helper.invoke(request).map_err(|err| {
        log::warn!("helper action {} failed: {err}", request.action);
        transport_failure(err)
    })
}

/// Mechanism-unavailable versus mechanism-ran-but-failed.
pub fn transport_failure(err: Error) -> OperationResult {
    match err {
        Error::HelperNotFound | Error::Spawn(_) => {
            OperationResult::error(ResultCode::SpawnPkexecFailed, format!("failed to spawn pkexec: {err}"))
        }
        Error::HelperFailed {
            status,
            stderr,
            stdout,
        } => OperationResult::error(
            ResultCode::PkexecFailed,
            format!("pkexec exited with code {status:?}"),
        )
        .with_output(stderr, stdout),
        other => OperationResult::error(ResultCode::PkexecFailed, other.to_string()),
    }
}

/// Helper launched via an elevation program, searched for in a fixed list
/// of candidate locations.
#[derive(Debug, Clone)]
pub struct PkexecHelper {
    elevation_program: PathBuf,
    candidates: Vec<PathBuf>,
    table_paths: Option<(String, String)>,
}

impl PkexecHelper {
    pub fn new(configured: Option<PathBuf>, resource_dir: Option<PathBuf>) -> Self {
        Self {
            elevation_program: PathBuf::from(ELEVATION_PROGRAM),
            candidates: helper_paths(configured, resource_dir),
            table_paths: None,
        }
    }

    /// Every request names this mount table and ledger directory.
    pub fn with_table_paths(mut self, fstab_path: impl Into<String>, ledger_dir: impl Into<String>) -> Self {
        self.table_paths = Some((fstab_path.into(), ledger_dir.into()));
        self
    }

    fn payload_for(&self, request: &HelperRequest) -> HelperRequest {
        let mut request = request.clone();
        if let (Some((fstab, ledger)), Some(payload)) = (&self.table_paths, request.payload.as_object_mut()) {
            payload.insert(FSTAB_PATH_KEY.to_string(), Value::from(fstab.as_str()));
            payload.insert(LEDGER_DIR_KEY.to_string(), Value::from(ledger.as_str()));
        }
        request
    }

    #[cfg(test)]
    fn with_elevation_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.elevation_program = program.into();
        self
    }

    pub fn resolve(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|path| path.is_file()).cloned()
    }
}

fn helper_paths(configured: Option<PathBuf>, resource_dir: Option<PathBuf>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = configured {
        paths.push(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join(HELPER_BINARY));
        }
    }
    if let Some(dir) = resource_dir {
        paths.push(dir.join("helper").join(HELPER_BINARY));
    }
    paths.push(PathBuf::from("/usr/lib/lindy").join(HELPER_BINARY));
    paths.push(PathBuf::from("/usr/local/bin").join(HELPER_BINARY));
    paths
}

impl PrivilegedHelper for PkexecHelper {
    fn invoke(&self, request: &HelperRequest) -> Result<HelperReply> {
        let path = self.resolve().ok_or(Error::HelperNotFound)?;
        let request_json = serde_json::to_vec(&self.payload_for(request))?;

        let mut child = Command::new(&self.elevation_program)
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            // the exit status and output decide, even if the helper hung up early
            if let Err(err) = stdin.write_all(&request_json) {
                log::warn!("helper stdin write failed: {err}");
            }
        }

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        match parse_reply(&stdout) {
            Some(response) => Ok(HelperReply {
                response,
                stderr,
                stdout,
            }),
            None if !output.status.success() => Err(Error::HelperFailed {
                status: output.status.code(),
                stderr,
                stdout,
            }),
            None => Err(Error::InvalidResponse("no helper response".to_string())),
        }
    }
}

/// Forwards log lines and returns the last JSON value that isn't one.
pub fn parse_reply(stdout: &str) -> Option<Value> {
    let mut last = None;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(|v| v.as_str()) == Some("log") {
            let source = value.get("source").and_then(|v| v.as_str()).unwrap_or("helper");
            let text = value.get("line").and_then(|v| v.as_str()).unwrap_or_default();
            log::debug!("[{source}] {text}");
            continue;
        }
        last = Some(value);
    }
    last
}
