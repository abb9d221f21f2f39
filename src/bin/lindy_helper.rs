//! Privileged side of lindy. Started through pkexec with one JSON request on
//! stdin; answers with `{"type":"log"}` progress lines followed by a single
//! reply line on stdout. Never writes to stderr.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::Command;

use lindy_lib::fstab::mount_points;
use lindy_lib::helper::HelperRequest;
use lindy_lib::partitions::{list_partitions, Partition};
use lindy_lib::privileged::{invalid, CommandOutput, Executor, SystemOps};
use lindy_lib::protocol::ResultCode;

/// The real system.
struct HostOps;

impl SystemOps for HostOps {
    /// Runs a system command, echoing its output as log lines.
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        emit_log(program, &format!("{program} {}", args.join(" ")));
        match Command::new(program).args(args).output() {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                for line in stdout.lines().chain(stderr.lines()) {
                    emit_log(program, line);
                }
                CommandOutput {
                    ok: output.status.success(),
                    stdout,
                    stderr,
                }
            }
            Err(err) => CommandOutput {
                ok: false,
                stdout: String::new(),
                stderr: format!("{program}: {err}"),
            },
        }
    }

    fn mount_points(&self) -> HashSet<String> {
        fs::read_to_string("/proc/mounts")
            .map(|text| mount_points(&text))
            .unwrap_or_default()
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list_partitions(&self) -> lindy_lib::Result<Vec<Partition>> {
        list_partitions()
    }

    fn log(&self, source: &str, line: &str) {
        emit_log(source, line);
    }
}

fn main() {
    let mut input = String::new();
    if io::stdin().read_to_string(&mut input).is_err() {
        write_response(&invalid("Failed to read request"));
        return;
    }

    let request: HelperRequest = match serde_json::from_str(&input) {
        Ok(req) => req,
        Err(err) => {
            write_response(&invalid(format!("Invalid request: {err}")));
            return;
        }
    };

    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        write_response(&json!({
            "status": "error",
            "code": ResultCode::PkexecFailed.as_str(),
            "message": "lindy_helper must run as root",
        }));
        return;
    }

    let ops = HostOps;
    let response = Executor::for_request(&request.payload, &ops).handle(&request);
    write_response(&response);
}

fn emit_log(source: &str, line: &str) {
    let payload = json!({
        "type": "log",
        "source": source,
        "line": line,
    });
    if let Ok(line) = serde_json::to_string(&payload) {
        println!("{line}");
        let _ = io::stdout().flush();
    }
}

fn write_response(response: &Value) {
    if let Ok(json) = serde_json::to_string(response) {
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{json}");
        let _ = stdout.flush();
    }
}
