//! Process-table and socket-owner queries used to clear the way for a fresh
//! helper instance.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, System};
use tokio::process::Command;
use tokio::time::timeout;

/// How long a socket-owner lookup may take
const OWNER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// View of the OS process table
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Pids of running `<name> serve` instances, excluding ourselves
    fn find_helpers(&self, name: &str) -> Vec<u32>;

    fn is_running(&self, pid: u32) -> bool;

    /// Force-kill `pid`; true if the signal was delivered
    fn kill(&self, pid: u32) -> bool;

    /// Whether something is already listening on `host:port`
    async fn port_in_use(&self, host: &str, port: u16) -> bool;

    /// Pid of the process listening on `port`, if it can be determined
    async fn port_owner(&self, port: u16) -> Option<u32>;
}

/// [`ProcessTable`] backed by sysinfo and the platform's socket tools
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    fn find_helpers(&self, name: &str) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes();

        system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own_pid
                    && executable_stem(process.name()) == name
                    && process.cmd().iter().any(|arg| arg == "serve")
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn is_running(&self, pid: u32) -> bool {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let pid = Pid::from(pid as usize);
        system.refresh_process(pid)
    }

    fn kill(&self, pid: u32) -> bool {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let pid = Pid::from(pid as usize);
        if !system.refresh_process(pid) {
            return false;
        }
        system.process(pid).map(|p| p.kill()).unwrap_or(false)
    }

    async fn port_in_use(&self, host: &str, port: u16) -> bool {
        match tokio::net::TcpListener::bind(format!("{host}:{port}")).await {
            Ok(listener) => {
                drop(listener);
                false
            }
            Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
        }
    }

    async fn port_owner(&self, port: u16) -> Option<u32> {
        let (program, args) = owner_lookup_command(port);
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(OWNER_LOOKUP_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(program = program, error = %e, "port owner lookup failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(program = program, "port owner lookup timed out");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if cfg!(windows) {
            parse_netstat_owner(&stdout, port)
        } else {
            parse_lsof_owner(&stdout)
        }
    }
}

fn owner_lookup_command(port: u16) -> (&'static str, Vec<String>) {
    if cfg!(windows) {
        ("netstat", vec!["-ano".into(), "-p".into(), "TCP".into()])
    } else {
        (
            "lsof",
            vec![
                "-t".into(),
                "-i".into(),
                format!("tcp:{port}"),
                "-sTCP:LISTEN".into(),
            ],
        )
    }
}

fn executable_stem(name: &str) -> &str {
    name.strip_suffix(".exe").unwrap_or(name)
}

/// `lsof -t` prints one pid per line.
pub(crate) fn parse_lsof_owner(output: &str) -> Option<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .next()
}

/// `netstat -ano`: `TCP  127.0.0.1:8087  0.0.0.0:0  LISTENING  1234`
pub(crate) fn parse_netstat_owner(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    output.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("tcp") {
            return None;
        }
        if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("listening") {
            return None;
        }
        cols[4].parse().ok()
    })
}
