//! Shared utilities for process-level tests.
//!
//! Each [`Supervisor`] runs the real binary against its own scratch
//! directory: config file, pid file and log file.

#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(15);

/// Poll `f` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    f()
}

/// A TCP port nothing is listening on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Settings written to the supervisor's config file.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub workers: usize,
    pub timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub auto_quit_old: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout_secs: 10,
            kill_grace_secs: 1,
            auto_quit_old: true,
        }
    }
}

pub struct Supervisor {
    pub dir: TempDir,
    pub port: u16,
    child: Child,
}

impl Supervisor {
    pub fn start(config: TestConfig) -> Self {
        let supervisor = Self::launch(config, &[]);
        assert!(
            wait_until(WAIT, || supervisor.master_pid() == Some(supervisor.original_pid())),
            "master never wrote its pid file; log:\n{}",
            supervisor.log()
        );
        supervisor
    }

    /// Start with `-D`. The launched process exits once the daemon is
    /// detached, so the pid file names a different process.
    pub fn start_daemonized(config: TestConfig) -> Self {
        let mut supervisor = Self::launch(config, &["-D"]);
        let status = supervisor
            .wait_original(WAIT)
            .expect("launched process never detached");
        assert!(status.success(), "launched process failed: {status}");
        assert!(
            wait_until(WAIT, || matches!(
                supervisor.master_pid(),
                Some(pid) if pid != supervisor.original_pid() && process_alive(pid)
            )),
            "daemon never wrote its pid file; log:\n{}",
            supervisor.log()
        );
        supervisor
    }

    fn launch(config: TestConfig, args: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let supervisor_dir = dir.path().to_path_buf();
        write_config(&supervisor_dir, port, &config);

        let child = Command::new(env!("CARGO_BIN_EXE_prefork"))
            .arg("-c")
            .arg(supervisor_dir.join("prefork.toml"))
            .args(args)
            .env_remove("RUST_LOG")
            .env_remove("PREFORK_WORKER")
            .env_remove("PREFORK_INHERIT_FDS")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        Self { dir, port, child }
    }

    /// Send USR2 and wait for a successor to claim the pid file.
    pub fn upgrade(&self) -> Pid {
        let old = self.master_pid().expect("no master pid");
        kill(old, Signal::SIGUSR2).unwrap();
        let mut new = None;
        assert!(
            wait_until(WAIT, || {
                new = self.master_pid().filter(|&pid| pid != old);
                new.is_some()
            }),
            "no successor after upgrade; log:\n{}",
            self.log()
        );
        new.unwrap()
    }

    pub fn original_pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("prefork.toml")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.path().join("prefork.pid")
    }

    pub fn oldbin_path(&self) -> PathBuf {
        self.dir.path().join("prefork.pid.oldbin")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("prefork.log")
    }

    pub fn rewrite_config(&self, config: &TestConfig) {
        write_config(self.dir.path(), self.port, config);
    }

    pub fn break_config(&self) {
        fs::write(self.config_path(), "worker_processes = \"many\"\n").unwrap();
    }

    /// Master pid according to the canonical pid file.
    pub fn master_pid(&self) -> Option<Pid> {
        read_pid(&self.pid_path())
    }

    pub fn signal_master(&self, signal: Signal) {
        let pid = self.master_pid().expect("no master pid");
        kill(pid, signal).unwrap();
    }

    pub fn log(&self) -> String {
        fs::read_to_string(self.log_path()).unwrap_or_default()
    }

    pub fn log_count(&self, needle: &str) -> usize {
        self.log().matches(needle).count()
    }

    pub fn wait_for_log(&self, needle: &str, count: usize) -> bool {
        wait_until(WAIT, || self.log_count(needle) >= count)
    }

    /// One request; the response body on success.
    pub fn get(&self, path: &str) -> Option<String> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).ok()?;
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).ok()?;
        let mut response = String::new();
        stream.read_to_string(&mut response).ok()?;
        if !response.starts_with("HTTP/1.1 200") {
            return None;
        }
        response.split_once("\r\n\r\n").map(|(_, body)| body.to_string())
    }

    pub fn get_until(&self, path: &str, mut accept: impl FnMut(&str) -> bool) -> Option<String> {
        let mut last = None;
        wait_until(WAIT, || match self.get(path) {
            Some(body) if accept(&body) => {
                last = Some(body);
                true
            }
            _ => false,
        });
        last
    }

    /// Wait for the originally started master to exit.
    pub fn wait_original(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(pid) = self.master_pid() {
            let _ = kill(pid, Signal::SIGTERM);
        }
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = kill(self.original_pid(), Signal::SIGTERM);
            let _ = self.child.wait();
        }
    }
}

fn write_config(dir: &Path, port: u16, config: &TestConfig) {
    let content = format!(
        r#"
worker_processes = {workers}
timeout_secs = {timeout}
kill_grace_secs = {grace}
shutdown_timeout_secs = 5
pid = "{pid}"

[[listen]]
address = "127.0.0.1:{port}"

[logging]
level = "info"
path = "{log}"

[upgrade]
auto_quit_old = {auto_quit}
ready_timeout_secs = 10
"#,
        workers = config.workers,
        timeout = config.timeout_secs,
        grace = config.kill_grace_secs,
        pid = dir.join("prefork.pid").display(),
        port = port,
        log = dir.join("prefork.log").display(),
        auto_quit = config.auto_quit_old,
    );
    fs::write(dir.join("prefork.toml"), content).unwrap();
}

pub fn read_pid(path: &Path) -> Option<Pid> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Pid::from_raw)
}

pub fn process_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Number of descriptors `pid` holds open.
pub fn open_fds(pid: Pid) -> usize {
    fs::read_dir(format!("/proc/{pid}/fd")).unwrap().count()
}

/// Parent pid from `/proc/<pid>/stat`.
pub fn parent_of(pid: Pid) -> Option<Pid> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may hold spaces; fields resume after its closing paren.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace()
        .nth(1)?
        .parse()
        .ok()
        .map(Pid::from_raw)
}

/// Value of `key=` in a demo handler response body.
pub fn field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split_whitespace()
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
}
