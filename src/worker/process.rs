//! Worker subprocess lifecycle.
//!
//! Spawns one worker per accelerator with piped stdio, forwards its stderr
//! into the log, and tears it down in escalating steps: the caller closes
//! stdin first, then SIGTERM, then a hard kill once the grace period runs out.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use gpu_orchestrator_config::{environment_names, WorkerLaunchConfig};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as TokioMutex;

use crate::error::WorkerError;

/// The pipes the message channel takes ownership of.
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub struct WorkerProcess {
    label: String,
    pid: Option<u32>,
    child: TokioMutex<Child>,
    alive: AtomicBool,
    exit: Mutex<Option<String>>,
}

impl WorkerProcess {
    /// Spawn the worker program for `accelerator_index`.
    pub fn spawn(
        label: &str,
        launch: &WorkerLaunchConfig,
        worker_type: &str,
        accelerator_index: u32,
    ) -> Result<(Self, ProcessPipes), WorkerError> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .arg(&launch.worker_type_flag)
            .arg(worker_type)
            .env(&launch.accelerator_env, accelerator_index.to_string())
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if launch.pin_visible_devices {
            command.env(
                environment_names::CUDA_VISIBLE_DEVICES,
                accelerator_index.to_string(),
            );
        }

        info!(
            "[PROCESS] Spawning worker for {label}: {} {} {worker_type}",
            launch.program.display(),
            launch.worker_type_flag
        );
        let mut child = command.spawn().map_err(|e| {
            WorkerError::ProcessLaunch(format!("{}: {e}", launch.program.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::ProcessLaunch("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::ProcessLaunch("worker stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let tag = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[WORKER {tag}] {line}");
                }
            });
        }

        let pid = child.id();
        debug!("[PROCESS] {label} started with pid {pid:?}");
        let process = Self {
            label: label.to_string(),
            pid,
            child: TokioMutex::new(child),
            alive: AtomicBool::new(true),
            exit: Mutex::new(None),
        };
        Ok((process, ProcessPipes { stdin, stdout }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last known liveness, without touching the OS.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Exit status text once the process is known to have exited.
    pub fn exit_description(&self) -> Option<String> {
        self.exit.lock().ok().and_then(|guard| guard.clone())
    }

    /// Poll the OS for an exit without blocking. While `terminate` holds the
    /// child the process still counts as alive.
    pub async fn check_alive(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Ok(mut child) = self.child.try_lock() else {
            return self.is_alive();
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("[PROCESS] {} could not be polled: {e}", self.label);
                self.alive.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Wait up to `wait` for the process to exit on its own. Returns the
    /// exit description if it did.
    pub async fn exited_within(&self, wait: Duration) -> Option<String> {
        let poll = Duration::from_millis(25);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if !self.check_alive().await {
                return Some(
                    self.exit_description()
                        .unwrap_or_else(|| "exit status unknown".to_string()),
                );
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop the process. Expects stdin to be closed already; gives the worker
    /// half the grace period to exit on EOF, sends SIGTERM, and kills it once
    /// the rest of the grace period has passed.
    pub async fn terminate(&self, grace: Duration) {
        if !self.check_alive().await {
            return;
        }
        let half = grace / 2;
        if self.exited_within(half).await.is_some() {
            debug!("[PROCESS] {} exited after stdin closed", self.label);
            return;
        }

        self.request_exit();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace - half, child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                debug!("[PROCESS] {} exited after SIGTERM", self.label);
            }
            Ok(Err(e)) => {
                warn!("[PROCESS] {} wait failed: {e}", self.label);
                self.alive.store(false, Ordering::SeqCst);
            }
            Err(_) => {
                warn!(
                    "[PROCESS] {} ignored termination for {}ms, killing",
                    self.label,
                    grace.as_millis()
                );
                if let Err(e) = child.kill().await {
                    warn!("[PROCESS] Failed to kill {}: {e}", self.label);
                }
                match child.try_wait() {
                    Ok(Some(status)) => self.record_exit(status),
                    _ => self.alive.store(false, Ordering::SeqCst),
                }
            }
        }
    }

    #[cfg(not(windows))]
    fn request_exit(&self) {
        if let Some(pid) = self.pid {
            debug!("[PROCESS] Sending SIGTERM to {} (pid {pid})", self.label);
            // SAFETY: kill(2) has no memory safety requirements.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(
                    "[PROCESS] SIGTERM to pid {pid} failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(windows)]
    fn request_exit(&self) {}

    fn record_exit(&self, status: ExitStatus) {
        self.alive.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.exit.lock() {
            if guard.is_none() {
                info!("[PROCESS] {} exited: {status}", self.label);
                *guard = Some(status.to_string());
            }
        }
    }
}
