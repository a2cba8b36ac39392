use std::io::{Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, info, warn};

use super::{BackendKind, RemoteIo, RemoteSession, SessionBackend, Target};
use crate::config::BackendConfig;

const READ_CHUNK: usize = 4096;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Runs the runtime's exec client (`docker exec`, `kubectl exec`) or a local
/// shell inside a pseudo-terminal. The PTY merges stderr into output, so the
/// error pipe is never written.
pub struct PtyBackend {
    config: BackendConfig,
}

impl PtyBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Full argv for `target`.
    pub fn argv(&self, target: &Target) -> Vec<String> {
        let config = &self.config;
        let mut argv = Vec::new();
        match config.kind {
            BackendKind::Docker => {
                argv.push(config.docker_bin.clone());
                if let Some(host) = &config.docker_host {
                    argv.extend(["-H".to_string(), host.clone()]);
                }
                argv.extend(["exec".to_string(), "-it".to_string()]);
                argv.extend(target.container.clone());
                argv.extend(["env".to_string(), format!("TERM={}", config.term)]);
            }
            BackendKind::Kubernetes => {
                argv.push(config.kubectl_bin.clone());
                if let Some(server) = &config.kube_server {
                    argv.extend(["--server".to_string(), server.clone()]);
                }
                argv.extend([
                    "exec".to_string(),
                    "-it".to_string(),
                    "-n".to_string(),
                    target.namespace.clone(),
                ]);
                argv.extend(target.pod.clone());
                if let Some(container) = &target.container {
                    argv.extend(["-c".to_string(), container.clone()]);
                }
                argv.extend([
                    "--".to_string(),
                    "env".to_string(),
                    format!("TERM={}", config.term),
                ]);
            }
            BackendKind::Local => {}
        }
        argv.extend(config.command.iter().cloned());
        argv
    }
}

impl SessionBackend for PtyBackend {
    fn command_line(&self) -> String {
        self.config.command.join(" ")
    }

    fn open(&self, target: &Target, io: RemoteIo) -> Result<Box<dyn RemoteSession>> {
        let argv = self.argv(target);
        if argv.is_empty() {
            anyhow::bail!("no command configured");
        }
        debug!(?argv, "prepared remote command");
        Ok(Box::new(PtySession {
            argv,
            term: self.config.term.clone(),
            hangup_grace: self.config.hangup_grace,
            io,
        }))
    }
}

struct PtySession {
    argv: Vec<String>,
    term: String,
    hangup_grace: Duration,
    io: RemoteIo,
}

#[async_trait]
impl RemoteSession for PtySession {
    async fn run(self: Box<Self>) -> Result<()> {
        let PtySession {
            argv,
            term,
            hangup_grace,
            io,
        } = *self;
        let RemoteIo { input, output, .. } = io;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", &term);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", argv[0]))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let mut writer = pair.master.take_writer().context("failed to take pty writer")?;
        let mut killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));

        std::thread::Builder::new()
            .name("pier-pty-output".into())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if output
                                .blocking_write(Bytes::copy_from_slice(&buf[..n]))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "pty read ended");
                            break;
                        }
                    }
                }
                output.close();
            })
            .context("failed to spawn pty output thread")?;

        let input_exited = Arc::clone(&exited);
        let mut input = input;
        std::thread::Builder::new()
            .name("pier-pty-input".into())
            .spawn(move || {
                while let Some(chunk) = input.blocking_read() {
                    if let Err(err) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                        debug!(error = %err, "pty write failed");
                        break;
                    }
                }
                // Input is gone: give the shell a moment to act on a pending
                // `exit`, then hang up like a closed terminal would.
                std::thread::sleep(hangup_grace);
                if !input_exited.load(Ordering::SeqCst) {
                    info!("hanging up remote command after input closed");
                    if let Err(err) = killer.kill() {
                        debug!(error = %err, "hangup kill failed");
                    }
                }
            })
            .context("failed to spawn pty input thread")?;

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .context("pty wait task failed")?
            .context("failed to wait for remote command")?;
        exited.store(true, Ordering::SeqCst);
        drop(pair.master);

        if status.success() {
            info!("remote command exited");
        } else {
            warn!(exit_code = status.exit_code(), "remote command exited with failure");
        }
        Ok(())
    }
}
