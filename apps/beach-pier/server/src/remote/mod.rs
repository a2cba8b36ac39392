//! Remote session handles: the component that actually runs the shell inside
//! the target container, fed by byte pipes the bridge owns the other end of.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub mod pipe;
pub mod pty;

pub use pipe::{pipe, PipeCloser, PipeClosed, PipeReader, PipeWriter};
pub use pty::PtyBackend;

/// Which container runtime the exec client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Docker,
    Kubernetes,
    /// Shell on the server host itself; mostly useful for development.
    Local,
}

/// A remote interactive process. `run` drives it until it exits; the bridge
/// only logs the outcome.
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(self: Box<Self>) -> anyhow::Result<()>;
}

/// Builds a [`RemoteSession`] per accepted connection.
pub trait SessionBackend: Send + Sync {
    /// Command line shown in the window title.
    fn command_line(&self) -> String;

    fn open(&self, target: &Target, io: RemoteIo) -> anyhow::Result<Box<dyn RemoteSession>>;
}

/// Backend ends of the session pipes.
pub struct RemoteIo {
    pub input: PipeReader,
    pub output: PipeWriter,
    pub error: PipeWriter,
}

/// Bridge ends of the session pipes.
pub struct BridgeIo {
    pub input: PipeWriter,
    pub output: PipeReader,
    pub error: PipeReader,
}

impl BridgeIo {
    pub fn closers(&self) -> SessionClosers {
        SessionClosers {
            output: self.output.closer(),
            error: self.error.closer(),
            input: self.input.closer(),
        }
    }
}

pub struct SessionClosers {
    output: PipeCloser,
    error: PipeCloser,
    input: PipeCloser,
}

impl SessionClosers {
    /// Output goes first so the outbound pump sees end of stream before the
    /// input side changes.
    pub fn close_all(&self) {
        self.output.close();
        self.error.close();
        self.input.close();
    }
}

/// Creates the three pipes connecting a bridge and a remote session.
pub fn session_pipes(capacity: usize) -> (RemoteIo, BridgeIo) {
    let (input_tx, input_rx) = pipe(capacity);
    let (output_tx, output_rx) = pipe(capacity);
    let (error_tx, error_rx) = pipe(capacity);
    (
        RemoteIo {
            input: input_rx,
            output: output_tx,
            error: error_tx,
        },
        BridgeIo {
            input: input_tx,
            output: output_rx,
            error: error_rx,
        },
    )
}

/// Where the shell runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub pod: Option<String>,
    pub container: Option<String>,
}

/// Target components as they arrive on the upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TargetQuery {
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub container: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

impl Target {
    /// Merges request parameters over the server defaults and checks that the
    /// result is usable by `kind`.
    pub fn resolve(
        query: &TargetQuery,
        defaults: &Target,
        kind: BackendKind,
    ) -> Result<Self, TargetError> {
        let pick = |requested: &Option<String>, fallback: &Option<String>| {
            requested
                .as_ref()
                .filter(|value| !value.is_empty())
                .or(fallback.as_ref())
                .cloned()
        };

        let target = Target {
            namespace: query
                .namespace
                .clone()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| defaults.namespace.clone()),
            pod: pick(&query.pod, &defaults.pod),
            container: pick(&query.container, &defaults.container),
        };

        validate_name("namespace", &target.namespace)?;
        if let Some(pod) = &target.pod {
            validate_name("pod", pod)?;
        }
        if let Some(container) = &target.container {
            validate_name("container", container)?;
        }

        match kind {
            BackendKind::Docker if target.container.is_none() => {
                Err(TargetError::Missing("container"))
            }
            BackendKind::Kubernetes if target.pod.is_none() => Err(TargetError::Missing("pod")),
            _ => Ok(target),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.pod, &self.container) {
            (Some(pod), Some(container)) => write!(f, "{}/{}/{}", self.namespace, pod, container),
            (Some(pod), None) => write!(f, "{}/{}", self.namespace, pod),
            (None, Some(container)) => f.write_str(container),
            (None, None) => f.write_str("local"),
        }
    }
}

// Names end up as exec client arguments, so anything flag-like or outside
// the DNS-ish alphabet is refused.
fn validate_name(field: &'static str, value: &str) -> Result<(), TargetError> {
    let valid = !value.is_empty()
        && !value.starts_with('-')
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(TargetError::Invalid {
            field,
            value: value.to_string(),
        })
    }
}
