//! Per-connection session bridge.
//!
//! A bridge owns one client connection and one remote session. It sends the
//! handshake, then runs two pumps until the remote process ends:
//!
//! * outbound: remote output -> base64 `Output` frames
//! * inbound: client frames -> remote input, `Ping` -> `Pong`
//!
//! Every frame write goes through [`FrameWriter`], which holds a single lock
//! for the duration of one frame so frames never interleave on the wire.

use std::fmt::Display;
use std::sync::Arc;

use beach_pier_core::{ClientFrame, ServerFrame};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::remote::{BridgeIo, PipeReader, PipeWriter, RemoteSession};
use crate::title::{TemplateError, TitleContext};

/// Written to the remote input when the client disappears so the shell does
/// not outlive its browser tab.
pub const FORCED_EXIT: &[u8] = b"exit\r";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to render window title: {0}")]
    Title(#[from] TemplateError),
    #[error("failed to send {frame} during handshake: {reason}")]
    Handshake { frame: &'static str, reason: String },
}

/// Why a client connection stopped delivering frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("client closed the connection: {0:?}")]
    Closed(Option<String>),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
#[error("failed to send frame: {0}")]
pub struct SendError(String);

/// Serialized write path to the client.
pub struct FrameWriter<Tx> {
    sink: Arc<Mutex<Tx>>,
}

impl<Tx> Clone for FrameWriter<Tx> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<Tx> FrameWriter<Tx>
where
    Tx: Sink<Vec<u8>> + Unpin,
    Tx::Error: Display,
{
    pub fn new(sink: Tx) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send(&self, frame: &ServerFrame) -> Result<(), SendError> {
        let bytes = frame.encode();
        let mut sink = self.sink.lock().await;
        sink.send(bytes)
            .await
            .map_err(|err| SendError(err.to_string()))
    }

    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.close().await {
            debug!(error = %err, "closing client connection failed");
        }
    }
}

/// How the inbound pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundExit {
    /// Connection closed or broken; the forced exit was sent.
    Disconnected,
    /// Malformed frame or unknown tag.
    ProtocolViolation,
    /// Remote input no longer accepts bytes.
    InputClosed,
    /// `Pong` could not be sent.
    SendFailed,
}

/// Result of handling one client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// Frame understood but not acted on.
    Unsupported,
    Stop(InboundExit),
}

pub struct SessionBridge<Tx> {
    session_id: Uuid,
    settings: Arc<SessionSettings>,
    writer: FrameWriter<Tx>,
    title: TitleContext,
}

impl<Tx> SessionBridge<Tx>
where
    Tx: Sink<Vec<u8>> + Send + Unpin + 'static,
    Tx::Error: Display + Send,
{
    pub fn new(
        session_id: Uuid,
        settings: Arc<SessionSettings>,
        sink: Tx,
        title: TitleContext,
    ) -> Self {
        Self {
            session_id,
            settings,
            writer: FrameWriter::new(sink),
            title,
        }
    }

    /// Runs the session to completion. Returns an error only when the
    /// handshake fails, in which case the remote session is never started.
    pub async fn run<Rx>(
        self,
        incoming: Rx,
        remote: Box<dyn RemoteSession>,
        io: BridgeIo,
    ) -> Result<(), BridgeError>
    where
        Rx: Stream<Item = Result<Vec<u8>, ReceiveError>> + Send + Unpin + 'static,
    {
        let closers = io.closers();

        if let Err(err) = self.send_initialize().await {
            counter!("beach_pier_handshake_failures_total").increment(1);
            closers.close_all();
            self.writer.close().await;
            return Err(err);
        }

        gauge!("beach_pier_sessions_active").increment(1.0);
        let BridgeIo {
            input,
            output,
            error: _error,
        } = io;

        let session_id = self.session_id;
        let outbound = tokio::spawn(
            pump_output(self.writer.clone(), output).instrument(tracing::Span::current()),
        );
        let mut inbound = tokio::spawn(
            pump_input(self.writer.clone(), incoming, input).instrument(tracing::Span::current()),
        );

        match remote.run().await {
            Ok(()) => debug!(%session_id, "remote session finished"),
            Err(err) => warn!(%session_id, error = %err, "remote session failed"),
        }

        // Only closed after run() returns so the outbound pump never races the
        // backend for the output pipe.
        closers.close_all();
        if let Err(err) = outbound.await {
            warn!(%session_id, error = %err, "outbound pump panicked");
        }
        self.writer.close().await;

        match tokio::time::timeout(self.settings.drain_timeout, &mut inbound).await {
            Ok(Ok(exit)) => debug!(%session_id, ?exit, "inbound pump finished"),
            Ok(Err(err)) => warn!(%session_id, error = %err, "inbound pump panicked"),
            Err(_) => {
                debug!(%session_id, "client did not close in time; dropping inbound pump");
                inbound.abort();
                let _ = inbound.await;
            }
        }

        gauge!("beach_pier_sessions_active").decrement(1.0);
        info!(%session_id, "session ended");
        Ok(())
    }

    async fn send_initialize(&self) -> Result<(), BridgeError> {
        let title = self.settings.title.render(&self.title)?;
        self.send_handshake("SetWindowTitle", ServerFrame::SetWindowTitle(title))
            .await?;

        let preferences = self
            .settings
            .preferences
            .filtered(&self.settings.raw_preference_keys);
        self.send_handshake("SetPreferences", ServerFrame::SetPreferences(preferences))
            .await?;

        if let Some(seconds) = self.settings.reconnect {
            self.send_handshake("SetReconnect", ServerFrame::SetReconnect(seconds))
                .await?;
        }
        Ok(())
    }

    async fn send_handshake(
        &self,
        frame: &'static str,
        payload: ServerFrame,
    ) -> Result<(), BridgeError> {
        self.writer
            .send(&payload)
            .await
            .map_err(|err| BridgeError::Handshake {
                frame,
                reason: err.to_string(),
            })
    }
}

async fn pump_output<Tx>(writer: FrameWriter<Tx>, mut output: PipeReader)
where
    Tx: Sink<Vec<u8>> + Unpin,
    Tx::Error: Display,
{
    while let Some(chunk) = output.read().await {
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len();
        if let Err(err) = writer.send(&ServerFrame::Output(chunk)).await {
            warn!(error = %err, "failed to forward remote output");
            return;
        }
        counter!("beach_pier_output_bytes_total").increment(len as u64);
    }
    debug!("remote output closed");
}

async fn pump_input<Tx, Rx>(
    writer: FrameWriter<Tx>,
    mut incoming: Rx,
    input: PipeWriter,
) -> InboundExit
where
    Tx: Sink<Vec<u8>> + Unpin,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Vec<u8>, ReceiveError>> + Unpin,
{
    let exit = loop {
        let raw = match incoming.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(err)) => {
                info!(error = %err, "client connection lost");
                force_exit(&input);
                break InboundExit::Disconnected;
            }
            None => {
                info!("client connection closed");
                force_exit(&input);
                break InboundExit::Disconnected;
            }
        };
        counter!("beach_pier_frames_in_total").increment(1);

        let frame = match ClientFrame::decode(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping session after invalid client frame");
                counter!("beach_pier_protocol_violations_total").increment(1);
                break InboundExit::ProtocolViolation;
            }
        };

        match dispatch(frame, &writer, &input).await {
            Dispatch::Continue | Dispatch::Unsupported => {}
            Dispatch::Stop(exit) => break exit,
        }
    };
    input.close();
    exit
}

/// Applies one client frame.
pub async fn dispatch<Tx>(
    frame: ClientFrame,
    writer: &FrameWriter<Tx>,
    input: &PipeWriter,
) -> Dispatch
where
    Tx: Sink<Vec<u8>> + Unpin,
    Tx::Error: Display,
{
    match frame {
        ClientFrame::Input(data) => {
            if data.is_empty() {
                return Dispatch::Continue;
            }
            match input.write(data).await {
                Ok(()) => Dispatch::Continue,
                Err(err) => {
                    debug!(error = %err, "remote input rejected keystrokes");
                    Dispatch::Stop(InboundExit::InputClosed)
                }
            }
        }
        ClientFrame::Ping => match writer.send(&ServerFrame::Pong).await {
            Ok(()) => Dispatch::Continue,
            Err(err) => {
                warn!(error = %err, "failed to answer ping");
                Dispatch::Stop(InboundExit::SendFailed)
            }
        },
        ClientFrame::ResizeTerminal(payload) => {
            debug!(bytes = payload.len(), "terminal resize is not supported; ignoring");
            Dispatch::Unsupported
        }
    }
}

// Never waits: a remote that stopped reading must not pin the pump open.
fn force_exit(input: &PipeWriter) {
    if let Err(err) = input.try_write(Bytes::from_static(FORCED_EXIT)) {
        debug!(error = %err, "could not ask remote command to exit");
    }
}
