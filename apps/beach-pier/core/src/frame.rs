use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};

// Tags are ASCII digits so the browser can build frames with plain strings.
const CLIENT_TAG_INPUT: u8 = b'0';
const CLIENT_TAG_PING: u8 = b'1';
const CLIENT_TAG_RESIZE_TERMINAL: u8 = b'2';

const SERVER_TAG_OUTPUT: u8 = b'0';
const SERVER_TAG_PONG: u8 = b'1';
const SERVER_TAG_SET_WINDOW_TITLE: u8 = b'2';
const SERVER_TAG_SET_PREFERENCES: u8 = b'3';
const SERVER_TAG_SET_RECONNECT: u8 = b'4';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: missing type tag")]
    MalformedFrame,
    #[error("unknown frame type: {0:#04x}")]
    UnknownTag(u8),
    #[error("output payload is not valid base64")]
    InvalidBase64,
    #[error("payload is not valid json: {0}")]
    InvalidJson(String),
    #[error("reconnect interval must be a non-negative integer")]
    InvalidReconnect,
}

/// Prepends the tag byte to `payload`. No escaping is applied.
pub fn encode(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(tag);
    buf.extend_from_slice(payload);
    buf
}

/// Splits a frame into its tag and payload. A zero-length frame has no tag
/// and is rejected before any dispatch happens.
pub fn decode(frame: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    match frame.split_first() {
        Some((tag, payload)) => Ok((*tag, payload)),
        None => Err(FrameError::MalformedFrame),
    }
}

/// Frames sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Raw keystrokes destined for the remote process.
    Input(Bytes),
    Ping,
    /// New terminal dimensions. The payload is carried opaquely; resizing is
    /// not implemented by any backend yet.
    ResizeTerminal(Bytes),
}

impl ClientFrame {
    pub fn tag(&self) -> u8 {
        match self {
            ClientFrame::Input(_) => CLIENT_TAG_INPUT,
            ClientFrame::Ping => CLIENT_TAG_PING,
            ClientFrame::ResizeTerminal(_) => CLIENT_TAG_RESIZE_TERMINAL,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientFrame::Input(data) | ClientFrame::ResizeTerminal(data) => {
                encode(self.tag(), data)
            }
            ClientFrame::Ping => encode(self.tag(), &[]),
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (tag, payload) = decode(frame)?;
        match tag {
            CLIENT_TAG_INPUT => Ok(ClientFrame::Input(Bytes::copy_from_slice(payload))),
            CLIENT_TAG_PING => Ok(ClientFrame::Ping),
            CLIENT_TAG_RESIZE_TERMINAL => Ok(ClientFrame::ResizeTerminal(
                Bytes::copy_from_slice(payload),
            )),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Raw remote output. Base64 encoded on the wire.
    Output(Bytes),
    Pong,
    SetWindowTitle(String),
    SetPreferences(Map<String, Value>),
    /// Reconnect interval in seconds.
    SetReconnect(u64),
}

impl ServerFrame {
    pub fn tag(&self) -> u8 {
        match self {
            ServerFrame::Output(_) => SERVER_TAG_OUTPUT,
            ServerFrame::Pong => SERVER_TAG_PONG,
            ServerFrame::SetWindowTitle(_) => SERVER_TAG_SET_WINDOW_TITLE,
            ServerFrame::SetPreferences(_) => SERVER_TAG_SET_PREFERENCES,
            ServerFrame::SetReconnect(_) => SERVER_TAG_SET_RECONNECT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerFrame::Output(data) => encode(self.tag(), STANDARD.encode(data).as_bytes()),
            ServerFrame::Pong => encode(self.tag(), &[]),
            ServerFrame::SetWindowTitle(title) => encode(self.tag(), title.as_bytes()),
            ServerFrame::SetPreferences(prefs) => {
                // Map<String, Value> always serializes.
                let payload = serde_json::to_vec(prefs).unwrap_or_else(|_| b"{}".to_vec());
                encode(self.tag(), &payload)
            }
            ServerFrame::SetReconnect(seconds) => encode(self.tag(), seconds.to_string().as_bytes()),
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (tag, payload) = decode(frame)?;
        match tag {
            SERVER_TAG_OUTPUT => STANDARD
                .decode(payload)
                .map(|raw| ServerFrame::Output(Bytes::from(raw)))
                .map_err(|_| FrameError::InvalidBase64),
            SERVER_TAG_PONG => Ok(ServerFrame::Pong),
            SERVER_TAG_SET_WINDOW_TITLE => Ok(ServerFrame::SetWindowTitle(
                String::from_utf8_lossy(payload).into_owned(),
            )),
            SERVER_TAG_SET_PREFERENCES => serde_json::from_slice(payload)
                .map(ServerFrame::SetPreferences)
                .map_err(|err| FrameError::InvalidJson(err.to_string())),
            SERVER_TAG_SET_RECONNECT => {
                let value: Value = serde_json::from_slice(payload)
                    .map_err(|err| FrameError::InvalidJson(err.to_string()))?;
                value
                    .as_u64()
                    .map(ServerFrame::SetReconnect)
                    .ok_or(FrameError::InvalidReconnect)
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}
