//! Shared primitives for the Beach Pier container terminal: the tagged frame
//! vocabulary spoken over the browser WebSocket and the terminal preference
//! record pushed to the client during the handshake.

pub mod frame;
pub mod preferences;

pub use frame::{decode, encode, ClientFrame, FrameError, ServerFrame};
pub use preferences::{PreferenceField, RawPreferenceKeys, TerminalPreferences, PREFERENCE_FIELDS};
