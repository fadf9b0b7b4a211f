//! Real-time voice sessions over the speech relay.

pub mod completion;
pub mod controller;
pub mod protocol;
pub mod segmenter;
pub mod ws;

pub use completion::CompletionPolicy;
pub use controller::{SessionController, SessionExit, SessionMode, SessionObserver};
pub use protocol::{RelayConnection, RelayEvent, RelayReply};
pub use ws::{WsRelay, serve_relay};
