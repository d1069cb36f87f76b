//! evreplay
//!
//! Records input events from a device-side service into trace files and
//! replays them with their original timing, collecting response-time
//! statistics along the way.

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod response;
pub mod session;
pub mod trace;
pub mod transport;

pub use config::Config;
pub use error::{FileError, SessionError};
pub use session::{create_session_channels, Session, SessionCommand, SessionEvent, SessionStatus};
