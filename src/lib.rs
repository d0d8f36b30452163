//! Peer-to-peer session with JSON data-channel messaging and resumable,
//! acknowledged chunked file transfer. Signaling goes through an abstract
//! relay; transfer progress persists across restarts.

pub mod core;
pub mod error;
pub mod utils;

pub use error::{PeerError, Result};
