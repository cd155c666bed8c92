//! Native client for one real-time meeting room.
//!
//! A [`Session`] joins a room over the signaling server, negotiates a
//! direct peer connection with every other participant, sends the local
//! camera and microphone, and can record the outgoing video.

pub mod config;
pub mod directory;
pub mod error;
pub mod media;
pub mod peer;
pub mod recorder;
pub mod session;
pub mod signaling;

pub use config::MeetConfig;
pub use error::{FailureKind, SessionError};
pub use session::{Session, SessionDeps, SessionHandle, SessionStatus, SessionView};
