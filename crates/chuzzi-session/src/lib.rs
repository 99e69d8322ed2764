//! Session core. Owns the live connection and everything that flows through it.
//!
//! [`SessionManager`] runs as a single task. Callers talk to it through a
//! [`SessionHandle`] and observe it through a stream of [`SessionUpdate`]s.
//! Reconnection follows a [`RetryPolicy`]; finished turns come out of the
//! [`TranscriptionAggregator`] and are kept in a [`ConversationLog`].

pub mod log;
pub mod manager;
pub mod retry;
pub mod status;
pub mod transcription;

pub use log::ConversationLog;
pub use manager::{SessionHandle, SessionManager, SessionOptions, SessionUpdate};
pub use retry::{RetryDecision, RetryPolicy};
pub use status::{ConnectionState, SessionStatus};
pub use transcription::{CompletedTurn, TranscriptionAggregator};
