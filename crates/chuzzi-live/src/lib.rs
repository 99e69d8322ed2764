//! Remote speech-service bindings.
//!
//! [`GeminiLiveTransport`] implements the [`LiveTransport`](chuzzi_core::session::LiveTransport)
//! seam over the Gemini Live WebSocket API. [`TextTransform`] post-processes
//! finalized user text; [`RomanScriptTransform`] does so with a one-shot
//! `generateContent` call.

pub mod gemini;
pub mod transform;

pub use gemini::GeminiLiveTransport;
pub use transform::{RomanScriptTransform, TextTransform};
