//! Core types, config, errors, and the live-session seam for Chuzzi.

pub mod config;
pub mod conversation_store;
pub mod error;
pub mod session;
pub mod types;
