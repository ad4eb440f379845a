//! # relay-core
//!
//! Shared types for the relay hub: the wire [`Message`] envelope, the
//! handler-process payload contract, and the error enums crossing crate
//! boundaries.

#![deny(unsafe_code)]

pub mod errors;
pub mod message;
pub mod payload;

pub use errors::{HubError, SendError};
pub use message::Message;
pub use payload::{AuthContext, HandlerPayload, SenderInfo};
