//! RouterOS API wire protocol
//!
//! Sentence model, length-prefixed framing codec, and login handshake
//! primitives. Everything here is transport-agnostic; the session layer
//! owns the socket.

pub mod auth;
pub mod codec;
pub mod sentence;

pub use codec::{encode_sentence, encode_to_vec, SentenceDecoder};
pub use sentence::{ReplyKind, Sentence};
