//! WebSocket protocol pieces: frame codec, opening handshake, SHA-1.

pub mod frame;
pub mod handshake;
mod sha1;

pub use frame::{encode_close, encode_frame, read_frame, Frame, Opcode};
pub use handshake::accept_key;
