//! Recursive Length Prefix encoding.
//!
//! Only the encoding half is needed here: headers are hashed as
//! `keccak256(rlp(header))` and body/receipt commitments are computed over the
//! RLP encoding of their lists. Decoding happens in the wire layer.

pub mod encode;
pub mod structs;

/// Encoding of the empty byte string and of integer zero.
pub const RLP_NULL: u8 = 0x80;
/// Encoding of the empty list.
pub const RLP_EMPTY_LIST: u8 = 0xc0;

pub use encode::{RLPEncode, encode};
pub use structs::Encoder;
