use bytes::BufMut;

use super::encode::{RLPEncode, encode_length};

/// Encodes a struct as an RLP list of its fields.
///
/// Fields are buffered in the order they are added and written out, behind
/// the list prefix, by [`Encoder::finish`].
///
/// ```
/// # use ethsync_common::rlp::{Encoder, RLPEncode};
/// # use bytes::BufMut;
/// struct Announcement {
///     number: u64,
///     seen: bool,
/// }
///
/// impl RLPEncode for Announcement {
///     fn encode(&self, buf: &mut dyn BufMut) {
///         Encoder::new(buf)
///             .encode_field(&self.number)
///             .encode_field(&self.seen)
///             .finish();
///     }
/// }
///
/// let encoded = Announcement { number: 1024, seen: true }.encode_to_vec();
/// assert_eq!(encoded, vec![0xc4, 0x82, 0x04, 0x00, 0x01]);
/// ```
#[must_use = "nothing is written until `finish` is called"]
pub struct Encoder<'a> {
    out: &'a mut dyn BufMut,
    payload: Vec<u8>,
}

impl std::fmt::Debug for Encoder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Encoder<'a> {
    pub fn new(out: &'a mut dyn BufMut) -> Self {
        Self {
            out,
            payload: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode + ?Sized>(mut self, value: &T) -> Self {
        value.encode(&mut self.payload);
        self
    }

    pub fn finish(self) {
        encode_length(self.payload.len(), self.out);
        self.out.put_slice(&self.payload);
    }
}
