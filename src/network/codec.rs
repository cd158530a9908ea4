//! Binary codec for netplay messages.
//!
//! The core types never depend on a wire format, but every message type is
//! serde-derived and the reliable channel needs encoded sizes to decide when a
//! message must be fragmented. This module pins one bincode configuration so
//! both peers agree on the bytes.
//!
//! ```
//! use rollback_netplay::network::codec::{decode, encode};
//! use rollback_netplay::network::messages::TransitionIndex;
//!
//! let bytes = encode(&TransitionIndex { index: 7 }).expect("encoding should succeed");
//! let (decoded, read): (TransitionIndex, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(decoded.index, 7);
//! assert_eq!(read, bytes.len());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-size integers: message sizes depend only on shape, never on values,
// so fragmentation decisions are stable across retransmissions.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecOperation {
    /// [`encode`] or [`encoded_len`].
    Encode,
    /// [`encode_into`].
    EncodeInto,
    /// [`decode`] or [`decode_value`].
    Decode,
    /// [`decode_exact`] on reassembled fragments.
    Reassemble,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Encode => "encode",
            Self::EncodeInto => "encode into buffer",
            Self::Decode => "decode",
            Self::Reassemble => "reassemble",
        })
    }
}

/// A failed codec call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// bincode rejected the value or the bytes. Its errors are opaque, so only
    /// the rendered message is kept.
    Bincode {
        /// Which call failed.
        operation: CodecOperation,
        /// bincode's description.
        message: String,
    },
    /// [`encode_into`] ran out of room.
    BufferTooSmall {
        /// Length of the caller's buffer.
        provided: usize,
    },
    /// [`decode_exact`] decoded a value before the end of the input.
    TrailingBytes {
        /// Bytes the value occupied.
        consumed: usize,
        /// Bytes supplied.
        total: usize,
    },
}

impl CodecError {
    fn bincode(operation: CodecOperation, err: impl fmt::Display) -> Self {
        Self::Bincode {
            operation,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bincode { operation, message } => write!(f, "{operation} failed: {message}"),
            Self::BufferTooSmall { provided } => {
                write!(f, "encode into buffer failed: {provided} bytes is not enough")
            },
            Self::TrailingBytes { consumed, total } => {
                write!(f, "reassemble failed: value ends at byte {consumed} of {total}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result of a codec call.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes `value` into a fresh buffer.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|err| CodecError::bincode(CodecOperation::Encode, err))
}

/// Encodes `value` into `buffer` and returns the number of bytes written.
///
/// # Errors
///
/// [`CodecError::BufferTooSmall`] if `value` does not fit.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    let provided = buffer.len();
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|err| match err {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall { provided },
        other => CodecError::bincode(CodecOperation::EncodeInto, other),
    })
}

/// Size of `value` on the wire.
pub fn encoded_len<T: Serialize>(value: &T) -> CodecResult<usize> {
    encode(value).map(|bytes| bytes.len())
}

/// Decodes one value from the front of `bytes`; returns it with the number
/// of bytes it occupied.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|err| CodecError::bincode(CodecOperation::Decode, err))
}

/// Decodes one value from the front of `bytes`, ignoring anything after it.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// Decodes a value that must span `bytes` exactly.
///
/// Reassembled fragments go through here: leftover bytes mean the pieces did
/// not belong to one message.
pub fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let (value, consumed) = bincode::serde::decode_from_slice(bytes, config())
        .map_err(|err| CodecError::bincode(CodecOperation::Reassemble, err))?;
    if consumed == bytes.len() {
        Ok(value)
    } else {
        Err(CodecError::TrailingBytes {
            consumed,
            total: bytes.len(),
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{MenuIndex, NetplayMessage, PlayerInputs, RngState};
    use crate::{IndexedFrame, InputSample};

    #[test]
    fn input_batch_decodes_to_the_same_message() {
        let message = NetplayMessage::PlayerInputs(PlayerInputs::with_inputs(
            IndexedFrame::new(2, 40),
            &[InputSample::new(0x15), InputSample::new(0x16)],
        ));
        let bytes = encode(&message).unwrap();
        assert_eq!(decode_value::<NetplayMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn encode_into_reports_the_short_buffer() {
        let state = RngState {
            index: 3,
            bytes: vec![0xAB; 64],
        };
        let mut small = [0u8; 4];
        assert_eq!(
            encode_into(&state, &mut small),
            Err(CodecError::BufferTooSmall { provided: 4 })
        );

        let mut big = [0u8; 128];
        let written = encode_into(&state, &mut big).unwrap();
        assert_eq!(written, encoded_len(&state).unwrap());
        assert_eq!(decode_value::<RngState>(&big[..written]).unwrap(), state);
    }

    #[test]
    fn fixed_shapes_have_fixed_sizes() {
        let small = encoded_len(&MenuIndex { index: 1, menu_index: 0 }).unwrap();
        let large = encoded_len(&MenuIndex {
            index: u32::MAX,
            menu_index: 2,
        })
        .unwrap();
        assert_eq!(small, large);
    }

    #[test]
    fn decode_exact_rejects_leftovers() {
        let mut bytes = encode(&7u32).unwrap();
        bytes.push(0);
        assert_eq!(
            decode_exact::<u32>(&bytes),
            Err(CodecError::TrailingBytes { consumed: 4, total: 5 })
        );
        bytes.pop();
        assert_eq!(decode_exact::<u32>(&bytes).unwrap(), 7);
    }

    #[test]
    fn truncated_input_fails_to_decode() {
        let err = decode::<u64>(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Bincode {
                operation: CodecOperation::Decode,
                ..
            }
        ));
        assert!(err.to_string().starts_with("decode failed"));
    }
}
