//! Wire codec: length-prefixed binary framing and (de)serialization of
//! typed message payloads.
//!
//! Every message on the wire is a little-endian uint32 length prefix
//! followed by that many payload bytes. Framing is always this
//! transport's job; [`encode_message`] returns payload only, and
//! [`decode_stream`] expects a reader positioned at a length prefix.

use crate::stream::MessageStream;
use byteorder::{ByteOrder, LittleEndian};
use futures::stream;
use log::{error, trace};
use tcpros_common::RosMessage;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Errors local to encoding or decoding a single message. Never escapes a
/// connection's owning task: a decode failure simply ends that reader's
/// stream (see [`decode_stream`]).
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Encodes a message to its wire payload. Does not add the length prefix;
/// the caller (a writer task) frames it before writing to the socket.
pub fn encode_message<T: RosMessage>(msg: &T) -> Result<Vec<u8>, CodecError> {
    serde_rosmsg::to_vec(msg).map_err(|e| CodecError::Serde(e.to_string()))
}

/// Decodes a single payload, bypassing the transport. Used by round-trip
/// tests and anywhere a frame's bytes are already in hand.
pub fn decode_payload<T: RosMessage>(payload: &[u8]) -> Result<T, CodecError> {
    serde_rosmsg::from_slice(payload).map_err(|e| CodecError::Serde(e.to_string()))
}

/// Lazily reads one 4-byte little-endian length, then that many payload
/// bytes, then parses `T`, repeating until EOF.
///
/// End-of-stream on the socket (a clean `read_exact` failure at a frame
/// boundary) ends the stream with no error. A malformed frame or a parse
/// failure is logged and also ends the stream — fatal to this reader only,
/// never propagated past the task that owns it.
pub fn decode_stream<T, R>(reader: R) -> MessageStream<T>
where
    T: RosMessage,
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(stream::unfold(reader, |mut reader| async move {
        let mut len_bytes = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_bytes).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                error!("reading frame length: {e}");
            }
            return None;
        }
        let len = LittleEndian::read_u32(&len_bytes) as usize;

        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            error!("reading frame payload of {len} bytes: {e}");
            return None;
        }

        match decode_payload::<T>(&payload) {
            Ok(msg) => {
                trace!("decoded {}-byte frame for {}", len, T::ROS_TYPE_NAME);
                Some((msg, reader))
            }
            Err(e) => {
                error!("decoding payload for {}: {e}", T::ROS_TYPE_NAME);
                None
            }
        }
    }))
}
