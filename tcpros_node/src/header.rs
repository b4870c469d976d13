//! The TCPROS connection header: the single framed key/value block
//! exchanged by both sides at connection setup, before any message
//! frames flow.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Historical ROS wildcard: `rostopic echo`/`hz` and similar generic
/// tools send `md5sum=*` to subscribe to any type. Dropping this would
/// make the node unable to interoperate with those standard tools, so a
/// local md5 is considered a match against it.
const WILDCARD_MD5: &str = "*";

#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed connection header: {0}")]
    Malformed(String),
    #[error("connection header missing required field '{0}'")]
    MissingField(&'static str),
    #[error("type mismatch: expected '{expected}', received '{received}'")]
    TypeMismatch { expected: String, received: String },
    #[error("md5sum mismatch: expected '{expected}', received '{received}'")]
    Md5Mismatch { expected: String, received: String },
}

/// One side's connection-header negotiation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Node identifier of the sender.
    pub caller_id: String,
    /// Subscribed topic name. Sent by a subscriber connecting to a
    /// publisher; absent on the publisher's response.
    pub topic: Option<String>,
    /// Message type name, e.g. `std_msgs/String`.
    pub topic_type: String,
    /// MD5 signature of the message type's schema.
    pub md5sum: String,
}

impl ConnectionHeader {
    /// Serializes to the framed wire representation: an outer
    /// `uint32-LE` length, then a concatenation of `uint32-LE length` +
    /// `key=value` records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_field(&mut payload, "callerid", &self.caller_id);
        if let Some(topic) = &self.topic {
            write_field(&mut payload, "topic", topic);
        }
        write_field(&mut payload, "type", &self.topic_type);
        write_field(&mut payload, "md5sum", &self.md5sum);

        let mut framed = Vec::with_capacity(payload.len() + 4);
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, payload.len() as u32);
        framed.extend_from_slice(&len);
        framed.extend_from_slice(&payload);
        framed
    }

    /// Parses the payload of a connection header (length prefix already
    /// consumed by the caller, see [`read_header`]).
    pub fn from_bytes(payload: &[u8]) -> Result<Self, HeaderError> {
        let mut fields = HashMap::new();
        let mut cursor = 0usize;
        while cursor < payload.len() {
            if payload.len() - cursor < 4 {
                return Err(HeaderError::Malformed(
                    "truncated field length prefix".to_owned(),
                ));
            }
            let field_len = LittleEndian::read_u32(&payload[cursor..cursor + 4]) as usize;
            cursor += 4;
            if payload.len() - cursor < field_len {
                return Err(HeaderError::Malformed("truncated field body".to_owned()));
            }
            let field_bytes = &payload[cursor..cursor + field_len];
            cursor += field_len;

            let record = std::str::from_utf8(field_bytes)
                .map_err(|e| HeaderError::Malformed(e.to_string()))?;
            let (key, value) = record
                .split_once('=')
                .ok_or_else(|| HeaderError::Malformed(format!("field has no '=': {record}")))?;
            fields.insert(key.to_owned(), value.to_owned());
        }

        Ok(ConnectionHeader {
            caller_id: fields
                .remove("callerid")
                .ok_or(HeaderError::MissingField("callerid"))?,
            topic: fields.remove("topic"),
            topic_type: fields
                .remove("type")
                .ok_or(HeaderError::MissingField("type"))?,
            md5sum: fields
                .remove("md5sum")
                .ok_or(HeaderError::MissingField("md5sum"))?,
        })
    }
}

fn write_field(buf: &mut Vec<u8>, key: &str, value: &str) {
    let record = format!("{key}={value}");
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, record.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(record.as_bytes());
}

/// Reads the outer length prefix, then the payload, then parses it.
pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ConnectionHeader, HeaderError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = LittleEndian::read_u32(&len_bytes) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    ConnectionHeader::from_bytes(&payload)
}

/// Writes a fully-framed header to the wire.
pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &ConnectionHeader,
) -> Result<(), std::io::Error> {
    writer.write_all(&header.to_bytes()).await
}

/// Validates a peer's header against this side's locally expected type
/// name and md5sum, per spec: `type` must match exactly, `md5sum` must
/// match exactly unless the peer sent the generic-subscriber wildcard.
pub fn validate_peer(
    received: &ConnectionHeader,
    expected_type: &str,
    expected_md5: &str,
) -> Result<(), HeaderError> {
    if received.topic_type != expected_type {
        return Err(HeaderError::TypeMismatch {
            expected: expected_type.to_owned(),
            received: received.topic_type.clone(),
        });
    }
    if received.md5sum != WILDCARD_MD5 && received.md5sum != expected_md5 {
        return Err(HeaderError::Md5Mismatch {
            expected: expected_md5.to_owned(),
            received: received.md5sum.clone(),
        });
    }
    Ok(())
}
