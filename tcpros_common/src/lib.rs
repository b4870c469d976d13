//! Common types and traits used throughout the `tcpros_node` ecosystem.
//!
//! Split out from `tcpros_node` so that message-defining crates (such as
//! `tcpros_test_msgs`) can implement [`RosMessage`] without depending on the
//! transport and registry machinery itself.

/// The central error type returned from node-facing operations.
///
/// Connection-local failures (negotiation, decode, I/O on one socket) are
/// absorbed by the task that owns that connection and never surface here;
/// this type is reserved for failures that are meaningful to report back to
/// the caller of a [`RosMessage`]-generic API like `advertise`/`subscribe`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A topic was already advertised or subscribed; construction-time
    /// configuration error, fatal to the caller of the registry operation.
    #[error("topic '{0}' is already {1}")]
    DuplicateTopic(String, &'static str),
    /// Fundamental networking failure (bind, listen) setting up a
    /// publication's listening socket.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// A topic name failed ROS's naming rules.
    #[error("invalid topic name: {0}")]
    InvalidName(String),
}

/// Generic result type used throughout `tcpros_node`.
pub type Result<T> = std::result::Result<T, Error>;

/// Fundamental trait satisfied by every message type this crate works with.
///
/// In a full ROS toolchain this trait is implemented by code generated from
/// `.msg` IDL files (out of scope here, see `tcpros_test_msgs` for
/// hand-written stand-ins used in tests). The core transport is otherwise
/// indifferent to how an implementation came to exist: it only needs the
/// type name, the md5sum, and `serde` (de)serialization so that
/// `serde_rosmsg` can provide the encode/decode pair.
pub trait RosMessage:
    'static
    + Send
    + Sync
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
{
    /// `package/Type`, e.g. `std_msgs/String`.
    const ROS_TYPE_NAME: &'static str;
    /// MD5 signature of the message's schema (and its dependencies' schemas).
    const MD5SUM: &'static str;
}

/// Validates a topic name against ROS's minimal naming convention: non-empty,
/// prefixed with `/`.
pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.starts_with('/') {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}
