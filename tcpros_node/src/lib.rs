//! `tcpros_node`: the client-side runtime of a TCPROS publish/subscribe
//! node.
//!
//! Three pieces, tightly coupled: the [`node`] registry owns transports,
//! the [`subscriber`]/[`publisher`] transports deliver into
//! [`stream`]s, and streams drive publications. [`codec`] and [`header`]
//! are the wire-level building blocks the transports are built from.
//!
//! Out of scope, by design (see `SPEC_FULL.md`): the XML-RPC master/slave
//! API, `.msg` code generation, stream combinators beyond [`stream`]'s
//! lifting helper, and any CLI front-end. [`node::NodeHandle`] is exactly
//! the facade an out-of-scope RPC layer would hold and drive.

pub mod codec;
pub mod header;
pub mod node;
pub mod stats;
pub mod stream;
pub mod subscriber;

pub mod publisher;

pub use node::{run_node, NodeError, NodeHandle, NodeResult, SUBSCRIPTION_QUEUE_SIZE};
pub use publisher::DEFAULT_QUEUE_SIZE;
pub use stats::{PeerStats, TopicSnapshot};
pub use stream::{Deferred, MessageStream};
pub use tcpros_common::RosMessage;
