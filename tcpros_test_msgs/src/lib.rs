//! Hand-written [`tcpros_common::RosMessage`] fixtures used by
//! `tcpros_node`'s tests and doc examples.
//!
//! In a full ROS toolchain these would be generated from `.msg` IDL
//! files by a code generator (out of scope for this crate, see
//! `SPEC_FULL.md`). The type names and md5sums below match the real
//! `std_msgs` definitions so that fixtures built against this crate
//! remain byte-compatible with genuine ROS1 tools.

use serde::{Deserialize, Serialize};
use tcpros_common::RosMessage;

/// Mirrors `std_msgs/String`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringMsg {
    pub data: String,
}

impl RosMessage for StringMsg {
    const ROS_TYPE_NAME: &'static str = "std_msgs/String";
    const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
}

/// Mirrors `std_msgs/Int32`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int32 {
    pub data: i32,
}

impl RosMessage for Int32 {
    const ROS_TYPE_NAME: &'static str = "std_msgs/Int32";
    const MD5SUM: &'static str = "da5909fbe378aeaf85e547e830cc1bb7";
}

/// A second, incompatible message type with the same field shape as
/// [`StringMsg`] but a different type name and md5sum, for exercising
/// negotiation-failure paths (spec.md §8 scenario 2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherMsg {
    pub data: String,
}

impl RosMessage for OtherMsg {
    const ROS_TYPE_NAME: &'static str = "tcpros_test_msgs/Other";
    const MD5SUM: &'static str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
}
