//! Parameter roles.
//!
//! Every named parameter carries its role in its type. A role is one of the
//! zero-sized markers below; [`ParameterType`] names the same set at run
//! time, for messages and logs.

use std::fmt;

/// Every parameter position an operation may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// Data sent by this rank
    SendBuf,
    /// Data received by this rank
    RecvBuf,
    /// Data sent by the root and received by everyone else
    SendRecvBuf,
    /// Number of elements sent to each rank
    SendCounts,
    /// Number of elements received from each rank
    RecvCounts,
    /// Offset of each rank's block in the send buffer
    SendDispls,
    /// Offset of each rank's block in the receive buffer
    RecvDispls,
    /// Number of elements received
    RecvCount,
    /// Number of elements sent by the root and received by everyone else
    SendRecvCount,
    /// Explicit datatype of the send buffer
    SendType,
    /// Explicit datatype of the receive buffer
    RecvType,
    /// Explicit datatype of the send/receive buffer
    SendRecvType,
    /// Root rank of a rooted collective
    Root,
    /// Receiver of a point-to-point message
    Destination,
    /// Sender of a point-to-point message
    Source,
    /// Message tag
    Tag,
    /// Status of one receive
    Status,
    /// Statuses of several requests
    Statuses,
    /// Request slot of a nonblocking operation
    Request,
    /// Reduction operator
    Op,
    /// Point-to-point send mode
    SendMode,
    /// Result an exclusive scan reports on rank 0
    ValuesOnRank0,
}

impl ParameterType {
    /// The parameter's factory name.
    pub fn name(self) -> &'static str {
        match self {
            ParameterType::SendBuf => "send_buf",
            ParameterType::RecvBuf => "recv_buf",
            ParameterType::SendRecvBuf => "send_recv_buf",
            ParameterType::SendCounts => "send_counts",
            ParameterType::RecvCounts => "recv_counts",
            ParameterType::SendDispls => "send_displs",
            ParameterType::RecvDispls => "recv_displs",
            ParameterType::RecvCount => "recv_count",
            ParameterType::SendRecvCount => "send_recv_count",
            ParameterType::SendType => "send_type",
            ParameterType::RecvType => "recv_type",
            ParameterType::SendRecvType => "send_recv_type",
            ParameterType::Root => "root",
            ParameterType::Destination => "destination",
            ParameterType::Source => "source",
            ParameterType::Tag => "tag",
            ParameterType::Status => "status",
            ParameterType::Statuses => "statuses",
            ParameterType::Request => "request",
            ParameterType::Op => "op",
            ParameterType::SendMode => "send_mode",
            ParameterType::ValuesOnRank0 => "values_on_rank_0",
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A compile-time role tag.
pub trait Role: sealed::Sealed + Copy + Default + 'static {
    /// The role's run-time name.
    const PARAMETER: ParameterType;
}

/// A named parameter.
#[diagnostic::on_unimplemented(
    message = "`{Self}` is not a named parameter",
    label = "build this argument with a factory such as `send_buf(..)` or `root(..)`"
)]
pub trait Parameter {
    /// The position this parameter fills.
    type Role: Role;

    /// Run-time name of the role.
    fn parameter_type(&self) -> ParameterType {
        Self::Role::PARAMETER
    }
}

macro_rules! define_roles {
    ($($name:ident),* $(,)?) => {
        $(
            #[doc = concat!("Role tag of the `", stringify!($name), "` parameter.")]
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
            pub struct $name;

            impl sealed::Sealed for $name {}

            impl Role for $name {
                const PARAMETER: ParameterType = ParameterType::$name;
            }
        )*
    };
}

define_roles!(
    SendBuf,
    RecvBuf,
    SendRecvBuf,
    SendCounts,
    RecvCounts,
    SendDispls,
    RecvDispls,
    RecvCount,
    SendRecvCount,
    SendType,
    RecvType,
    SendRecvType,
    Root,
    Destination,
    Source,
    Tag,
    Status,
    Statuses,
    Request,
    Op,
    SendMode,
    ValuesOnRank0,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_markers_name_their_parameter() {
        assert_eq!(SendBuf::PARAMETER, ParameterType::SendBuf);
        assert_eq!(ValuesOnRank0::PARAMETER.name(), "values_on_rank_0");
        assert_eq!(ParameterType::SendRecvCount.to_string(), "send_recv_count");
    }
}
