//! Message status information.
//!
//! This module provides the [`Status`] struct produced by receives, probes
//! and request completion, describing a message's envelope and length.

use crate::transport::RawStatus;

/// Information about a received or probed message.
///
/// Obtained through the `status` parameters (`status_out()`,
/// `status(&mut s)`), from [`Communicator::probe`](crate::Communicator::probe)
/// and from request completion.
///
/// # Example
///
/// ```
/// use mpiparams::local;
/// use mpiparams::params::{destination, send_buf, source, tag};
///
/// local::run(2, |mpi| {
///     let world = mpi.world();
///     if world.rank() == 0 {
///         world.send((send_buf(&[1.5f64, 2.5]), destination(1), tag(9))).unwrap();
///     } else {
///         let status = world.probe((source(0), tag(9))).unwrap();
///         assert_eq!(status.source, 0);
///         assert_eq!(status.count::<f64>(), 2);
///     }
/// });
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Length of the message in bytes.
    pub bytes: usize,
}

impl Status {
    pub(crate) fn from_raw(raw: RawStatus) -> Self {
        Status {
            source: raw.source,
            tag: raw.tag,
            bytes: usize::try_from(raw.bytes).unwrap_or(0),
        }
    }

    /// Number of `T` elements in the message.
    ///
    /// Exact for predefined and contiguous types. Struct types whose layout
    /// has padding travel without it; use
    /// [`Communicator::element_count`](crate::Communicator::element_count)
    /// for those.
    pub fn count<T>(&self) -> usize {
        match std::mem::size_of::<T>() {
            0 => 0,
            size => self.bytes / size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_divides_by_element_size() {
        let status = Status {
            source: 3,
            tag: 1,
            bytes: 24,
        };
        assert_eq!(status.count::<f64>(), 3);
        assert_eq!(status.count::<u8>(), 24);
        assert_eq!(status.count::<()>(), 0);
    }

    #[test]
    fn negative_byte_counts_read_as_empty() {
        let status = Status::from_raw(RawStatus {
            source: 1,
            tag: 2,
            error: 0,
            bytes: -1,
        });
        assert_eq!(status.bytes, 0);
        assert_eq!(status.source, 1);
    }
}
