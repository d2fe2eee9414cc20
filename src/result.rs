//! Operation results.
//!
//! A wrapped operation returns an [`MpiResult`] holding exactly the outputs
//! the caller left to the library: buffers it allocated, counts it computed,
//! the status it produced. Each slot is either [`NotPresent`] or
//! [`Present`]; the `extract_*` accessors only exist for present slots, so
//! asking for an output the call did not produce fails to compile.
//!
//! ```
//! use mpiparams::local;
//! use mpiparams::params::{root, send_buf};
//!
//! let gathered = local::run(3, |mpi| {
//!     let world = mpi.world();
//!     let mine = [world.rank()];
//!     // No recv_buf given: the library allocates one and returns it.
//!     world.gather((send_buf(&mine), root(0))).unwrap().into_value()
//! });
//! assert_eq!(gathered[0], vec![0, 1, 2]);
//! assert!(gathered[1].is_empty());
//! ```
//!
//! Nonblocking operations return a [`NonBlockingResult`] instead, which
//! yields the `MpiResult` once its request completes.

use crate::error::{Error, Result};
use crate::request::RequestHandle;
use crate::status::Status;

/// An output the call did not produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotPresent;

/// An output the call produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Present<V>(pub V);

/// One slot of a result.
pub trait ResultPart {
    /// What the slot yields once unwrapped: the value, or `()`.
    type Value;
    /// Whether the slot holds a value.
    const PRESENT: bool;

    /// Unwrap the slot.
    fn into_value(self) -> Self::Value;
}

impl ResultPart for NotPresent {
    type Value = ();
    const PRESENT: bool = false;

    fn into_value(self) {}
}

impl<V> ResultPart for Present<V> {
    type Value = V;
    const PRESENT: bool = true;

    fn into_value(self) -> V {
        self.0
    }
}

/// Outputs of a wrapped operation, named by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MpiResult<
    RecvBuf = NotPresent,
    SendRecvBuf = NotPresent,
    RecvCounts = NotPresent,
    RecvDispls = NotPresent,
    SendDispls = NotPresent,
    RecvCount = NotPresent,
    SendRecvCount = NotPresent,
    Stat = NotPresent,
> {
    /// The receive buffer
    pub recv_buf: RecvBuf,
    /// The send/receive buffer
    pub send_recv_buf: SendRecvBuf,
    /// Per-rank receive counts
    pub recv_counts: RecvCounts,
    /// Per-rank receive displacements
    pub recv_displs: RecvDispls,
    /// Per-rank send displacements
    pub send_displs: SendDispls,
    /// Number of elements received
    pub recv_count: RecvCount,
    /// Number of elements broadcast
    pub send_recv_count: SendRecvCount,
    /// Status of the receive
    pub status: Stat,
}

impl MpiResult {
    /// A result with no outputs.
    pub fn new() -> Self {
        MpiResult::default()
    }
}

macro_rules! not_present {
    ($ignored:ident) => {
        NotPresent
    };
}

macro_rules! result_slots {
    ($($field:ident: $generic:ident => $extract:ident, $with:ident;)*) => {
        result_slots!(@slot [] [$($field: $generic => $extract, $with;)*]);
    };
    (@slot [$($bf:ident: $bg:ident),*] []) => {};
    (
        @slot [$($bf:ident: $bg:ident),*]
        [$f:ident: $g:ident => $extract:ident, $with:ident; $($af:ident: $ag:ident => $aext:ident, $awith:ident;)*]
    ) => {
        impl<V, $($bg,)* $($ag,)*> MpiResult<$($bg,)* Present<V>, $($ag,)*> {
            #[doc = concat!("Take the `", stringify!($f), "` output, leaving the rest of the result.")]
            pub fn $extract(self) -> (V, MpiResult<$($bg,)* NotPresent, $($ag,)*>) {
                (
                    self.$f.0,
                    MpiResult {
                        $($bf: self.$bf,)*
                        $f: NotPresent,
                        $($af: self.$af,)*
                    },
                )
            }
        }

        impl<$($bg,)* $($ag,)*> MpiResult<$($bg,)* NotPresent, $($ag,)*> {
            pub(crate) fn $with<X: ResultPart>(self, part: X) -> MpiResult<$($bg,)* X, $($ag,)*> {
                MpiResult {
                    $($bf: self.$bf,)*
                    $f: part,
                    $($af: self.$af,)*
                }
            }
        }

        impl<V> MpiResult<$(not_present!($bg),)* Present<V>, $(not_present!($ag),)*> {
            #[doc = concat!("The `", stringify!($f), "` output, the only one this result holds.")]
            pub fn into_value(self) -> V {
                self.$f.0
            }
        }

        result_slots!(@slot [$($bf: $bg,)* $f: $g] [$($af: $ag => $aext, $awith;)*]);
    };
}

result_slots! {
    recv_buf: RecvBuf => extract_recv_buffer, with_recv_buf;
    send_recv_buf: SendRecvBuf => extract_send_recv_buffer, with_send_recv_buf;
    recv_counts: RecvCounts => extract_recv_counts, with_recv_counts;
    recv_displs: RecvDispls => extract_recv_displs, with_recv_displs;
    send_displs: SendDispls => extract_send_displs, with_send_displs;
    recv_count: RecvCount => extract_recv_count, with_recv_count;
    send_recv_count: SendRecvCount => extract_send_recv_count, with_send_recv_count;
    status: Stat => extract_status, with_status;
}

/// The deferred part of a nonblocking operation: buffers that must stay put
/// until the request completes, and how to turn them into a result.
pub trait Completion {
    /// The result once the request completed.
    type Output;

    /// Assemble the result from the completion status.
    fn complete(self, status: Status) -> Result<Self::Output>;
}

/// A nonblocking operation in flight.
///
/// Holds the request and every buffer the operation still uses. Complete it
/// with [`wait`](Self::wait) or [`test`](Self::test). Dropping it while the
/// request is active either waits on an owned request (with a warning) or
/// hands the buffers to the owning [`RequestPool`](crate::request::RequestPool)
/// until the pool completes them.
#[must_use = "dropping a pending result waits on its request"]
pub struct NonBlockingResult<H, C>
where
    H: RequestHandle<C>,
{
    handle: H,
    pending: Option<C>,
}

impl<H: RequestHandle<C>, C> NonBlockingResult<H, C> {
    pub(crate) fn new(handle: H, pending: C) -> Self {
        NonBlockingResult {
            handle,
            pending: Some(pending),
        }
    }

    /// The request handle.
    pub fn request(&self) -> &H {
        &self.handle
    }

    /// True once the result was obtained through `wait` or `test`.
    pub fn is_complete(&self) -> bool {
        self.pending.is_none()
    }
}

impl<H: RequestHandle<C>, C: Completion> NonBlockingResult<H, C> {
    /// Block until the request completes and return the outputs.
    pub fn wait(mut self) -> Result<C::Output> {
        let pending = self.take_pending()?;
        let status = self.handle.wait_status()?;
        pending.complete(status)
    }

    /// Check the request; on completion return the outputs.
    ///
    /// Once this returned `Some`, further calls fail with
    /// [`Error::LogicError`].
    pub fn test(&mut self) -> Result<Option<C::Output>> {
        if self.pending.is_none() {
            return Err(already_completed());
        }
        match self.handle.test_status()? {
            Some(status) => self.take_pending()?.complete(status).map(Some),
            None => Ok(None),
        }
    }

    fn take_pending(&mut self) -> Result<C> {
        self.pending.take().ok_or_else(already_completed)
    }
}

fn already_completed() -> Error {
    Error::LogicError("the nonblocking result was already obtained".into())
}

impl<H: RequestHandle<C>, C> Drop for NonBlockingResult<H, C> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.handle.abandon(pending);
        }
    }
}

impl<H: RequestHandle<C>, C> std::fmt::Debug for NonBlockingResult<H, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingResult")
            .field("active", &self.handle.is_active())
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_leaves_the_rest() {
        let result = MpiResult::new()
            .with_recv_buf(Present(vec![1, 2]))
            .with_recv_counts(Present(vec![1, 1]));
        let (buf, rest) = result.extract_recv_buffer();
        assert_eq!(buf, vec![1, 2]);
        let (counts, rest) = rest.extract_recv_counts();
        assert_eq!(counts, vec![1, 1]);
        assert_eq!(rest, MpiResult::new());
    }

    #[test]
    fn single_output_converts_to_its_value() {
        let result = MpiResult::new().with_send_recv_count(Present(7));
        assert_eq!(result.into_value(), 7);

        let result = MpiResult::new()
            .with_recv_buf(NotPresent)
            .with_status(Present(Status::default()));
        assert_eq!(result.into_value(), Status::default());
    }

    #[test]
    fn parts_unwrap_to_value_or_unit() {
        assert!(<Present<u8> as ResultPart>::PRESENT);
        assert!(!<NotPresent as ResultPart>::PRESENT);
        assert_eq!(Present(3).into_value(), 3);
        let () = NotPresent.into_value();
    }
}
