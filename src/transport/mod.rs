//! The message-passing primitive the parameter layer drives.
//!
//! [`Transport`] lists every facility the wrapped operations need: opaque
//! handles for communicators, datatypes, operators and requests, blocking and
//! nonblocking point-to-point transfers, the collectives, datatype and
//! operator construction, and request completion. Two implementations ship
//! with the crate:
//!
//! | Transport | Feature | Description |
//! |-----------|---------|-------------|
//! | [`mpi::MpiTransport`] | `mpi` | A system MPI library, through the C shim in `csrc/` |
//! | [`local::LocalTransport`] | none | Threads of one process acting as ranks |
//!
//! Handles are plain integers, as they are on the C side: the shim keeps
//! tables of `MPI_Comm`, `MPI_Datatype`, `MPI_Op` and `MPI_Request` and hands
//! out indices.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

use crate::datatype::BuiltinType;
use crate::error::{Error, Result};
use crate::operation::BuiltinOp;
use std::os::raw::{c_int, c_void};

/// Communicator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawComm(pub i32);

/// Datatype handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawDatatype(pub i32);

/// Reduction operator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawOp(pub i32);

/// Request handle. [`RawRequest::NULL`] marks an inactive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawRequest(pub i64);

impl RawRequest {
    /// The null request (`MPI_REQUEST_NULL`).
    pub const NULL: RawRequest = RawRequest(-1);

    /// True if this is the null request.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl Default for RawRequest {
    fn default() -> Self {
        Self::NULL
    }
}

/// Status of a completed receive or probe, laid out as the C shim writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStatus {
    /// Rank of the sender
    pub source: i32,
    /// Tag of the message
    pub tag: i32,
    /// Error code of the operation
    pub error: i32,
    /// Size of the message in bytes
    pub bytes: i64,
}

/// The transport's special rank and tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinels {
    /// `MPI_ANY_SOURCE`
    pub any_source: i32,
    /// `MPI_ANY_TAG`
    pub any_tag: i32,
    /// `MPI_PROC_NULL`
    pub proc_null: i32,
}

/// Point-to-point send modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum SendMode {
    /// `MPI_Send`: the library decides whether to buffer
    #[default]
    Standard = 0,
    /// `MPI_Bsend`: completes once the message is buffered locally
    Buffered = 1,
    /// `MPI_Ssend`: completes once the matching receive has started
    Synchronous = 2,
    /// `MPI_Rsend`: the matching receive must already be posted
    Ready = 3,
}

/// Outcome of a `test_any` over a set of requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyOutcome {
    /// The request at this index completed and is now null
    Completed(usize, RawStatus),
    /// At least one request is active but none has completed
    Pending,
    /// Every request is null
    NoneActive,
}

/// Signature of the C-ABI callback behind a user-defined operator.
///
/// Computes `inoutvec[i] = invec[i] op inoutvec[i]` for `len` elements. `ctx`
/// is the context pointer registered with [`Transport::op_create`]; it is
/// null for callables that carry no state.
pub type UserFunction =
    unsafe extern "C" fn(invec: *const c_void, inoutvec: *mut c_void, len: c_int, ctx: *mut c_void);

/// A contiguous send-side buffer description.
#[derive(Debug, Clone, Copy)]
pub struct RawBuf {
    /// First element
    pub ptr: *const c_void,
    /// Number of elements
    pub count: i32,
    /// Element datatype
    pub datatype: RawDatatype,
}

/// A contiguous receive-side buffer description.
#[derive(Debug, Clone, Copy)]
pub struct RawBufMut {
    /// First element
    pub ptr: *mut c_void,
    /// Number of elements
    pub count: i32,
    /// Element datatype
    pub datatype: RawDatatype,
}

/// A variable-count send-side buffer: one `(count, displacement)` per rank.
#[derive(Debug, Clone, Copy)]
pub struct RawVBuf<'a> {
    /// First element
    pub ptr: *const c_void,
    /// Elements per rank
    pub counts: &'a [i32],
    /// Offsets per rank, in elements
    pub displs: &'a [i32],
    /// Element datatype
    pub datatype: RawDatatype,
}

/// A variable-count receive-side buffer: one `(count, displacement)` per rank.
#[derive(Debug, Clone, Copy)]
pub struct RawVBufMut<'a> {
    /// First element
    pub ptr: *mut c_void,
    /// Elements per rank
    pub counts: &'a [i32],
    /// Offsets per rank, in elements
    pub displs: &'a [i32],
    /// Element datatype
    pub datatype: RawDatatype,
}

/// Bindings to a message-passing primitive.
///
/// Every method maps onto one MPI call. Methods taking raw buffer
/// descriptions are `unsafe`: the caller guarantees that each pointer is
/// valid for `count` elements of the given datatype for the duration of the
/// call (blocking) or until the returned request completes (nonblocking).
///
/// Buffers and counts on ranks where the MPI standard declares them
/// insignificant (e.g. the receive buffer of a gather on a non-root) may be
/// null / empty.
pub trait Transport {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    // ========================================================================
    // Environment
    // ========================================================================

    /// `MPI_COMM_WORLD`.
    fn world(&self) -> RawComm;
    /// Rank of the calling process in `comm`.
    fn comm_rank(&self, comm: RawComm) -> Result<i32>;
    /// Number of processes in `comm`.
    fn comm_size(&self, comm: RawComm) -> Result<i32>;
    /// Duplicate `comm` (collective).
    fn comm_dup(&self, comm: RawComm) -> Result<RawComm>;
    /// Free a communicator obtained from [`comm_dup`](Self::comm_dup).
    fn comm_free(&self, comm: RawComm) -> Result<()>;
    /// Largest valid tag (`MPI_TAG_UB`).
    fn tag_upper_bound(&self) -> i32;
    /// Special rank and tag values.
    fn sentinels(&self) -> Sentinels;
    /// Wall-clock time in seconds.
    fn wtime(&self) -> f64;
    /// Library version string.
    fn version(&self) -> Result<String>;
    /// Tear the transport down. Called once, after every handle was released.
    fn finalize(&self) -> Result<()>;

    // ========================================================================
    // Datatypes
    // ========================================================================

    /// Handle of a predefined datatype.
    fn builtin_datatype(&self, ty: BuiltinType) -> RawDatatype;
    /// `MPI_Type_contiguous`.
    fn type_contiguous(&self, count: i32, base: RawDatatype) -> Result<RawDatatype>;
    /// `MPI_Type_create_struct` followed by `MPI_Type_create_resized` to `extent`.
    fn type_create_struct(
        &self,
        blocklengths: &[i32],
        displacements: &[isize],
        types: &[RawDatatype],
        extent: isize,
    ) -> Result<RawDatatype>;
    /// `MPI_Type_commit`.
    fn type_commit(&self, datatype: RawDatatype) -> Result<()>;
    /// `MPI_Type_free`.
    fn type_free(&self, datatype: RawDatatype) -> Result<()>;
    /// `MPI_Type_size`, in bytes.
    fn type_size(&self, datatype: RawDatatype) -> Result<usize>;

    // ========================================================================
    // Operators
    // ========================================================================

    /// Handle of a predefined reduction operator.
    fn builtin_op(&self, op: BuiltinOp) -> RawOp;
    /// `MPI_Op_create` around `func`, which receives `ctx` on every call.
    fn op_create(&self, func: UserFunction, ctx: *mut c_void, commute: bool) -> Result<RawOp>;
    /// `MPI_Op_free`.
    fn op_free(&self, op: RawOp) -> Result<()>;

    // ========================================================================
    // Point-to-point
    // ========================================================================

    /// Blocking send in the given mode.
    ///
    /// # Safety
    ///
    /// `buf` must describe valid memory for the duration of the call.
    unsafe fn send(&self, mode: SendMode, buf: RawBuf, dest: i32, tag: i32, comm: RawComm)
        -> Result<()>;
    /// Nonblocking send in the given mode.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and unmodified until the request completes.
    unsafe fn isend(
        &self,
        mode: SendMode,
        buf: RawBuf,
        dest: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<RawRequest>;
    /// Blocking receive.
    ///
    /// # Safety
    ///
    /// `buf` must describe valid writable memory for the duration of the call.
    unsafe fn recv(&self, buf: RawBufMut, source: i32, tag: i32, comm: RawComm)
        -> Result<RawStatus>;
    /// Nonblocking receive.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and otherwise untouched until the request completes.
    unsafe fn irecv(&self, buf: RawBufMut, source: i32, tag: i32, comm: RawComm)
        -> Result<RawRequest>;
    /// Blocking probe.
    fn probe(&self, source: i32, tag: i32, comm: RawComm) -> Result<RawStatus>;
    /// Nonblocking probe.
    fn iprobe(&self, source: i32, tag: i32, comm: RawComm) -> Result<Option<RawStatus>>;

    // ========================================================================
    // Request completion
    // ========================================================================

    /// Block until `request` completes; sets it to null.
    fn wait(&self, request: &mut RawRequest) -> Result<RawStatus>;
    /// Check `request`; on completion sets it to null and returns the status.
    fn test(&self, request: &mut RawRequest) -> Result<Option<RawStatus>>;
    /// Block until every request completes.
    fn wait_all(&self, requests: &mut [RawRequest], statuses: Option<&mut [RawStatus]>)
        -> Result<()>;
    /// Check whether every request has completed.
    fn test_all(&self, requests: &mut [RawRequest], statuses: Option<&mut [RawStatus]>)
        -> Result<bool>;
    /// Block until one request completes. `None` if all are null.
    fn wait_any(&self, requests: &mut [RawRequest]) -> Result<Option<(usize, RawStatus)>>;
    /// Check whether any request has completed.
    fn test_any(&self, requests: &mut [RawRequest]) -> Result<AnyOutcome>;
    /// Release `request` without waiting for it; sets it to null.
    fn request_free(&self, request: &mut RawRequest) -> Result<()>;

    // ========================================================================
    // Collectives
    // ========================================================================

    /// `MPI_Barrier`.
    fn barrier(&self, comm: RawComm) -> Result<()>;
    /// `MPI_Bcast`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn bcast(&self, buf: RawBufMut, root: i32, comm: RawComm) -> Result<()>;
    /// `MPI_Gather`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn gather(&self, send: RawBuf, recv: RawBufMut, root: i32, comm: RawComm)
        -> Result<()>;
    /// `MPI_Gatherv`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn gatherv(&self, send: RawBuf, recv: RawVBufMut<'_>, root: i32, comm: RawComm)
        -> Result<()>;
    /// `MPI_Scatter`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn scatter(&self, send: RawBuf, recv: RawBufMut, root: i32, comm: RawComm)
        -> Result<()>;
    /// `MPI_Scatterv`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn scatterv(&self, send: RawVBuf<'_>, recv: RawBufMut, root: i32, comm: RawComm)
        -> Result<()>;
    /// `MPI_Allgather`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn allgather(&self, send: RawBuf, recv: RawBufMut, comm: RawComm) -> Result<()>;
    /// `MPI_Allgatherv`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn allgatherv(&self, send: RawBuf, recv: RawVBufMut<'_>, comm: RawComm)
        -> Result<()>;
    /// `MPI_Alltoall`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn alltoall(&self, send: RawBuf, recv: RawBufMut, comm: RawComm) -> Result<()>;
    /// `MPI_Alltoallv`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn alltoallv(&self, send: RawVBuf<'_>, recv: RawVBufMut<'_>, comm: RawComm)
        -> Result<()>;
    /// `MPI_Reduce`. `recv` is significant at the root only.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn reduce(&self, send: RawBuf, recv: RawBufMut, op: RawOp, root: i32, comm: RawComm)
        -> Result<()>;
    /// `MPI_Allreduce`. With `send = None` the reduction happens in place in `recv`.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn allreduce(&self, send: Option<RawBuf>, recv: RawBufMut, op: RawOp, comm: RawComm)
        -> Result<()>;
    /// `MPI_Scan`: inclusive prefix reduction in rank order.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn scan(&self, send: RawBuf, recv: RawBufMut, op: RawOp, comm: RawComm) -> Result<()>;
    /// `MPI_Exscan`: exclusive prefix reduction. `recv` is left untouched on rank 0.
    ///
    /// # Safety
    ///
    /// See the trait documentation.
    unsafe fn exscan(&self, send: RawBuf, recv: RawBufMut, op: RawOp, comm: RawComm)
        -> Result<()>;
}

impl std::fmt::Debug for dyn Transport + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport({})", self.name())
    }
}

/// Exclusive prefix sum of `counts`, the displacements of a tightly packed
/// variable-count buffer. Fails once the packed length leaves the `int`
/// range.
pub(crate) fn packed_displacements(counts: &[i32]) -> Result<Vec<i32>> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut offset = 0i32;
    for (i, &count) in counts.iter().enumerate() {
        displs.push(offset);
        offset = offset.checked_add(count).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "packing count {count} at index {i} after {offset} elements overflows an int displacement"
            ))
        })?;
    }
    Ok(displs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_request_is_default() {
        assert!(RawRequest::default().is_null());
        assert!(!RawRequest(3).is_null());
    }

    #[test]
    fn packed_displacements_are_exclusive_prefix_sums() {
        assert_eq!(packed_displacements(&[2, 0, 3, 1]).unwrap(), vec![0, 2, 2, 5]);
        assert!(packed_displacements(&[]).unwrap().is_empty());
        assert_eq!(packed_displacements(&[i32::MAX]).unwrap(), vec![0]);
    }

    #[test]
    fn packed_displacements_reject_int_overflow() {
        let err = packed_displacements(&[i32::MAX, 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
        assert!(packed_displacements(&[1, i32::MAX, 0]).is_err());
    }

    #[test]
    fn raw_status_layout_matches_c_struct() {
        // int32 source, tag, error; padding; int64 bytes
        assert_eq!(std::mem::size_of::<RawStatus>(), 24);
        assert_eq!(std::mem::align_of::<RawStatus>(), 8);
    }

    #[test]
    fn send_mode_values_match_c_defines() {
        assert_eq!(SendMode::Standard as i32, 0);
        assert_eq!(SendMode::Buffered as i32, 1);
        assert_eq!(SendMode::Synchronous as i32, 2);
        assert_eq!(SendMode::Ready as i32, 3);
    }
}
