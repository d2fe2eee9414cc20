//! Transport over a system MPI library.
//!
//! Every method forwards to one function of the C shim; handles are the
//! shim's table indices. MPI may be initialized once per process, which
//! [`MpiTransport::init_thread`] enforces.

use super::{
    AnyOutcome, RawBuf, RawBufMut, RawComm, RawDatatype, RawOp, RawRequest, RawStatus, RawVBuf,
    RawVBufMut, Sentinels, SendMode, Transport, UserFunction,
};
use crate::datatype::BuiltinType;
use crate::error::{Error, MpiErrorClass, Result};
use crate::ffi;
use crate::operation::BuiltinOp;
use crate::ThreadLevel;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global flag to track if MPI has been initialized
static MPI_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The system MPI library.
///
/// Created by [`Mpi::init`](crate::Mpi::init); finalizes MPI when the
/// environment owning it is dropped.
#[derive(Debug)]
pub struct MpiTransport {
    sentinels: Sentinels,
    tag_ub: i32,
}

impl MpiTransport {
    /// Initialize MPI with the specified thread support level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] on a second call, or the error
    /// `MPI_Init_thread` reported.
    pub fn init_thread(required: ThreadLevel) -> Result<(Self, ThreadLevel)> {
        if MPI_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let mut provided: c_int = 0;
        let ret = unsafe { ffi::mpiparams_init_thread(required as c_int, &mut provided) };
        if ret != 0 {
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::from_code(ret));
        }

        let mut sentinels = Sentinels {
            any_source: 0,
            any_tag: 0,
            proc_null: 0,
        };
        unsafe {
            ffi::mpiparams_sentinels(
                &mut sentinels.any_source,
                &mut sentinels.any_tag,
                &mut sentinels.proc_null,
            );
        }
        let mut tag_ub = 0;
        if let Err(err) = Error::check(unsafe { ffi::mpiparams_tag_ub(&mut tag_ub) }) {
            tracing::warn!(%err, tag_ub, "could not query MPI_TAG_UB");
        }

        let provided = ThreadLevel::from_raw(provided);
        tracing::debug!(
            ?required,
            ?provided,
            tag_ub,
            built_against = option_env!("MPI_VERSION").unwrap_or("unknown"),
            "MPI initialized"
        );
        Ok((MpiTransport { sentinels, tag_ub }, provided))
    }

    /// Check if MPI has been initialized.
    pub fn is_initialized() -> bool {
        let mut flag: c_int = 0;
        unsafe { ffi::mpiparams_initialized(&mut flag) };
        flag != 0
    }

    /// Check if MPI has been finalized.
    pub fn is_finalized() -> bool {
        let mut flag: c_int = 0;
        unsafe { ffi::mpiparams_finalized(&mut flag) };
        flag != 0
    }
}

/// Build an [`Error::Mpi`] from a code, asking the library for its class and
/// message.
pub(crate) fn error_from_code(code: i32) -> Error {
    let mut class: i32 = 0;
    let mut buf = [0u8; 512];
    let mut len: i32 = 0;
    let ret = unsafe {
        ffi::mpiparams_error_info(code, &mut class, buf.as_mut_ptr().cast(), &mut len)
    };
    if ret != 0 {
        return Error::transport(code, MpiErrorClass::Unknown, format!("MPI error code {code}"));
    }
    let len = (len.max(0) as usize).min(buf.len());
    let message = String::from_utf8_lossy(&buf[..len]).trim_end().to_string();
    Error::transport(code, MpiErrorClass::from_raw(class), message)
}

fn check(ret: c_int) -> Result<()> {
    Error::check(ret)
}

fn status_or_default(statuses: Option<&mut [RawStatus]>, n: usize) -> Result<*mut RawStatus> {
    match statuses {
        None => Ok(ptr::null_mut()),
        Some(s) if s.len() >= n => Ok(s.as_mut_ptr()),
        Some(s) => Err(Error::SizeMismatch {
            expected: n,
            actual: s.len(),
        }),
    }
}

fn completed_index(index: i64) -> Option<usize> {
    usize::try_from(index).ok()
}

/// View request handles as the shim's `int64_t` array.
fn request_ptr(requests: &mut [RawRequest]) -> *mut i64 {
    // RawRequest is repr(transparent) over i64
    requests.as_mut_ptr().cast()
}

impl Transport for MpiTransport {
    fn name(&self) -> &'static str {
        "mpi"
    }

    fn world(&self) -> RawComm {
        RawComm(unsafe { ffi::mpiparams_comm_world() })
    }

    fn comm_rank(&self, comm: RawComm) -> Result<i32> {
        let mut rank = 0;
        check(unsafe { ffi::mpiparams_comm_rank(comm.0, &mut rank) })?;
        Ok(rank)
    }

    fn comm_size(&self, comm: RawComm) -> Result<i32> {
        let mut size = 0;
        check(unsafe { ffi::mpiparams_comm_size(comm.0, &mut size) })?;
        Ok(size)
    }

    fn comm_dup(&self, comm: RawComm) -> Result<RawComm> {
        let mut handle = 0;
        check(unsafe { ffi::mpiparams_comm_dup(comm.0, &mut handle) })?;
        Ok(RawComm(handle))
    }

    fn comm_free(&self, comm: RawComm) -> Result<()> {
        check(unsafe { ffi::mpiparams_comm_free(comm.0) })
    }

    fn tag_upper_bound(&self) -> i32 {
        self.tag_ub
    }

    fn sentinels(&self) -> Sentinels {
        self.sentinels
    }

    fn wtime(&self) -> f64 {
        unsafe { ffi::mpiparams_wtime() }
    }

    fn version(&self) -> Result<String> {
        let mut buf = [0u8; 8192];
        let mut len: i32 = 0;
        check(unsafe { ffi::mpiparams_get_version(buf.as_mut_ptr().cast(), &mut len) })?;
        let len = (len.max(0) as usize).min(buf.len());
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|_| Error::Internal("Invalid UTF-8 in version string".into()))?;
        Ok(s.trim_end_matches(['\0', '\n']).to_string())
    }

    fn finalize(&self) -> Result<()> {
        if !MPI_INITIALIZED.load(Ordering::SeqCst) || Self::is_finalized() {
            return Ok(());
        }
        tracing::debug!("finalizing MPI");
        let ret = unsafe { ffi::mpiparams_finalize() };
        MPI_INITIALIZED.store(false, Ordering::SeqCst);
        check(ret)
    }

    fn builtin_datatype(&self, ty: BuiltinType) -> RawDatatype {
        RawDatatype(unsafe { ffi::mpiparams_builtin_datatype(ty as i32) })
    }

    fn type_contiguous(&self, count: i32, base: RawDatatype) -> Result<RawDatatype> {
        let mut handle = 0;
        check(unsafe { ffi::mpiparams_type_contiguous(count, base.0, &mut handle) })?;
        Ok(RawDatatype(handle))
    }

    fn type_create_struct(
        &self,
        blocklengths: &[i32],
        displacements: &[isize],
        types: &[RawDatatype],
        extent: isize,
    ) -> Result<RawDatatype> {
        if blocklengths.len() != displacements.len() || blocklengths.len() != types.len() {
            return Err(Error::InvalidArgument(format!(
                "struct layout with {} block lengths, {} displacements and {} types",
                blocklengths.len(),
                displacements.len(),
                types.len()
            )));
        }
        let count = crate::comm::count_of(blocklengths.len())?;
        let displs: Vec<i64> = displacements.iter().map(|&d| d as i64).collect();
        let handles: Vec<i32> = types.iter().map(|t| t.0).collect();
        let mut handle = 0;
        check(unsafe {
            ffi::mpiparams_type_create_struct(
                count,
                blocklengths.as_ptr(),
                displs.as_ptr(),
                handles.as_ptr(),
                extent as i64,
                &mut handle,
            )
        })?;
        Ok(RawDatatype(handle))
    }

    fn type_commit(&self, datatype: RawDatatype) -> Result<()> {
        check(unsafe { ffi::mpiparams_type_commit(datatype.0) })
    }

    fn type_free(&self, datatype: RawDatatype) -> Result<()> {
        check(unsafe { ffi::mpiparams_type_free(datatype.0) })
    }

    fn type_size(&self, datatype: RawDatatype) -> Result<usize> {
        let mut size: i64 = 0;
        check(unsafe { ffi::mpiparams_type_size(datatype.0, &mut size) })?;
        Ok(size.max(0) as usize)
    }

    fn builtin_op(&self, op: BuiltinOp) -> RawOp {
        RawOp(unsafe { ffi::mpiparams_builtin_op(op as i32) })
    }

    fn op_create(&self, func: UserFunction, ctx: *mut c_void, commute: bool) -> Result<RawOp> {
        let mut handle = 0;
        let ret = unsafe { ffi::mpiparams_op_create(func, ctx, c_int::from(commute), &mut handle) };
        check(ret).map_err(|err| Error::OperatorConstruction(err.to_string()))?;
        Ok(RawOp(handle))
    }

    fn op_free(&self, op: RawOp) -> Result<()> {
        check(unsafe { ffi::mpiparams_op_free(op.0) })
    }

    unsafe fn send(
        &self,
        mode: SendMode,
        buf: RawBuf,
        dest: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<()> {
        check(ffi::mpiparams_send(
            mode as i32,
            buf.ptr,
            buf.count,
            buf.datatype.0,
            dest,
            tag,
            comm.0,
        ))
    }

    unsafe fn isend(
        &self,
        mode: SendMode,
        buf: RawBuf,
        dest: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<RawRequest> {
        let mut request = RawRequest::NULL.0;
        check(ffi::mpiparams_isend(
            mode as i32,
            buf.ptr,
            buf.count,
            buf.datatype.0,
            dest,
            tag,
            comm.0,
            &mut request,
        ))?;
        Ok(RawRequest(request))
    }

    unsafe fn recv(
        &self,
        buf: RawBufMut,
        source: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<RawStatus> {
        let mut status = RawStatus::default();
        check(ffi::mpiparams_recv(
            buf.ptr,
            buf.count,
            buf.datatype.0,
            source,
            tag,
            comm.0,
            &mut status,
        ))?;
        Ok(status)
    }

    unsafe fn irecv(
        &self,
        buf: RawBufMut,
        source: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<RawRequest> {
        let mut request = RawRequest::NULL.0;
        check(ffi::mpiparams_irecv(
            buf.ptr,
            buf.count,
            buf.datatype.0,
            source,
            tag,
            comm.0,
            &mut request,
        ))?;
        Ok(RawRequest(request))
    }

    fn probe(&self, source: i32, tag: i32, comm: RawComm) -> Result<RawStatus> {
        let mut status = RawStatus::default();
        check(unsafe { ffi::mpiparams_probe(source, tag, comm.0, &mut status) })?;
        Ok(status)
    }

    fn iprobe(&self, source: i32, tag: i32, comm: RawComm) -> Result<Option<RawStatus>> {
        let mut status = RawStatus::default();
        let mut flag = 0;
        check(unsafe { ffi::mpiparams_iprobe(source, tag, comm.0, &mut flag, &mut status) })?;
        Ok((flag != 0).then_some(status))
    }

    fn wait(&self, request: &mut RawRequest) -> Result<RawStatus> {
        let mut status = RawStatus::default();
        check(unsafe { ffi::mpiparams_wait(&mut request.0, &mut status) })?;
        Ok(status)
    }

    fn test(&self, request: &mut RawRequest) -> Result<Option<RawStatus>> {
        let mut status = RawStatus::default();
        let mut flag = 0;
        check(unsafe { ffi::mpiparams_test(&mut request.0, &mut flag, &mut status) })?;
        Ok((flag != 0).then_some(status))
    }

    fn wait_all(
        &self,
        requests: &mut [RawRequest],
        statuses: Option<&mut [RawStatus]>,
    ) -> Result<()> {
        let n = requests.len();
        let statuses = status_or_default(statuses, n)?;
        check(unsafe { ffi::mpiparams_waitall(n as i64, request_ptr(requests), statuses) })
    }

    fn test_all(
        &self,
        requests: &mut [RawRequest],
        statuses: Option<&mut [RawStatus]>,
    ) -> Result<bool> {
        let n = requests.len();
        let statuses = status_or_default(statuses, n)?;
        let mut flag = 0;
        check(unsafe {
            ffi::mpiparams_testall(n as i64, request_ptr(requests), &mut flag, statuses)
        })?;
        Ok(flag != 0)
    }

    fn wait_any(&self, requests: &mut [RawRequest]) -> Result<Option<(usize, RawStatus)>> {
        let mut index: i64 = -1;
        let mut status = RawStatus::default();
        check(unsafe {
            ffi::mpiparams_waitany(
                requests.len() as i64,
                request_ptr(requests),
                &mut index,
                &mut status,
            )
        })?;
        Ok(completed_index(index).map(|i| (i, status)))
    }

    fn test_any(&self, requests: &mut [RawRequest]) -> Result<AnyOutcome> {
        let mut index: i64 = -1;
        let mut flag = 0;
        let mut status = RawStatus::default();
        check(unsafe {
            ffi::mpiparams_testany(
                requests.len() as i64,
                request_ptr(requests),
                &mut index,
                &mut flag,
                &mut status,
            )
        })?;
        Ok(match (flag != 0, completed_index(index)) {
            (true, Some(i)) => AnyOutcome::Completed(i, status),
            (true, None) => AnyOutcome::NoneActive,
            (false, _) => AnyOutcome::Pending,
        })
    }

    fn request_free(&self, request: &mut RawRequest) -> Result<()> {
        check(unsafe { ffi::mpiparams_request_free(&mut request.0) })
    }

    fn barrier(&self, comm: RawComm) -> Result<()> {
        check(unsafe { ffi::mpiparams_barrier(comm.0) })
    }

    unsafe fn bcast(&self, buf: RawBufMut, root: i32, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_bcast(buf.ptr, buf.count, buf.datatype.0, root, comm.0))
    }

    unsafe fn gather(&self, send: RawBuf, recv: RawBufMut, root: i32, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_gather(
            send.ptr,
            send.count,
            send.datatype.0,
            recv.ptr,
            recv.count,
            recv.datatype.0,
            root,
            comm.0,
        ))
    }

    unsafe fn gatherv(
        &self,
        send: RawBuf,
        recv: RawVBufMut<'_>,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        check(ffi::mpiparams_gatherv(
            send.ptr,
            send.count,
            send.datatype.0,
            recv.ptr,
            recv.counts.as_ptr(),
            recv.displs.as_ptr(),
            recv.datatype.0,
            root,
            comm.0,
        ))
    }

    unsafe fn scatter(
        &self,
        send: RawBuf,
        recv: RawBufMut,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        check(ffi::mpiparams_scatter(
            send.ptr,
            send.count,
            send.datatype.0,
            recv.ptr,
            recv.count,
            recv.datatype.0,
            root,
            comm.0,
        ))
    }

    unsafe fn scatterv(
        &self,
        send: RawVBuf<'_>,
        recv: RawBufMut,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        check(ffi::mpiparams_scatterv(
            send.ptr,
            send.counts.as_ptr(),
            send.displs.as_ptr(),
            send.datatype.0,
            recv.ptr,
            recv.count,
            recv.datatype.0,
            root,
            comm.0,
        ))
    }

    unsafe fn allgather(&self, send: RawBuf, recv: RawBufMut, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_allgather(
            send.ptr,
            send.count,
            send.datatype.0,
            recv.ptr,
            recv.count,
            recv.datatype.0,
            comm.0,
        ))
    }

    unsafe fn allgatherv(&self, send: RawBuf, recv: RawVBufMut<'_>, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_allgatherv(
            send.ptr,
            send.count,
            send.datatype.0,
            recv.ptr,
            recv.counts.as_ptr(),
            recv.displs.as_ptr(),
            recv.datatype.0,
            comm.0,
        ))
    }

    unsafe fn alltoall(&self, send: RawBuf, recv: RawBufMut, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_alltoall(
            send.ptr,
            send.count,
            send.datatype.0,
            recv.ptr,
            recv.count,
            recv.datatype.0,
            comm.0,
        ))
    }

    unsafe fn alltoallv(
        &self,
        send: RawVBuf<'_>,
        recv: RawVBufMut<'_>,
        comm: RawComm,
    ) -> Result<()> {
        check(ffi::mpiparams_alltoallv(
            send.ptr,
            send.counts.as_ptr(),
            send.displs.as_ptr(),
            send.datatype.0,
            recv.ptr,
            recv.counts.as_ptr(),
            recv.displs.as_ptr(),
            recv.datatype.0,
            comm.0,
        ))
    }

    unsafe fn reduce(
        &self,
        send: RawBuf,
        recv: RawBufMut,
        op: RawOp,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        check(ffi::mpiparams_reduce(
            send.ptr,
            recv.ptr,
            send.count,
            send.datatype.0,
            op.0,
            root,
            comm.0,
        ))
    }

    unsafe fn allreduce(
        &self,
        send: Option<RawBuf>,
        recv: RawBufMut,
        op: RawOp,
        comm: RawComm,
    ) -> Result<()> {
        let send_ptr = send.map_or(ptr::null(), |s| s.ptr);
        check(ffi::mpiparams_allreduce(
            send_ptr,
            recv.ptr,
            recv.count,
            recv.datatype.0,
            op.0,
            comm.0,
        ))
    }

    unsafe fn scan(&self, send: RawBuf, recv: RawBufMut, op: RawOp, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_scan(
            send.ptr,
            recv.ptr,
            send.count,
            send.datatype.0,
            op.0,
            comm.0,
        ))
    }

    unsafe fn exscan(&self, send: RawBuf, recv: RawBufMut, op: RawOp, comm: RawComm) -> Result<()> {
        check(ffi::mpiparams_exscan(
            send.ptr,
            recv.ptr,
            send.count,
            send.datatype.0,
            op.0,
            comm.0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_handles_share_the_shim_layout() {
        assert_eq!(std::mem::size_of::<RawRequest>(), std::mem::size_of::<i64>());
        assert_eq!(std::mem::align_of::<RawRequest>(), std::mem::align_of::<i64>());
    }

    #[test]
    fn completed_index_rejects_undefined() {
        assert_eq!(completed_index(-1), None);
        assert_eq!(completed_index(3), Some(3));
    }
}
