//! Raw FFI bindings to the C shim in `csrc/mpiparams.c`.
//!
//! These are low-level unsafe functions. Use [`MpiTransport`](crate::transport::mpi::MpiTransport).

#![allow(non_camel_case_types)]

use crate::transport::RawStatus;
use std::os::raw::{c_char, c_double, c_int, c_void};

// Type aliases matching the C header
pub type int32_t = i32;
pub type int64_t = i64;

/// `mpiparams_status`, which [`RawStatus`] mirrors field for field.
pub type mpiparams_status = RawStatus;

/// `mpiparams_user_fn`
pub type mpiparams_user_fn =
    unsafe extern "C" fn(invec: *const c_void, inoutvec: *mut c_void, len: c_int, ctx: *mut c_void);

extern "C" {
    // ============================================================
    // Environment
    // ============================================================

    pub fn mpiparams_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn mpiparams_finalize() -> c_int;
    pub fn mpiparams_initialized(flag: *mut c_int) -> c_int;
    pub fn mpiparams_finalized(flag: *mut c_int) -> c_int;
    pub fn mpiparams_get_version(version: *mut c_char, len: *mut int32_t) -> c_int;
    pub fn mpiparams_error_info(
        code: c_int,
        error_class: *mut int32_t,
        message: *mut c_char,
        msg_len: *mut int32_t,
    ) -> c_int;
    pub fn mpiparams_wtime() -> c_double;
    pub fn mpiparams_tag_ub(value: *mut int32_t) -> c_int;
    pub fn mpiparams_sentinels(
        any_source: *mut int32_t,
        any_tag: *mut int32_t,
        proc_null: *mut int32_t,
    );

    // ============================================================
    // Communicators
    // ============================================================

    pub fn mpiparams_comm_world() -> int32_t;
    pub fn mpiparams_comm_rank(comm: int32_t, rank: *mut int32_t) -> c_int;
    pub fn mpiparams_comm_size(comm: int32_t, size: *mut int32_t) -> c_int;
    pub fn mpiparams_comm_dup(comm: int32_t, newcomm: *mut int32_t) -> c_int;
    pub fn mpiparams_comm_free(comm: int32_t) -> c_int;

    // ============================================================
    // Datatypes
    // ============================================================

    pub fn mpiparams_builtin_datatype(kind: int32_t) -> int32_t;
    pub fn mpiparams_type_contiguous(count: int32_t, base: int32_t, newtype: *mut int32_t)
        -> c_int;
    pub fn mpiparams_type_create_struct(
        count: int32_t,
        blocklengths: *const int32_t,
        displacements: *const int64_t,
        types: *const int32_t,
        extent: int64_t,
        newtype: *mut int32_t,
    ) -> c_int;
    pub fn mpiparams_type_commit(datatype: int32_t) -> c_int;
    pub fn mpiparams_type_free(datatype: int32_t) -> c_int;
    pub fn mpiparams_type_size(datatype: int32_t, size: *mut int64_t) -> c_int;

    // ============================================================
    // Operators
    // ============================================================

    pub fn mpiparams_builtin_op(op: int32_t) -> int32_t;
    pub fn mpiparams_op_create(
        func: mpiparams_user_fn,
        ctx: *mut c_void,
        commute: c_int,
        op: *mut int32_t,
    ) -> c_int;
    pub fn mpiparams_op_free(op: int32_t) -> c_int;

    // ============================================================
    // Point-to-point
    // ============================================================

    pub fn mpiparams_send(
        mode: int32_t,
        buf: *const c_void,
        count: int32_t,
        datatype: int32_t,
        dest: int32_t,
        tag: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_isend(
        mode: int32_t,
        buf: *const c_void,
        count: int32_t,
        datatype: int32_t,
        dest: int32_t,
        tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn mpiparams_recv(
        buf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
        status: *mut mpiparams_status,
    ) -> c_int;

    pub fn mpiparams_irecv(
        buf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn mpiparams_probe(
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
        status: *mut mpiparams_status,
    ) -> c_int;

    pub fn mpiparams_iprobe(
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
        flag: *mut int32_t,
        status: *mut mpiparams_status,
    ) -> c_int;

    // ============================================================
    // Request completion
    // ============================================================

    pub fn mpiparams_wait(request: *mut int64_t, status: *mut mpiparams_status) -> c_int;
    pub fn mpiparams_test(
        request: *mut int64_t,
        flag: *mut int32_t,
        status: *mut mpiparams_status,
    ) -> c_int;
    pub fn mpiparams_waitall(
        count: int64_t,
        requests: *mut int64_t,
        statuses: *mut mpiparams_status,
    ) -> c_int;
    pub fn mpiparams_testall(
        count: int64_t,
        requests: *mut int64_t,
        flag: *mut int32_t,
        statuses: *mut mpiparams_status,
    ) -> c_int;
    pub fn mpiparams_waitany(
        count: int64_t,
        requests: *mut int64_t,
        index: *mut int64_t,
        status: *mut mpiparams_status,
    ) -> c_int;
    pub fn mpiparams_testany(
        count: int64_t,
        requests: *mut int64_t,
        index: *mut int64_t,
        flag: *mut int32_t,
        status: *mut mpiparams_status,
    ) -> c_int;
    pub fn mpiparams_request_free(request: *mut int64_t) -> c_int;

    // ============================================================
    // Collectives
    // ============================================================

    pub fn mpiparams_barrier(comm: int32_t) -> c_int;

    pub fn mpiparams_bcast(
        buf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_gather(
        sendbuf: *const c_void,
        sendcount: int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcount: int32_t,
        recvtype: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_gatherv(
        sendbuf: *const c_void,
        sendcount: int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        displs: *const int32_t,
        recvtype: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_scatter(
        sendbuf: *const c_void,
        sendcount: int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcount: int32_t,
        recvtype: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_scatterv(
        sendbuf: *const c_void,
        sendcounts: *const int32_t,
        displs: *const int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcount: int32_t,
        recvtype: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_allgather(
        sendbuf: *const c_void,
        sendcount: int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcount: int32_t,
        recvtype: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_allgatherv(
        sendbuf: *const c_void,
        sendcount: int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        displs: *const int32_t,
        recvtype: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_alltoall(
        sendbuf: *const c_void,
        sendcount: int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcount: int32_t,
        recvtype: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_alltoallv(
        sendbuf: *const c_void,
        sendcounts: *const int32_t,
        sdispls: *const int32_t,
        sendtype: int32_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        rdispls: *const int32_t,
        recvtype: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_reduce(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        op: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    /// A null `sendbuf` reduces in place.
    pub fn mpiparams_allreduce(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        op: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_scan(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        op: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpiparams_exscan(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int32_t,
        datatype: int32_t,
        op: int32_t,
        comm: int32_t,
    ) -> c_int;
}
