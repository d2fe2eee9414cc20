//! An in-process transport: every rank is a thread of the current process.
//!
//! Each rank owns a [`mailbox`](self::mailbox) that the other ranks deliver
//! into. Point-to-point messages match on `(context, source, tag)` in arrival
//! order. Standard, buffered and ready sends are eager (the payload is copied
//! when the send starts); synchronous sends complete once a receive has
//! matched them. Collectives are built from point-to-point messages on a
//! context of their own, so they never match user receives.
//!
//! ```
//! use mpiparams::transport::local;
//!
//! let sizes = local::run(3, |mpi| mpi.world().size());
//! assert_eq!(sizes, vec![3, 3, 3]);
//! ```

mod mailbox;
mod reduce;

use self::mailbox::{peer_aborted, Envelope, Handshake, Mailbox, Pattern};
use self::reduce::LocalOp;
use super::{
    AnyOutcome, RawBuf, RawBufMut, RawComm, RawDatatype, RawOp, RawRequest, RawStatus, RawVBuf,
    RawVBufMut, SendMode, Sentinels, Transport, UserFunction,
};
use crate::datatype::BuiltinType;
use crate::error::{Error, MpiErrorClass, Result};
use crate::operation::BuiltinOp;
use crate::Mpi;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ANY_SOURCE: i32 = -1;
const ANY_TAG: i32 = -1;
const PROC_NULL: i32 = -2;

/// Tag of every collective message; collectives are ordered by the FIFO rule.
const COLLECTIVE_TAG: i32 = 0;

/// How long a rank waiting on several requests sleeps between polls.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Settings of a local run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalConfig {
    /// Largest valid tag. Defaults to 32767, the smallest bound MPI allows.
    pub tag_upper_bound: i32,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            tag_upper_bound: 32767,
        }
    }
}

/// State shared by every rank of one run.
#[derive(Debug)]
struct Fabric {
    mailboxes: Vec<Mailbox>,
    config: LocalConfig,
    aborted: AtomicBool,
    epoch: Instant,
}

impl Fabric {
    fn new(size: usize, config: LocalConfig) -> Self {
        Fabric {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            config,
            aborted: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for mailbox in &self.mailboxes {
            mailbox.wake();
        }
    }
}

/// Marks the run as aborted when its rank unwinds, so that peers blocked on
/// it fail instead of hanging.
struct AbortOnPanic<'a>(&'a Fabric);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}

/// Run `f` on `size` ranks, one thread each, and collect the per-rank results
/// in rank order.
///
/// A panic on any rank is re-raised once every rank has finished; ranks
/// blocked on the panicking one return errors.
///
/// # Panics
///
/// Panics if a rank panics, or if a rank's environment cannot be created.
pub fn run<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(Mpi) -> R + Sync,
    R: Send,
{
    run_with_config(size, LocalConfig::default(), f)
}

/// [`run`] with explicit settings.
pub fn run_with_config<F, R>(size: usize, config: LocalConfig, f: F) -> Vec<R>
where
    F: Fn(Mpi) -> R + Sync,
    R: Send,
{
    let fabric = Arc::new(Fabric::new(size, config));
    let outcomes: Vec<std::thread::Result<R>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let fabric = Arc::clone(&fabric);
                let f = &f;
                scope.spawn(move || {
                    let _guard = AbortOnPanic(&fabric);
                    let transport = LocalTransport::new(Arc::clone(&fabric), rank as i32);
                    match Mpi::with_transport(transport) {
                        Ok(mpi) => f(mpi),
                        Err(err) => panic!("rank {rank} failed to join the local run: {err}"),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join()).collect()
    });

    let mut results = Vec::with_capacity(size);
    for outcome in outcomes {
        match outcome {
            Ok(value) => results.push(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    results
}

#[derive(Debug, Clone, Copy)]
struct LocalType {
    /// Bytes per element, padding included.
    size: usize,
    builtin: Option<BuiltinType>,
    committed: bool,
}

#[derive(Debug, Clone)]
enum LocalRequest {
    Send {
        status: RawStatus,
        handshake: Option<Arc<Handshake>>,
    },
    Recv {
        ptr: *mut u8,
        capacity: usize,
        pattern: Pattern,
    },
    Done(RawStatus),
}

#[derive(Debug)]
struct State {
    types: Vec<Option<LocalType>>,
    ops: Vec<Option<LocalOp>>,
    comms: HashMap<i32, u32>,
    next_comm: i32,
    next_context: u32,
    requests: HashMap<i64, LocalRequest>,
    next_request: i64,
}

/// One rank's view of a local run.
#[derive(Debug)]
pub struct LocalTransport {
    fabric: Arc<Fabric>,
    rank: i32,
    state: RefCell<State>,
}

impl LocalTransport {
    fn new(fabric: Arc<Fabric>, rank: i32) -> Self {
        let types = BuiltinType::ALL
            .iter()
            .map(|&ty| {
                Some(LocalType {
                    size: ty.size(),
                    builtin: Some(ty),
                    committed: true,
                })
            })
            .collect();
        let ops = BuiltinOp::ALL
            .iter()
            .map(|&op| Some(LocalOp::Builtin(op)))
            .collect();
        LocalTransport {
            fabric,
            rank,
            state: RefCell::new(State {
                types,
                ops,
                comms: HashMap::from([(0, 0)]),
                next_comm: 1,
                next_context: 1,
                requests: HashMap::new(),
                next_request: 0,
            }),
        }
    }

    /// A transport for a run of a single rank.
    pub fn single() -> Self {
        Self::single_with_config(LocalConfig::default())
    }

    /// [`single`](Self::single) with explicit settings.
    pub fn single_with_config(config: LocalConfig) -> Self {
        Self::new(Arc::new(Fabric::new(1, config)), 0)
    }

    fn size(&self) -> i32 {
        self.fabric.mailboxes.len() as i32
    }

    fn mailbox(&self) -> &Mailbox {
        &self.fabric.mailboxes[self.rank as usize]
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    fn context(&self, comm: RawComm) -> Result<u32> {
        self.state
            .borrow()
            .comms
            .get(&comm.0)
            .copied()
            .ok_or_else(|| fail(MpiErrorClass::Comm, format!("unknown communicator {}", comm.0)))
    }

    fn check_peer(&self, rank: i32) -> Result<()> {
        if (0..self.size()).contains(&rank) {
            Ok(())
        } else {
            Err(fail(
                MpiErrorClass::Rank,
                format!("rank {rank} outside 0..{}", self.size()),
            ))
        }
    }

    fn check_root(&self, root: i32) -> Result<()> {
        if (0..self.size()).contains(&root) {
            Ok(())
        } else {
            Err(fail(
                MpiErrorClass::Root,
                format!("root {root} outside 0..{}", self.size()),
            ))
        }
    }

    fn check_tag(&self, tag: i32, allow_any: bool) -> Result<()> {
        if (allow_any && tag == ANY_TAG) || (0..=self.fabric.config.tag_upper_bound).contains(&tag)
        {
            Ok(())
        } else {
            Err(fail(
                MpiErrorClass::Tag,
                format!(
                    "tag {tag} outside 0..={}",
                    self.fabric.config.tag_upper_bound
                ),
            ))
        }
    }

    fn type_info(&self, datatype: RawDatatype) -> Result<LocalType> {
        let state = self.state.borrow();
        let info = usize::try_from(datatype.0)
            .ok()
            .and_then(|i| state.types.get(i).copied().flatten())
            .ok_or_else(|| fail(MpiErrorClass::Type, format!("unknown datatype {}", datatype.0)))?;
        if !info.committed {
            return Err(fail(
                MpiErrorClass::Type,
                format!("datatype {} used before commit", datatype.0),
            ));
        }
        Ok(info)
    }

    fn op_info(&self, op: RawOp) -> Result<LocalOp> {
        usize::try_from(op.0)
            .ok()
            .and_then(|i| self.state.borrow().ops.get(i).copied().flatten())
            .ok_or_else(|| fail(MpiErrorClass::Op, format!("unknown operator {}", op.0)))
    }

    /// Bytes covered by `count` elements of `datatype`.
    fn byte_len(&self, count: i32, datatype: RawDatatype) -> Result<usize> {
        let count = usize::try_from(count)
            .map_err(|_| fail(MpiErrorClass::Count, format!("negative count {count}")))?;
        Ok(count * self.type_info(datatype)?.size)
    }

    fn check_vector(&self, counts: &[i32], displs: &[i32]) -> Result<()> {
        let size = self.size() as usize;
        if counts.len() != size || displs.len() != size {
            return Err(fail(
                MpiErrorClass::Arg,
                format!(
                    "{} counts and {} displacements for {size} ranks",
                    counts.len(),
                    displs.len()
                ),
            ));
        }
        if let Some(bad) = counts.iter().chain(displs).find(|v| **v < 0) {
            return Err(fail(MpiErrorClass::Count, format!("negative count or displacement {bad}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    fn post(&self, dest: i32, context: u32, tag: i32, payload: Vec<u8>, handshake: Option<Arc<Handshake>>) {
        tracing::trace!(
            rank = self.rank,
            dest,
            tag,
            context,
            bytes = payload.len(),
            "local post"
        );
        self.fabric.mailboxes[dest as usize].deliver(Envelope {
            context,
            source: self.rank,
            tag,
            payload,
            handshake,
        });
    }

    fn collective_send(&self, context: u32, dest: i32, payload: Vec<u8>) {
        self.post(dest, 2 * context + 1, COLLECTIVE_TAG, payload, None);
    }

    fn collective_recv(&self, context: u32, source: i32) -> Result<Vec<u8>> {
        let pattern = Pattern {
            context: 2 * context + 1,
            source: Some(source),
            tag: Some(COLLECTIVE_TAG),
        };
        match self.mailbox().take(pattern, true, &self.fabric.aborted)? {
            Some(envelope) => Ok(envelope.payload),
            None => Err(Error::Internal("blocking take returned no message".into())),
        }
    }

    fn pattern(&self, source: i32, tag: i32, comm: RawComm) -> Result<Pattern> {
        if source != ANY_SOURCE {
            self.check_peer(source)?;
        }
        self.check_tag(tag, true)?;
        Ok(Pattern {
            context: 2 * self.context(comm)?,
            source: (source != ANY_SOURCE).then_some(source),
            tag: (tag != ANY_TAG).then_some(tag),
        })
    }

    /// Copy a matched message into its receive buffer.
    fn accept(&self, envelope: Envelope, ptr: *mut u8, capacity: usize) -> Result<RawStatus> {
        if let Some(handshake) = &envelope.handshake {
            handshake.complete();
        }
        if envelope.payload.len() > capacity {
            return Err(fail(
                MpiErrorClass::Truncate,
                format!(
                    "message of {} bytes from rank {} truncated to {capacity}",
                    envelope.payload.len(),
                    envelope.source
                ),
            ));
        }
        // SAFETY: the receive buffer holds `capacity` bytes.
        unsafe { copy_out(ptr.cast(), 0, &envelope.payload) };
        Ok(RawStatus {
            source: envelope.source,
            tag: envelope.tag,
            error: 0,
            bytes: envelope.payload.len() as i64,
        })
    }

    /// Match pending nonblocking receives against arrived messages, oldest
    /// receive first.
    fn advance_posted(&self) -> Result<()> {
        let mut pending: Vec<i64> = self
            .state
            .borrow()
            .requests
            .iter()
            .filter(|(_, r)| matches!(r, LocalRequest::Recv { .. }))
            .map(|(id, _)| *id)
            .collect();
        pending.sort_unstable();
        for id in pending {
            let entry = self.state.borrow().requests.get(&id).cloned();
            if let Some(LocalRequest::Recv {
                ptr,
                capacity,
                pattern,
            }) = entry
            {
                if let Some(envelope) = self.mailbox().take(pattern, false, &self.fabric.aborted)? {
                    let status = self.accept(envelope, ptr, capacity)?;
                    self.state
                        .borrow_mut()
                        .requests
                        .insert(id, LocalRequest::Done(status));
                }
            }
        }
        Ok(())
    }

    /// Status of request `id` if it has completed, without releasing it.
    fn poll(&self, id: i64) -> Result<Option<RawStatus>> {
        self.advance_posted()?;
        let entry = self
            .state
            .borrow()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| fail(MpiErrorClass::Request, format!("unknown request {id}")))?;
        let status = match entry {
            LocalRequest::Done(status) => Some(status),
            LocalRequest::Send { status, handshake } => {
                let complete = handshake.as_ref().map_or(true, |h| h.is_complete());
                complete.then_some(status)
            }
            LocalRequest::Recv { .. } => None,
        };
        if let Some(status) = status {
            self.state
                .borrow_mut()
                .requests
                .insert(id, LocalRequest::Done(status));
        }
        Ok(status)
    }

    fn release(&self, request: &mut RawRequest) {
        self.state.borrow_mut().requests.remove(&request.0);
        *request = RawRequest::NULL;
    }

    fn register(&self, request: LocalRequest) -> RawRequest {
        let mut state = self.state.borrow_mut();
        let id = state.next_request;
        state.next_request += 1;
        state.requests.insert(id, request);
        RawRequest(id)
    }

    fn idle(&self) -> Result<()> {
        if self.fabric.aborted.load(Ordering::SeqCst) {
            return Err(peer_aborted());
        }
        self.mailbox().idle(IDLE_POLL);
        Ok(())
    }

    fn empty_status() -> RawStatus {
        RawStatus {
            source: ANY_SOURCE,
            tag: ANY_TAG,
            error: 0,
            bytes: 0,
        }
    }

    fn null_peer_status() -> RawStatus {
        RawStatus {
            source: PROC_NULL,
            tag: ANY_TAG,
            error: 0,
            bytes: 0,
        }
    }

    /// Inclusive prefix of `own` over ranks `0..=rank`, passed down the ranks
    /// in order.
    fn prefix(&self, context: u32, op: RawOp, send: RawBuf, own: Vec<u8>) -> Result<Vec<u8>> {
        let inclusive = if self.rank > 0 {
            let before = self.collective_recv(context, self.rank - 1)?;
            self.fold(op, send.datatype, send.count, vec![before, own])?
        } else {
            own
        };
        if self.rank + 1 < self.size() {
            self.collective_send(context, self.rank + 1, inclusive.clone());
        }
        Ok(inclusive)
    }

    /// Fold the per-rank contributions right to left:
    /// `x0 op (x1 op (... op x[n-1]))`.
    fn fold(
        &self,
        op: RawOp,
        datatype: RawDatatype,
        count: i32,
        mut parts: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let op = self.op_info(op)?;
        let ty = self.type_info(datatype)?;
        let mut acc = parts
            .pop()
            .ok_or_else(|| Error::Internal("reduction over zero ranks".into()))?;
        while let Some(part) = parts.pop() {
            reduce::apply(op, ty.builtin, count.max(0) as usize, &part, &mut acc)?;
        }
        Ok(acc)
    }
}

fn fail(class: MpiErrorClass, message: impl Into<String>) -> Error {
    Error::transport(class.as_raw(), class, message)
}

/// Copy `len` bytes starting at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for `len` bytes; it may be null when `len` is zero.
unsafe fn copy_in(ptr: *const c_void, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec()
}

/// Write `bytes` at byte `offset` past `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for `offset + bytes.len()` bytes.
unsafe fn copy_out(ptr: *mut c_void, offset: usize, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>().add(offset), bytes.len());
}

fn check_fits(received: usize, capacity: usize, source: i32) -> Result<()> {
    if received > capacity {
        Err(fail(
            MpiErrorClass::Truncate,
            format!("{received} bytes from rank {source} exceed the {capacity} bytes available"),
        ))
    } else {
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn world(&self) -> RawComm {
        RawComm(0)
    }

    fn comm_rank(&self, comm: RawComm) -> Result<i32> {
        self.context(comm)?;
        Ok(self.rank)
    }

    fn comm_size(&self, comm: RawComm) -> Result<i32> {
        self.context(comm)?;
        Ok(self.size())
    }

    fn comm_dup(&self, comm: RawComm) -> Result<RawComm> {
        self.context(comm)?;
        let mut state = self.state.borrow_mut();
        let handle = state.next_comm;
        let context = state.next_context;
        state.next_comm += 1;
        state.next_context += 1;
        state.comms.insert(handle, context);
        Ok(RawComm(handle))
    }

    fn comm_free(&self, comm: RawComm) -> Result<()> {
        if comm == self.world() {
            return Err(fail(MpiErrorClass::Comm, "the world communicator cannot be freed"));
        }
        self.state
            .borrow_mut()
            .comms
            .remove(&comm.0)
            .map(|_| ())
            .ok_or_else(|| fail(MpiErrorClass::Comm, format!("unknown communicator {}", comm.0)))
    }

    fn tag_upper_bound(&self) -> i32 {
        self.fabric.config.tag_upper_bound
    }

    fn sentinels(&self) -> Sentinels {
        Sentinels {
            any_source: ANY_SOURCE,
            any_tag: ANY_TAG,
            proc_null: PROC_NULL,
        }
    }

    fn wtime(&self) -> f64 {
        self.fabric.epoch.elapsed().as_secs_f64()
    }

    fn version(&self) -> Result<String> {
        Ok(format!(
            "mpiparams local transport ({} ranks)",
            self.fabric.mailboxes.len()
        ))
    }

    fn finalize(&self) -> Result<()> {
        let state = self.state.borrow();
        if !state.requests.is_empty() {
            tracing::warn!(
                rank = self.rank,
                pending = state.requests.len(),
                "finalizing with active requests"
            );
        }
        Ok(())
    }

    fn builtin_datatype(&self, ty: BuiltinType) -> RawDatatype {
        RawDatatype(ty as i32)
    }

    fn type_contiguous(&self, count: i32, base: RawDatatype) -> Result<RawDatatype> {
        let size = self.byte_len(count, base)?;
        let mut state = self.state.borrow_mut();
        state.types.push(Some(LocalType {
            size,
            builtin: None,
            committed: false,
        }));
        Ok(RawDatatype(state.types.len() as i32 - 1))
    }

    fn type_create_struct(
        &self,
        blocklengths: &[i32],
        displacements: &[isize],
        types: &[RawDatatype],
        extent: isize,
    ) -> Result<RawDatatype> {
        if blocklengths.len() != displacements.len() || blocklengths.len() != types.len() {
            return Err(fail(MpiErrorClass::Arg, "struct field arrays differ in length"));
        }
        let extent = usize::try_from(extent)
            .map_err(|_| fail(MpiErrorClass::Arg, format!("negative extent {extent}")))?;
        for ((&count, &offset), &ty) in blocklengths.iter().zip(displacements).zip(types) {
            let end = usize::try_from(offset)
                .map_err(|_| fail(MpiErrorClass::Arg, format!("negative displacement {offset}")))?
                + self.byte_len(count, ty)?;
            if end > extent {
                return Err(fail(
                    MpiErrorClass::Arg,
                    format!("field ending at byte {end} exceeds extent {extent}"),
                ));
            }
        }
        let mut state = self.state.borrow_mut();
        state.types.push(Some(LocalType {
            size: extent,
            builtin: None,
            committed: false,
        }));
        Ok(RawDatatype(state.types.len() as i32 - 1))
    }

    fn type_commit(&self, datatype: RawDatatype) -> Result<()> {
        let index = usize::try_from(datatype.0).unwrap_or(usize::MAX);
        match self.state.borrow_mut().types.get_mut(index) {
            Some(Some(entry)) => {
                entry.committed = true;
                Ok(())
            }
            _ => Err(fail(MpiErrorClass::Type, format!("unknown datatype {}", datatype.0))),
        }
    }

    fn type_free(&self, datatype: RawDatatype) -> Result<()> {
        if BuiltinType::from_raw(datatype.0).is_some() {
            return Err(fail(MpiErrorClass::Type, "predefined datatypes cannot be freed"));
        }
        let index = usize::try_from(datatype.0).unwrap_or(usize::MAX);
        match self.state.borrow_mut().types.get_mut(index).and_then(Option::take) {
            Some(_) => Ok(()),
            None => Err(fail(MpiErrorClass::Type, format!("unknown datatype {}", datatype.0))),
        }
    }

    fn type_size(&self, datatype: RawDatatype) -> Result<usize> {
        Ok(self.type_info(datatype)?.size)
    }

    fn builtin_op(&self, op: BuiltinOp) -> RawOp {
        RawOp(op as i32)
    }

    fn op_create(&self, func: UserFunction, ctx: *mut c_void, commute: bool) -> Result<RawOp> {
        // Ranks are always folded in rank order, which suits either kind.
        tracing::trace!(rank = self.rank, commute, "user operator registered");
        let mut state = self.state.borrow_mut();
        state.ops.push(Some(LocalOp::User { func, ctx }));
        Ok(RawOp(state.ops.len() as i32 - 1))
    }

    fn op_free(&self, op: RawOp) -> Result<()> {
        if BuiltinOp::from_raw(op.0).is_some() {
            return Err(fail(MpiErrorClass::Op, "predefined operators cannot be freed"));
        }
        let index = usize::try_from(op.0).unwrap_or(usize::MAX);
        match self.state.borrow_mut().ops.get_mut(index).and_then(Option::take) {
            Some(_) => Ok(()),
            None => Err(fail(MpiErrorClass::Op, format!("unknown operator {}", op.0))),
        }
    }

    unsafe fn send(
        &self,
        mode: SendMode,
        buf: RawBuf,
        dest: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<()> {
        let mut request = self.isend(mode, buf, dest, tag, comm)?;
        self.wait(&mut request).map(|_| ())
    }

    unsafe fn isend(
        &self,
        mode: SendMode,
        buf: RawBuf,
        dest: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<RawRequest> {
        let context = self.context(comm)?;
        self.check_tag(tag, false)?;
        if dest == PROC_NULL {
            return Ok(self.register(LocalRequest::Done(Self::null_peer_status())));
        }
        self.check_peer(dest)?;
        let payload = copy_in(buf.ptr, self.byte_len(buf.count, buf.datatype)?);
        let status = RawStatus {
            source: self.rank,
            tag,
            error: 0,
            bytes: payload.len() as i64,
        };
        let handshake = (mode == SendMode::Synchronous).then(|| Arc::new(Handshake::default()));
        self.post(dest, 2 * context, tag, payload, handshake.clone());
        Ok(self.register(LocalRequest::Send { status, handshake }))
    }

    unsafe fn recv(&self, buf: RawBufMut, source: i32, tag: i32, comm: RawComm) -> Result<RawStatus> {
        let mut request = self.irecv(buf, source, tag, comm)?;
        self.wait(&mut request)
    }

    unsafe fn irecv(
        &self,
        buf: RawBufMut,
        source: i32,
        tag: i32,
        comm: RawComm,
    ) -> Result<RawRequest> {
        if source == PROC_NULL {
            self.context(comm)?;
            return Ok(self.register(LocalRequest::Done(Self::null_peer_status())));
        }
        let pattern = self.pattern(source, tag, comm)?;
        let capacity = self.byte_len(buf.count, buf.datatype)?;
        tracing::trace!(rank = self.rank, source, tag, capacity, "local post receive");
        Ok(self.register(LocalRequest::Recv {
            ptr: buf.ptr.cast(),
            capacity,
            pattern,
        }))
    }

    fn probe(&self, source: i32, tag: i32, comm: RawComm) -> Result<RawStatus> {
        loop {
            if let Some(status) = self.iprobe(source, tag, comm)? {
                return Ok(status);
            }
            self.idle()?;
        }
    }

    fn iprobe(&self, source: i32, tag: i32, comm: RawComm) -> Result<Option<RawStatus>> {
        if source == PROC_NULL {
            self.context(comm)?;
            return Ok(Some(Self::null_peer_status()));
        }
        let pattern = self.pattern(source, tag, comm)?;
        self.advance_posted()?;
        let found = self.mailbox().peek(pattern, false, &self.fabric.aborted)?;
        Ok(found.map(|(source, tag, bytes)| RawStatus {
            source,
            tag,
            error: 0,
            bytes: bytes as i64,
        }))
    }

    fn wait(&self, request: &mut RawRequest) -> Result<RawStatus> {
        if request.is_null() {
            return Ok(Self::empty_status());
        }
        loop {
            if let Some(status) = self.poll(request.0)? {
                self.release(request);
                return Ok(status);
            }
            self.idle()?;
        }
    }

    fn test(&self, request: &mut RawRequest) -> Result<Option<RawStatus>> {
        if request.is_null() {
            return Ok(Some(Self::empty_status()));
        }
        let status = self.poll(request.0)?;
        if status.is_some() {
            self.release(request);
        }
        Ok(status)
    }

    fn wait_all(
        &self,
        requests: &mut [RawRequest],
        mut statuses: Option<&mut [RawStatus]>,
    ) -> Result<()> {
        for (i, request) in requests.iter_mut().enumerate() {
            let status = self.wait(request)?;
            if let Some(slot) = statuses.as_deref_mut().and_then(|s| s.get_mut(i)) {
                *slot = status;
            }
        }
        Ok(())
    }

    fn test_all(
        &self,
        requests: &mut [RawRequest],
        statuses: Option<&mut [RawStatus]>,
    ) -> Result<bool> {
        let mut completed = Vec::with_capacity(requests.len());
        for request in requests.iter() {
            if request.is_null() {
                completed.push(Self::empty_status());
                continue;
            }
            match self.poll(request.0)? {
                Some(status) => completed.push(status),
                None => return Ok(false),
            }
        }
        for request in requests.iter_mut() {
            self.release(request);
        }
        if let Some(statuses) = statuses {
            for (slot, status) in statuses.iter_mut().zip(completed) {
                *slot = status;
            }
        }
        Ok(true)
    }

    fn wait_any(&self, requests: &mut [RawRequest]) -> Result<Option<(usize, RawStatus)>> {
        loop {
            match self.test_any(requests)? {
                AnyOutcome::Completed(index, status) => return Ok(Some((index, status))),
                AnyOutcome::NoneActive => return Ok(None),
                AnyOutcome::Pending => self.idle()?,
            }
        }
    }

    fn test_any(&self, requests: &mut [RawRequest]) -> Result<AnyOutcome> {
        let mut active = false;
        for (index, request) in requests.iter_mut().enumerate() {
            if request.is_null() {
                continue;
            }
            active = true;
            if let Some(status) = self.poll(request.0)? {
                self.release(request);
                return Ok(AnyOutcome::Completed(index, status));
            }
        }
        Ok(if active {
            AnyOutcome::Pending
        } else {
            AnyOutcome::NoneActive
        })
    }

    fn request_free(&self, request: &mut RawRequest) -> Result<()> {
        if !request.is_null() {
            self.release(request);
        }
        Ok(())
    }

    fn barrier(&self, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        tracing::trace!(rank = self.rank, "local barrier");
        if self.rank == 0 {
            for peer in 1..self.size() {
                self.collective_recv(context, peer)?;
            }
            for peer in 1..self.size() {
                self.collective_send(context, peer, Vec::new());
            }
        } else {
            self.collective_send(context, 0, Vec::new());
            self.collective_recv(context, 0)?;
        }
        Ok(())
    }

    unsafe fn bcast(&self, buf: RawBufMut, root: i32, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        self.check_root(root)?;
        let len = self.byte_len(buf.count, buf.datatype)?;
        tracing::trace!(rank = self.rank, root, bytes = len, "local bcast");
        if self.rank == root {
            let payload = copy_in(buf.ptr, len);
            for peer in (0..self.size()).filter(|&p| p != root) {
                self.collective_send(context, peer, payload.clone());
            }
        } else {
            let payload = self.collective_recv(context, root)?;
            check_fits(payload.len(), len, root)?;
            copy_out(buf.ptr, 0, &payload);
        }
        Ok(())
    }

    unsafe fn gather(&self, send: RawBuf, recv: RawBufMut, root: i32, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        self.check_root(root)?;
        let payload = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        if self.rank != root {
            self.collective_send(context, root, payload);
            return Ok(());
        }
        let block = self.byte_len(recv.count, recv.datatype)?;
        for peer in 0..self.size() {
            let part = if peer == root {
                payload.clone()
            } else {
                self.collective_recv(context, peer)?
            };
            check_fits(part.len(), block, peer)?;
            copy_out(recv.ptr, peer as usize * block, &part);
        }
        Ok(())
    }

    unsafe fn gatherv(
        &self,
        send: RawBuf,
        recv: RawVBufMut<'_>,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        let context = self.context(comm)?;
        self.check_root(root)?;
        let payload = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        if self.rank != root {
            self.collective_send(context, root, payload);
            return Ok(());
        }
        self.check_vector(recv.counts, recv.displs)?;
        let extent = self.type_info(recv.datatype)?.size;
        for peer in 0..self.size() {
            let part = if peer == root {
                payload.clone()
            } else {
                self.collective_recv(context, peer)?
            };
            let i = peer as usize;
            check_fits(part.len(), recv.counts[i] as usize * extent, peer)?;
            copy_out(recv.ptr, recv.displs[i] as usize * extent, &part);
        }
        Ok(())
    }

    unsafe fn scatter(&self, send: RawBuf, recv: RawBufMut, root: i32, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        self.check_root(root)?;
        let capacity = self.byte_len(recv.count, recv.datatype)?;
        let own = if self.rank == root {
            let block = self.byte_len(send.count, send.datatype)?;
            let all = copy_in(send.ptr, block * self.size() as usize);
            let mut own = Vec::new();
            for peer in 0..self.size() {
                let start = peer as usize * block;
                let chunk = all[start..start + block].to_vec();
                if peer == root {
                    own = chunk;
                } else {
                    self.collective_send(context, peer, chunk);
                }
            }
            own
        } else {
            self.collective_recv(context, root)?
        };
        check_fits(own.len(), capacity, root)?;
        copy_out(recv.ptr, 0, &own);
        Ok(())
    }

    unsafe fn scatterv(
        &self,
        send: RawVBuf<'_>,
        recv: RawBufMut,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        let context = self.context(comm)?;
        self.check_root(root)?;
        let capacity = self.byte_len(recv.count, recv.datatype)?;
        let own = if self.rank == root {
            self.check_vector(send.counts, send.displs)?;
            let extent = self.type_info(send.datatype)?.size;
            let mut own = Vec::new();
            for peer in 0..self.size() {
                let i = peer as usize;
                let start = send.ptr.cast::<u8>().add(send.displs[i] as usize * extent);
                let chunk = copy_in(start.cast(), send.counts[i] as usize * extent);
                if peer == root {
                    own = chunk;
                } else {
                    self.collective_send(context, peer, chunk);
                }
            }
            own
        } else {
            self.collective_recv(context, root)?
        };
        check_fits(own.len(), capacity, root)?;
        copy_out(recv.ptr, 0, &own);
        Ok(())
    }

    unsafe fn allgather(&self, send: RawBuf, recv: RawBufMut, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        let payload = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        let block = self.byte_len(recv.count, recv.datatype)?;
        for peer in (0..self.size()).filter(|&p| p != self.rank) {
            self.collective_send(context, peer, payload.clone());
        }
        for peer in 0..self.size() {
            let part = if peer == self.rank {
                payload.clone()
            } else {
                self.collective_recv(context, peer)?
            };
            check_fits(part.len(), block, peer)?;
            copy_out(recv.ptr, peer as usize * block, &part);
        }
        Ok(())
    }

    unsafe fn allgatherv(&self, send: RawBuf, recv: RawVBufMut<'_>, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        self.check_vector(recv.counts, recv.displs)?;
        let payload = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        let extent = self.type_info(recv.datatype)?.size;
        for peer in (0..self.size()).filter(|&p| p != self.rank) {
            self.collective_send(context, peer, payload.clone());
        }
        for peer in 0..self.size() {
            let part = if peer == self.rank {
                payload.clone()
            } else {
                self.collective_recv(context, peer)?
            };
            let i = peer as usize;
            check_fits(part.len(), recv.counts[i] as usize * extent, peer)?;
            copy_out(recv.ptr, recv.displs[i] as usize * extent, &part);
        }
        Ok(())
    }

    unsafe fn alltoall(&self, send: RawBuf, recv: RawBufMut, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        let out_block = self.byte_len(send.count, send.datatype)?;
        let in_block = self.byte_len(recv.count, recv.datatype)?;
        let mut own = Vec::new();
        for peer in 0..self.size() {
            let start = send.ptr.cast::<u8>().add(peer as usize * out_block);
            let chunk = copy_in(start.cast(), out_block);
            if peer == self.rank {
                own = chunk;
            } else {
                self.collective_send(context, peer, chunk);
            }
        }
        for peer in 0..self.size() {
            let part = if peer == self.rank {
                std::mem::take(&mut own)
            } else {
                self.collective_recv(context, peer)?
            };
            check_fits(part.len(), in_block, peer)?;
            copy_out(recv.ptr, peer as usize * in_block, &part);
        }
        Ok(())
    }

    unsafe fn alltoallv(&self, send: RawVBuf<'_>, recv: RawVBufMut<'_>, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        self.check_vector(send.counts, send.displs)?;
        self.check_vector(recv.counts, recv.displs)?;
        let out_extent = self.type_info(send.datatype)?.size;
        let in_extent = self.type_info(recv.datatype)?.size;
        let mut own = Vec::new();
        for peer in 0..self.size() {
            let i = peer as usize;
            let start = send.ptr.cast::<u8>().add(send.displs[i] as usize * out_extent);
            let chunk = copy_in(start.cast(), send.counts[i] as usize * out_extent);
            if peer == self.rank {
                own = chunk;
            } else {
                self.collective_send(context, peer, chunk);
            }
        }
        for peer in 0..self.size() {
            let part = if peer == self.rank {
                std::mem::take(&mut own)
            } else {
                self.collective_recv(context, peer)?
            };
            let i = peer as usize;
            check_fits(part.len(), recv.counts[i] as usize * in_extent, peer)?;
            copy_out(recv.ptr, recv.displs[i] as usize * in_extent, &part);
        }
        Ok(())
    }

    unsafe fn reduce(
        &self,
        send: RawBuf,
        recv: RawBufMut,
        op: RawOp,
        root: i32,
        comm: RawComm,
    ) -> Result<()> {
        let context = self.context(comm)?;
        self.check_root(root)?;
        let payload = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        tracing::trace!(rank = self.rank, root, bytes = payload.len(), "local reduce");
        if self.rank != root {
            self.collective_send(context, root, payload);
            return Ok(());
        }
        let mut parts = Vec::with_capacity(self.size() as usize);
        let mut own = Some(payload);
        for peer in 0..self.size() {
            if peer == root {
                parts.push(own.take().unwrap_or_default());
            } else {
                parts.push(self.collective_recv(context, peer)?);
            }
        }
        let result = self.fold(op, send.datatype, send.count, parts)?;
        check_fits(result.len(), self.byte_len(recv.count, recv.datatype)?, root)?;
        copy_out(recv.ptr, 0, &result);
        Ok(())
    }

    unsafe fn allreduce(
        &self,
        send: Option<RawBuf>,
        recv: RawBufMut,
        op: RawOp,
        comm: RawComm,
    ) -> Result<()> {
        let context = self.context(comm)?;
        let capacity = self.byte_len(recv.count, recv.datatype)?;
        let (payload, count, datatype) = match send {
            Some(send) => (
                copy_in(send.ptr, self.byte_len(send.count, send.datatype)?),
                send.count,
                send.datatype,
            ),
            None => (copy_in(recv.ptr.cast_const(), capacity), recv.count, recv.datatype),
        };
        for peer in (0..self.size()).filter(|&p| p != self.rank) {
            self.collective_send(context, peer, payload.clone());
        }
        let mut parts = Vec::with_capacity(self.size() as usize);
        let mut own = Some(payload);
        for peer in 0..self.size() {
            if peer == self.rank {
                parts.push(own.take().unwrap_or_default());
            } else {
                parts.push(self.collective_recv(context, peer)?);
            }
        }
        let result = self.fold(op, datatype, count, parts)?;
        check_fits(result.len(), capacity, self.rank)?;
        copy_out(recv.ptr, 0, &result);
        Ok(())
    }

    unsafe fn scan(&self, send: RawBuf, recv: RawBufMut, op: RawOp, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        let own = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        let prefix = self.prefix(context, op, send, own)?;
        check_fits(prefix.len(), self.byte_len(recv.count, recv.datatype)?, self.rank)?;
        copy_out(recv.ptr, 0, &prefix);
        Ok(())
    }

    unsafe fn exscan(&self, send: RawBuf, recv: RawBufMut, op: RawOp, comm: RawComm) -> Result<()> {
        let context = self.context(comm)?;
        let own = copy_in(send.ptr, self.byte_len(send.count, send.datatype)?);
        let before = if self.rank > 0 {
            Some(self.collective_recv(context, self.rank - 1)?)
        } else {
            None
        };
        let inclusive = match &before {
            Some(before) => self.fold(op, send.datatype, send.count, vec![before.clone(), own])?,
            None => own,
        };
        if self.rank + 1 < self.size() {
            self.collective_send(context, self.rank + 1, inclusive);
        }
        if let Some(before) = before {
            check_fits(before.len(), self.byte_len(recv.count, recv.datatype)?, self.rank)?;
            copy_out(recv.ptr, 0, &before);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf<T>(values: &[T], datatype: RawDatatype) -> RawBuf {
        RawBuf {
            ptr: values.as_ptr().cast(),
            count: values.len() as i32,
            datatype,
        }
    }

    fn buf_mut<T>(values: &mut [T], datatype: RawDatatype) -> RawBufMut {
        RawBufMut {
            ptr: values.as_mut_ptr().cast(),
            count: values.len() as i32,
            datatype,
        }
    }

    /// Run `f` on `size` ranks built directly on a shared fabric.
    fn on_ranks<R: Send>(size: usize, f: impl Fn(LocalTransport) -> R + Sync) -> Vec<R> {
        let fabric = Arc::new(Fabric::new(size, LocalConfig::default()));
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let fabric = Arc::clone(&fabric);
                    let f = &f;
                    scope.spawn(move || f(LocalTransport::new(fabric, rank as i32)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn single_rank_reports_world() {
        let t = LocalTransport::single();
        assert_eq!(t.comm_rank(t.world()).unwrap(), 0);
        assert_eq!(t.comm_size(t.world()).unwrap(), 1);
        assert_eq!(t.tag_upper_bound(), 32767);
        assert!(t.comm_free(t.world()).is_err());
    }

    #[test]
    fn send_then_receive_on_one_rank() {
        let t = LocalTransport::single();
        let i32_t = t.builtin_datatype(BuiltinType::I32);
        let data = [1i32, 2, 3];
        unsafe { t.send(SendMode::Standard, buf(&data, i32_t), 0, 5, t.world()) }.unwrap();

        let probed = t.iprobe(ANY_SOURCE, ANY_TAG, t.world()).unwrap().unwrap();
        assert_eq!((probed.source, probed.tag, probed.bytes), (0, 5, 12));

        let mut out = [0i32; 3];
        let status = unsafe { t.recv(buf_mut(&mut out, i32_t), 0, 5, t.world()) }.unwrap();
        assert_eq!(out, data);
        assert_eq!(status.bytes, 12);
    }

    #[test]
    fn truncated_receive_fails() {
        let t = LocalTransport::single();
        let i32_t = t.builtin_datatype(BuiltinType::I32);
        unsafe { t.send(SendMode::Standard, buf(&[1i32, 2], i32_t), 0, 0, t.world()) }.unwrap();
        let mut out = [0i32; 1];
        let err = unsafe { t.recv(buf_mut(&mut out, i32_t), 0, 0, t.world()) }.unwrap_err();
        assert_eq!(err.class(), Some(MpiErrorClass::Truncate));
    }

    #[test]
    fn posted_receives_match_in_posting_order() {
        let t = LocalTransport::single();
        let i32_t = t.builtin_datatype(BuiltinType::I32);
        let mut first = [0i32];
        let mut second = [0i32];
        let mut r1 = unsafe { t.irecv(buf_mut(&mut first, i32_t), 0, 1, t.world()) }.unwrap();
        let mut r2 = unsafe { t.irecv(buf_mut(&mut second, i32_t), 0, 1, t.world()) }.unwrap();
        assert_eq!(t.test(&mut r1).unwrap(), None);

        unsafe { t.send(SendMode::Standard, buf(&[10i32], i32_t), 0, 1, t.world()) }.unwrap();
        unsafe { t.send(SendMode::Standard, buf(&[20i32], i32_t), 0, 1, t.world()) }.unwrap();

        t.wait(&mut r2).unwrap();
        t.wait(&mut r1).unwrap();
        assert!(r1.is_null() && r2.is_null());
        assert_eq!((first[0], second[0]), (10, 20));
    }

    #[test]
    fn invalid_rank_and_tag_are_rejected() {
        let t = LocalTransport::single();
        let i32_t = t.builtin_datatype(BuiltinType::I32);
        let data = [0i32];
        let err = unsafe { t.send(SendMode::Standard, buf(&data, i32_t), 3, 0, t.world()) }
            .unwrap_err();
        assert_eq!(err.class(), Some(MpiErrorClass::Rank));
        let err = unsafe { t.send(SendMode::Standard, buf(&data, i32_t), 0, 40000, t.world()) }
            .unwrap_err();
        assert_eq!(err.class(), Some(MpiErrorClass::Tag));
    }

    #[test]
    fn proc_null_is_a_no_op() {
        let t = LocalTransport::single();
        let i32_t = t.builtin_datatype(BuiltinType::I32);
        unsafe { t.send(SendMode::Standard, buf(&[1i32], i32_t), PROC_NULL, 0, t.world()) }
            .unwrap();
        let mut out = [7i32];
        let status =
            unsafe { t.recv(buf_mut(&mut out, i32_t), PROC_NULL, 0, t.world()) }.unwrap();
        assert_eq!(status.source, PROC_NULL);
        assert_eq!(out, [7]);
    }

    #[test]
    fn test_all_leaves_requests_active_until_all_complete() {
        let t = LocalTransport::single();
        let i32_t = t.builtin_datatype(BuiltinType::I32);
        let mut a = [0i32];
        let mut b = [0i32];
        let mut requests = [
            unsafe { t.irecv(buf_mut(&mut a, i32_t), 0, 1, t.world()) }.unwrap(),
            unsafe { t.irecv(buf_mut(&mut b, i32_t), 0, 2, t.world()) }.unwrap(),
        ];
        unsafe { t.send(SendMode::Standard, buf(&[1i32], i32_t), 0, 1, t.world()) }.unwrap();
        let mut statuses = [RawStatus::default(); 2];
        assert!(!t.test_all(&mut requests, Some(&mut statuses)).unwrap());
        assert!(requests.iter().all(|r| !r.is_null()));

        unsafe { t.send(SendMode::Standard, buf(&[2i32], i32_t), 0, 2, t.world()) }.unwrap();
        assert!(t.test_all(&mut requests, Some(&mut statuses)).unwrap());
        assert!(requests.iter().all(|r| r.is_null()));
        assert_eq!((statuses[0].tag, statuses[1].tag), (1, 2));
        assert_eq!((a[0], b[0]), (1, 2));
    }

    #[test]
    fn test_any_reports_none_active() {
        let t = LocalTransport::single();
        let mut requests = [RawRequest::NULL; 3];
        assert_eq!(t.test_any(&mut requests).unwrap(), AnyOutcome::NoneActive);
        assert_eq!(t.wait_any(&mut requests).unwrap(), None);
    }

    #[test]
    fn derived_types_and_user_ops_are_released() {
        let t = LocalTransport::single();
        let byte = t.builtin_datatype(BuiltinType::Byte);
        let blob = t.type_contiguous(24, byte).unwrap();
        assert!(t.type_size(blob).is_err(), "uncommitted types are unusable");
        t.type_commit(blob).unwrap();
        assert_eq!(t.type_size(blob).unwrap(), 24);
        t.type_free(blob).unwrap();
        assert!(t.type_size(blob).is_err());
        assert!(t.type_free(byte).is_err());

        unsafe extern "C" fn noop(_: *const c_void, _: *mut c_void, _: i32, _: *mut c_void) {}
        let op = t.op_create(noop, std::ptr::null_mut(), true).unwrap();
        t.op_free(op).unwrap();
        assert!(t.op_free(op).is_err());
        assert!(t.op_free(t.builtin_op(BuiltinOp::Sum)).is_err());
    }

    #[test]
    fn collectives_across_threads() {
        let results = on_ranks(4, |t| {
            let world = t.world();
            let i32_t = t.builtin_datatype(BuiltinType::I32);
            let rank = t.comm_rank(world).unwrap();

            let mut gathered = vec![0i32; 4];
            let mine = [rank * 10];
            unsafe { t.allgather(buf(&mine, i32_t), buf_mut(&mut gathered, i32_t), world) }
                .unwrap();

            let mut total = [0i32];
            unsafe {
                t.allreduce(
                    Some(buf(&mine, i32_t)),
                    buf_mut(&mut total, i32_t),
                    t.builtin_op(BuiltinOp::Sum),
                    world,
                )
            }
            .unwrap();

            let outgoing: Vec<i32> = (0..4).map(|peer| rank * 100 + peer).collect();
            let mut incoming = vec![0i32; 4];
            unsafe {
                let send = RawBuf {
                    count: 1,
                    ..buf(&outgoing, i32_t)
                };
                let recv = RawBufMut {
                    count: 1,
                    ..buf_mut(&mut incoming, i32_t)
                };
                t.alltoall(send, recv, world)
            }
            .unwrap();
            t.barrier(world).unwrap();
            (gathered, total[0], incoming)
        });

        for (rank, (gathered, total, incoming)) in results.into_iter().enumerate() {
            assert_eq!(gathered, vec![0, 10, 20, 30]);
            assert_eq!(total, 60);
            let expected: Vec<i32> = (0..4).map(|peer| peer * 100 + rank as i32).collect();
            assert_eq!(incoming, expected);
        }
    }

    #[test]
    fn scatter_and_gather_round_trip() {
        let results = on_ranks(3, |t| {
            let world = t.world();
            let i32_t = t.builtin_datatype(BuiltinType::I32);
            let rank = t.comm_rank(world).unwrap();
            let source: Vec<i32> = if rank == 1 { (0..6).collect() } else { Vec::new() };
            let mut chunk = [0i32; 2];
            let send = RawBuf {
                count: 2,
                ..buf(&source, i32_t)
            };
            unsafe { t.scatter(send, buf_mut(&mut chunk, i32_t), 1, world) }.unwrap();

            let doubled = [chunk[0] * 2, chunk[1] * 2];
            let mut back = vec![0i32; if rank == 1 { 6 } else { 0 }];
            let recv = RawBufMut {
                count: 2,
                ..buf_mut(&mut back, i32_t)
            };
            unsafe { t.gather(buf(&doubled, i32_t), recv, 1, world) }.unwrap();
            (chunk, back)
        });
        assert_eq!(results[0].0, [0, 1]);
        assert_eq!(results[2].0, [4, 5]);
        assert_eq!(results[1].1, vec![0, 2, 4, 6, 8, 10]);
    }

    #[test]
    fn non_commutative_reduction_keeps_rank_order() {
        // Concatenates decimal digits: in op inout = "in" followed by "inout".
        unsafe extern "C" fn concat(
            invec: *const c_void,
            inout: *mut c_void,
            len: i32,
            _: *mut c_void,
        ) {
            for i in 0..len as usize {
                let a = invec.cast::<i64>().add(i).read_unaligned();
                let b = inout.cast::<i64>().add(i).read_unaligned();
                let digits = b.max(1).ilog10() + 1;
                inout
                    .cast::<i64>()
                    .add(i)
                    .write_unaligned(a * 10i64.pow(digits) + b);
            }
        }

        let results = on_ranks(3, |t| {
            let world = t.world();
            let i64_t = t.builtin_datatype(BuiltinType::I64);
            let op = t.op_create(concat, std::ptr::null_mut(), false).unwrap();
            let mine = [t.comm_rank(world).unwrap() as i64 + 1];
            let mut out = [0i64];
            unsafe { t.reduce(buf(&mine, i64_t), buf_mut(&mut out, i64_t), op, 0, world) }
                .unwrap();
            t.op_free(op).unwrap();
            out[0]
        });
        assert_eq!(results[0], 123);
    }

    #[test]
    fn scans_follow_rank_order() {
        let results = on_ranks(4, |t| {
            let world = t.world();
            let i32_t = t.builtin_datatype(BuiltinType::I32);
            let sum = t.builtin_op(BuiltinOp::Sum);
            let mine = [t.comm_rank(world).unwrap() + 1];
            let mut inclusive = [0i32];
            let mut exclusive = [-1i32];
            unsafe {
                t.scan(buf(&mine, i32_t), buf_mut(&mut inclusive, i32_t), sum, world)
                    .unwrap();
                t.exscan(buf(&mine, i32_t), buf_mut(&mut exclusive, i32_t), sum, world)
                    .unwrap();
            }
            (inclusive[0], exclusive[0])
        });
        assert_eq!(results, vec![(1, -1), (3, 1), (6, 3), (10, 6)]);
    }

    #[test]
    fn synchronous_send_completes_after_match() {
        on_ranks(2, |t| {
            let world = t.world();
            let u8_t = t.builtin_datatype(BuiltinType::U8);
            if t.comm_rank(world).unwrap() == 0 {
                let mut request =
                    unsafe { t.isend(SendMode::Synchronous, buf(&[9u8], u8_t), 1, 3, world) }
                        .unwrap();
                let status = t.wait(&mut request).unwrap();
                assert_eq!(status.tag, 3);
            } else {
                let mut out = [0u8];
                unsafe { t.recv(buf_mut(&mut out, u8_t), 0, 3, world) }.unwrap();
                assert_eq!(out, [9]);
            }
        });
    }
}
