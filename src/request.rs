//! Request handles for nonblocking operations.
//!
//! A nonblocking operation issues into either a [`Request`] it owns or a slot
//! of a [`RequestPool`], selected with the `request` parameter. Pools store
//! their requests contiguously and complete them with one vectorized call.
//!
//! ```
//! use mpiparams::local;
//! use mpiparams::params::{destination, recv_buf, request, send_buf, source, statuses_out, tag};
//!
//! local::run(3, |mpi| {
//!     let world = mpi.world();
//!     if world.rank() == 0 {
//!         let payload = [7i32];
//!         let pool = world.request_pool();
//!         for peer in 1..world.size() {
//!             let _ = world
//!                 .isend((send_buf(&payload), destination(peer), tag(peer), request(pool.get_request())))
//!                 .unwrap();
//!         }
//!         let statuses = pool.wait_all_with(statuses_out()).unwrap();
//!         assert_eq!(statuses.len(), 2);
//!     } else {
//!         let mut value = 0i32;
//!         world.recv((recv_buf(&mut value), source(0))).unwrap();
//!         assert_eq!(value, 7);
//!     }
//! });
//! ```

use crate::error::Result;
use crate::result::ResultPart;
use crate::select::{StatusSlot, StatusesSlot};
use crate::status::Status;
use crate::transport::{AnyOutcome, RawRequest, RawStatus, Transport};
use crate::Context;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The request side of a [`NonBlockingResult`](crate::result::NonBlockingResult).
///
/// Implemented by [`Request`] and [`PooledRequest`]; `C` is the deferred
/// part of the operation the request belongs to.
pub trait RequestHandle<C> {
    /// Block until the request completes.
    fn wait_status(&mut self) -> Result<Status>;

    /// Check the request without blocking.
    fn test_status(&mut self) -> Result<Option<Status>>;

    /// True while the request has not completed.
    fn is_active(&self) -> bool;

    /// Give up on the request; `pending` must outlive the operation.
    fn abandon(&mut self, pending: C);
}

fn empty_status(transport: &dyn Transport) -> RawStatus {
    let sentinels = transport.sentinels();
    RawStatus {
        source: sentinels.any_source,
        tag: sentinels.any_tag,
        error: 0,
        bytes: 0,
    }
}

// ============================================================================
// Request
// ============================================================================

/// A handle to one nonblocking operation.
///
/// Starts out null, becomes active when an operation is issued into it and
/// null again once `wait` or a successful `test` completed it. The status of
/// the last completion is kept, so waiting on a completed request returns it
/// again.
pub struct Request {
    raw: RawRequest,
    last: Option<RawStatus>,
    ctx: Rc<Context>,
}

impl Request {
    pub(crate) fn null(ctx: Rc<Context>) -> Self {
        Request {
            raw: RawRequest::NULL,
            last: None,
            ctx,
        }
    }

    pub(crate) fn start(&mut self, raw: RawRequest) {
        self.raw = raw;
        self.last = None;
    }

    /// Get the raw request handle (for advanced use).
    pub fn raw(&self) -> RawRequest {
        self.raw
    }

    /// True if no operation is in flight.
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    /// Block until the operation completes.
    pub fn wait(&mut self) -> Result<()> {
        self.complete().map(|_| ())
    }

    /// Block until the operation completes and report its status through a
    /// `status` parameter.
    pub fn wait_with<S: StatusSlot>(
        &mut self,
        mut status: S,
    ) -> Result<<S::Part as ResultPart>::Value> {
        let raw = self.complete()?;
        status.store(Status::from_raw(raw));
        Ok(status.finish().into_value())
    }

    /// Check whether the operation completed.
    pub fn test(&mut self) -> Result<bool> {
        Ok(self.poll()?.is_some())
    }

    /// Check whether the operation completed; on completion report its status
    /// through a `status` parameter.
    pub fn test_with<S: StatusSlot>(
        &mut self,
        mut status: S,
    ) -> Result<Option<<S::Part as ResultPart>::Value>> {
        Ok(self.poll()?.map(|raw| {
            status.store(Status::from_raw(raw));
            status.finish().into_value()
        }))
    }

    fn complete(&mut self) -> Result<RawStatus> {
        if self.raw.is_null() {
            return Ok(self
                .last
                .unwrap_or_else(|| empty_status(self.ctx.transport())));
        }
        let status = self.ctx.transport().wait(&mut self.raw)?;
        self.last = Some(status);
        Ok(status)
    }

    fn poll(&mut self) -> Result<Option<RawStatus>> {
        if self.raw.is_null() {
            return Ok(Some(
                self.last
                    .unwrap_or_else(|| empty_status(self.ctx.transport())),
            ));
        }
        let status = self.ctx.transport().test(&mut self.raw)?;
        if status.is_some() {
            self.last = status;
        }
        Ok(status)
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("raw", &self.raw.0)
            .field("active", &!self.is_null())
            .finish()
    }
}

impl<C> RequestHandle<C> for Request {
    fn wait_status(&mut self) -> Result<Status> {
        self.complete().map(Status::from_raw)
    }

    fn test_status(&mut self) -> Result<Option<Status>> {
        Ok(self.poll()?.map(Status::from_raw))
    }

    fn is_active(&self) -> bool {
        !self.is_null()
    }

    fn abandon(&mut self, pending: C) {
        if !self.is_null() {
            tracing::warn!(
                request = self.raw.0,
                "nonblocking result dropped before completion; waiting on it"
            );
            if let Err(err) = self.wait() {
                tracing::warn!(%err, "waiting on an abandoned request failed");
            }
        }
        drop(pending);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            // Buffers of the operation may be released right after this.
            if let Err(err) = self.ctx.transport().wait(&mut self.raw) {
                tracing::warn!(%err, "waiting on a dropped request failed");
            }
        }
    }
}

// ============================================================================
// Request pool
// ============================================================================

trait Parked {}

impl<T> Parked for T {}

/// Contiguous storage for many requests.
///
/// [`get_request`](Self::get_request) appends a null request and returns a
/// handle to pass as the `request` parameter. Indices are stable for the
/// pool's lifetime. `'buf` bounds the buffers of the operations issued into
/// the pool: a pending result dropped before completion parks its buffers
/// here until the pool completes them.
///
/// Dropping the pool waits on every request still active.
pub struct RequestPool<'buf> {
    ctx: Rc<Context>,
    requests: RefCell<Vec<RawRequest>>,
    last: RefCell<Vec<Option<RawStatus>>>,
    parked: RefCell<Vec<Box<dyn Parked + 'buf>>>,
}

impl<'buf> RequestPool<'buf> {
    pub(crate) fn new(ctx: Rc<Context>) -> Self {
        RequestPool {
            ctx,
            requests: RefCell::new(Vec::new()),
            last: RefCell::new(Vec::new()),
            parked: RefCell::new(Vec::new()),
        }
    }

    /// Append a null request and return a handle to it.
    pub fn get_request(&self) -> PooledRequest<'_, 'buf> {
        let mut requests = self.requests.borrow_mut();
        requests.push(RawRequest::NULL);
        self.last.borrow_mut().push(None);
        PooledRequest {
            pool: self,
            index: requests.len() - 1,
        }
    }

    /// Number of requests handed out.
    pub fn len(&self) -> usize {
        self.requests.borrow().len()
    }

    /// True if no request was handed out.
    pub fn is_empty(&self) -> bool {
        self.requests.borrow().is_empty()
    }

    /// Number of requests still active.
    pub fn active(&self) -> usize {
        self.requests.borrow().iter().filter(|r| !r.is_null()).count()
    }

    /// True if the request at `index` is null.
    pub fn is_null(&self, index: usize) -> bool {
        self.requests.borrow().get(index).map_or(true, |r| r.is_null())
    }

    /// Block until every request completes.
    pub fn wait_all(&self) -> Result<()> {
        self.complete_all().map(|_| ())
    }

    /// Block until every request completes and report their statuses, in
    /// pool order, through a `statuses` parameter.
    pub fn wait_all_with<S: StatusesSlot>(
        &self,
        mut statuses: S,
    ) -> Result<<S::Part as ResultPart>::Value> {
        let all = self.complete_all()?;
        statuses.store(&all)?;
        Ok(statuses.finish().into_value())
    }

    /// Check whether every request has completed.
    pub fn test_all(&self) -> Result<bool> {
        Ok(self.poll_all()?.is_some())
    }

    /// Check whether every request has completed, reporting statuses through
    /// a `statuses` parameter.
    ///
    /// The statuses are written on every call, complete or not: the
    /// transport offers no way to retrieve them after a successful test.
    /// Entries of requests that have not completed are unspecified.
    pub fn test_all_with<S: StatusesSlot>(
        &self,
        mut statuses: S,
    ) -> Result<Option<<S::Part as ResultPart>::Value>> {
        let outcome = self.poll_all()?;
        let written = match &outcome {
            Some(all) => all.clone(),
            None => self.snapshot(),
        };
        statuses.store(&written)?;
        Ok(outcome.map(|_| statuses.finish().into_value()))
    }

    /// Block until one request completes and return its index. `None` if
    /// every request is null.
    pub fn wait_any(&self) -> Result<Option<usize>> {
        Ok(self.complete_any()?.map(|(index, _)| index))
    }

    /// Like [`wait_any`](Self::wait_any), also reporting the status through a
    /// `status` parameter.
    pub fn wait_any_with<S: StatusSlot>(
        &self,
        mut status: S,
    ) -> Result<Option<(usize, <S::Part as ResultPart>::Value)>> {
        Ok(self.complete_any()?.map(|(index, raw)| {
            status.store(Status::from_raw(raw));
            (index, status.finish().into_value())
        }))
    }

    /// Return the index of a completed request, if any has completed.
    pub fn test_any(&self) -> Result<Option<usize>> {
        Ok(self.poll_any()?.map(|(index, _)| index))
    }

    /// Like [`test_any`](Self::test_any), also reporting the status through
    /// a `status` parameter.
    pub fn test_any_with<S: StatusSlot>(
        &self,
        mut status: S,
    ) -> Result<Option<(usize, <S::Part as ResultPart>::Value)>> {
        Ok(self.poll_any()?.map(|(index, raw)| {
            status.store(Status::from_raw(raw));
            (index, status.finish().into_value())
        }))
    }

    fn transport(&self) -> &dyn Transport {
        self.ctx.transport()
    }

    fn snapshot(&self) -> Vec<Status> {
        let empty = empty_status(self.transport());
        self.last
            .borrow()
            .iter()
            .map(|last| Status::from_raw(last.unwrap_or(empty)))
            .collect()
    }

    /// Record completions of the requests that were active before a
    /// vectorized call.
    fn record(&self, was_active: &[bool], raw: &[RawStatus]) {
        let mut last = self.last.borrow_mut();
        for ((slot, &active), status) in last.iter_mut().zip(was_active).zip(raw) {
            if active {
                *slot = Some(*status);
            }
        }
    }

    fn complete_all(&self) -> Result<Vec<Status>> {
        {
            let mut requests = self.requests.borrow_mut();
            let was_active: Vec<bool> = requests.iter().map(|r| !r.is_null()).collect();
            let mut raw = vec![RawStatus::default(); requests.len()];
            self.transport().wait_all(&mut requests, Some(&mut raw))?;
            self.record(&was_active, &raw);
        }
        self.release_parked();
        Ok(self.snapshot())
    }

    fn poll_all(&self) -> Result<Option<Vec<Status>>> {
        let done = {
            let mut requests = self.requests.borrow_mut();
            let was_active: Vec<bool> = requests.iter().map(|r| !r.is_null()).collect();
            let mut raw = vec![RawStatus::default(); requests.len()];
            let done = self.transport().test_all(&mut requests, Some(&mut raw))?;
            if done {
                self.record(&was_active, &raw);
            }
            done
        };
        if !done {
            return Ok(None);
        }
        self.release_parked();
        Ok(Some(self.snapshot()))
    }

    fn complete_any(&self) -> Result<Option<(usize, RawStatus)>> {
        let found = {
            let mut requests = self.requests.borrow_mut();
            self.transport().wait_any(&mut requests)?
        };
        if let Some((index, status)) = found {
            self.finish_one(index, status);
        }
        Ok(found)
    }

    fn poll_any(&self) -> Result<Option<(usize, RawStatus)>> {
        let outcome = {
            let mut requests = self.requests.borrow_mut();
            self.transport().test_any(&mut requests)?
        };
        match outcome {
            AnyOutcome::Completed(index, status) => {
                self.finish_one(index, status);
                Ok(Some((index, status)))
            }
            AnyOutcome::Pending | AnyOutcome::NoneActive => Ok(None),
        }
    }

    fn finish_one(&self, index: usize, status: RawStatus) {
        if let Some(slot) = self.last.borrow_mut().get_mut(index) {
            *slot = Some(status);
        }
        if self.active() == 0 {
            self.release_parked();
        }
    }

    fn wait_one(&self, index: usize) -> Result<RawStatus> {
        let raw = self.requests.borrow().get(index).copied();
        match raw {
            Some(mut raw) if !raw.is_null() => {
                let status = self.transport().wait(&mut raw)?;
                self.requests.borrow_mut()[index] = raw;
                self.finish_one(index, status);
                Ok(status)
            }
            _ => Ok(self.last_status(index)),
        }
    }

    fn test_one(&self, index: usize) -> Result<Option<RawStatus>> {
        let raw = self.requests.borrow().get(index).copied();
        match raw {
            Some(mut raw) if !raw.is_null() => {
                let status = self.transport().test(&mut raw)?;
                if let Some(status) = status {
                    self.requests.borrow_mut()[index] = raw;
                    self.finish_one(index, status);
                }
                Ok(status)
            }
            _ => Ok(Some(self.last_status(index))),
        }
    }

    fn last_status(&self, index: usize) -> RawStatus {
        self.last
            .borrow()
            .get(index)
            .copied()
            .flatten()
            .unwrap_or_else(|| empty_status(self.transport()))
    }

    fn park(&self, pending: Box<dyn Parked + 'buf>) {
        self.parked.borrow_mut().push(pending);
    }

    fn release_parked(&self) {
        let released = std::mem::take(&mut *self.parked.borrow_mut());
        if !released.is_empty() {
            tracing::debug!(count = released.len(), "released parked buffers");
        }
    }
}

impl Drop for RequestPool<'_> {
    fn drop(&mut self) {
        if self.active() > 0 {
            if let Err(err) = self.wait_all() {
                tracing::warn!(%err, "waiting on pooled requests at drop failed");
            }
        }
    }
}

impl fmt::Debug for RequestPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPool")
            .field("len", &self.len())
            .field("active", &self.active())
            .field("parked", &self.parked.borrow().len())
            .finish()
    }
}

/// A slot of a [`RequestPool`].
pub struct PooledRequest<'p, 'buf> {
    pool: &'p RequestPool<'buf>,
    index: usize,
}

impl PooledRequest<'_, '_> {
    /// Position of this request in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// True if no operation is in flight in this slot.
    pub fn is_null(&self) -> bool {
        self.pool.is_null(self.index)
    }

    pub(crate) fn start(&mut self, raw: RawRequest) {
        if let Some(slot) = self.pool.requests.borrow_mut().get_mut(self.index) {
            *slot = raw;
        }
        if let Some(slot) = self.pool.last.borrow_mut().get_mut(self.index) {
            *slot = None;
        }
    }
}

impl PartialEq for PooledRequest<'_, '_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.pool, other.pool) && self.index == other.index
    }
}

impl fmt::Debug for PooledRequest<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledRequest")
            .field("index", &self.index)
            .field("active", &!self.is_null())
            .finish()
    }
}

impl<'buf, C: 'buf> RequestHandle<C> for PooledRequest<'_, 'buf> {
    fn wait_status(&mut self) -> Result<Status> {
        self.pool.wait_one(self.index).map(Status::from_raw)
    }

    fn test_status(&mut self) -> Result<Option<Status>> {
        Ok(self.pool.test_one(self.index)?.map(Status::from_raw))
    }

    fn is_active(&self) -> bool {
        !self.is_null()
    }

    fn abandon(&mut self, pending: C) {
        if self.is_null() {
            drop(pending);
        } else {
            self.pool.park(Box::new(pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::BuiltinType;
    use crate::params::{status_out, statuses, statuses_out};
    use crate::transport::local::LocalTransport;
    use crate::transport::{RawBuf, RawBufMut, SendMode};
    use crate::Mpi;

    fn self_send(ctx: &Context, value: &i32, tag: i32) -> RawRequest {
        let transport = ctx.transport();
        let buf = RawBuf {
            ptr: (value as *const i32).cast(),
            count: 1,
            datatype: transport.builtin_datatype(BuiltinType::I32),
        };
        unsafe { transport.isend(SendMode::Standard, buf, 0, tag, transport.world()) }.unwrap()
    }

    fn self_recv(ctx: &Context, out: &mut i32, tag: i32) -> RawRequest {
        let transport = ctx.transport();
        let buf = RawBufMut {
            ptr: (out as *mut i32).cast(),
            count: 1,
            datatype: transport.builtin_datatype(BuiltinType::I32),
        };
        unsafe { transport.irecv(buf, 0, tag, transport.world()) }.unwrap()
    }

    #[test]
    fn request_is_null_after_wait() {
        let mpi = Mpi::with_transport(LocalTransport::single()).unwrap();
        let ctx = Rc::clone(&mpi.ctx);
        let value = 5i32;
        let mut out = 0i32;

        let mut send = Request::null(Rc::clone(&ctx));
        assert!(send.is_null());
        send.start(self_send(&ctx, &value, 3));
        assert!(!send.is_null());
        send.wait().unwrap();
        assert!(send.is_null());

        let mut recv = Request::null(Rc::clone(&ctx));
        recv.start(self_recv(&ctx, &mut out, 3));
        let status = recv.wait_with(status_out()).unwrap();
        assert!(recv.is_null());
        assert_eq!((status.source, status.tag, status.bytes), (0, 3, 4));
        assert_eq!(out, 5);

        // The last status is kept.
        assert_eq!(recv.wait_with(status_out()).unwrap(), status);
    }

    #[test]
    fn successful_test_nulls_the_request() {
        let mpi = Mpi::with_transport(LocalTransport::single()).unwrap();
        let ctx = Rc::clone(&mpi.ctx);
        let mut out = 0i32;
        let mut recv = Request::null(Rc::clone(&ctx));
        recv.start(self_recv(&ctx, &mut out, 8));
        assert!(!recv.test().unwrap());
        assert!(!recv.is_null());

        let value = 11i32;
        let mut send = Request::null(Rc::clone(&ctx));
        send.start(self_send(&ctx, &value, 8));
        send.wait().unwrap();

        let status = recv.test_with(status_out()).unwrap().unwrap();
        assert!(recv.is_null());
        assert_eq!(status.tag, 8);
        assert_eq!(out, 11);
    }

    #[test]
    fn pool_reports_statuses_in_order() {
        let mpi = Mpi::with_transport(LocalTransport::single()).unwrap();
        let ctx = Rc::clone(&mpi.ctx);
        let values = [1i32, 2, 3];
        let mut outs = [0i32; 3];
        let pool = RequestPool::new(Rc::clone(&ctx));
        assert!(pool.is_empty());

        let mut sends: Vec<_> = (0..3).map(|_| pool.get_request()).collect();
        for (i, (slot, value)) in sends.iter_mut().zip(&values).enumerate() {
            slot.start(self_send(&ctx, value, 40 + i as i32));
        }
        assert_eq!(pool.active(), 3);
        let collected = pool.wait_all_with(statuses_out()).unwrap();
        assert_eq!(collected.iter().map(|s| s.tag).collect::<Vec<_>>(), [40, 41, 42]);
        assert!(sends.iter().all(PooledRequest::is_null));

        for (i, out) in outs.iter_mut().enumerate() {
            let mut slot = pool.get_request();
            slot.start(self_recv(&ctx, out, 40 + i as i32));
        }
        let mut caller = vec![Status::default(); 6];
        pool.wait_all_with(statuses(&mut caller)).unwrap();
        assert_eq!(caller[5].tag, 42);
        assert_eq!(pool.active(), 0);
        assert_eq!(outs, values);
    }

    #[test]
    fn any_variants_on_empty_and_finished_pools() {
        let mpi = Mpi::with_transport(LocalTransport::single()).unwrap();
        let ctx = Rc::clone(&mpi.ctx);
        let pool = RequestPool::new(Rc::clone(&ctx));
        assert_eq!(pool.wait_any().unwrap(), None);
        assert_eq!(pool.test_any().unwrap(), None);

        let value = 4i32;
        let mut slot = pool.get_request();
        slot.start(self_send(&ctx, &value, 1));
        let (index, status) = pool.wait_any_with(status_out()).unwrap().unwrap();
        assert_eq!((index, status.tag), (0, 1));
        assert!(pool.test_all().unwrap());

        let mut out = 0i32;
        let mut slot = pool.get_request();
        slot.start(self_recv(&ctx, &mut out, 1));
        assert_eq!(pool.test_any().unwrap(), None);
        assert!(!pool.test_all().unwrap());
        let mut request = pool.get_request();
        request.start(self_send(&ctx, &value, 1));
        pool.wait_all().unwrap();
        assert_eq!(out, 4);
    }
}
