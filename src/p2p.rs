//! Point-to-point operations.

use crate::buffer::{InBuffer, OutBuffer};
use crate::comm::{count_of, raw_buf, raw_buf_mut};
use crate::datatype::MpiDatatype;
use crate::error::{Error, Result};
use crate::params::{Rank, Tag};
use crate::request::RequestHandle;
use crate::result::{Completion, MpiResult, NonBlockingResult, NotPresent};
use crate::roles;
use crate::select::{
    Collect, CountSlot, IrecvArgs, IsendArgs, ProbeArgs, RankSlot, RecvArgs, RecvBufSlot,
    RequestSlot, Required, SendArgs, SendModeSlot, StatusSlot, TagSlot,
};
use crate::status::Status;
use crate::Communicator;

/// Outputs of a receive: the buffer, the count and the status, each present
/// only if the library owns it.
pub type RecvResult<B, C, S> = MpiResult<
    <B as OutBuffer>::Part,
    NotPresent,
    NotPresent,
    NotPresent,
    NotPresent,
    <C as CountSlot>::Part,
    NotPresent,
    <S as StatusSlot>::Part,
>;

impl Communicator {
    /// Blocking send.
    ///
    /// Parameters: `send_buf` and `destination` (required), `tag` (default
    /// 0), `send_mode` (default standard).
    pub fn send<Args, SB, D, Tg, M>(&self, args: Args) -> Result<()>
    where
        Args: Collect<SendArgs, Output = SendArgs<SB, D, Tg, M>>,
        SB: InBuffer + Required<roles::SendBuf>,
        D: RankSlot + Required<roles::Destination>,
        Tg: TagSlot,
        M: SendModeSlot,
    {
        let SendArgs {
            send_buf,
            destination,
            tag,
            send_mode,
        } = args.collect_into(<SendArgs>::default());
        let (dest, tag) = self.send_envelope(&destination, &tag)?;
        let datatype = self.datatype::<SB::Elem>()?;
        let buf = raw_buf(InBuffer::elements(&send_buf), datatype)?;
        unsafe {
            self.issue("send")
                .send(send_mode.mode(), buf, dest, tag, self.raw_handle())
        }
    }

    /// Nonblocking send.
    ///
    /// Parameters: `send_buf` and `destination` (required), `tag`,
    /// `send_mode`, `request`. The send buffer moves into the returned
    /// result and stays there until the request completes. Without a
    /// `request` parameter the result owns a fresh [`Request`](crate::Request);
    /// with `request(pool.get_request())` it lives in the pool.
    pub fn isend<Args, SB, D, Tg, M, Q>(
        &self,
        args: Args,
    ) -> Result<NonBlockingResult<Q::Handle, IsendPending<SB>>>
    where
        Args: Collect<IsendArgs, Output = IsendArgs<SB, D, Tg, M, Q>>,
        SB: InBuffer + Required<roles::SendBuf>,
        D: RankSlot + Required<roles::Destination>,
        Tg: TagSlot,
        M: SendModeSlot,
        Q: RequestSlot,
        Q::Handle: RequestHandle<IsendPending<SB>>,
    {
        let IsendArgs {
            send_buf,
            destination,
            tag,
            send_mode,
            request,
        } = args.collect_into(<IsendArgs>::default());
        let (dest, tag) = self.send_envelope(&destination, &tag)?;
        let datatype = self.datatype::<SB::Elem>()?;
        // Boxed so that inline storage keeps its address while in flight.
        let buf = Box::new(send_buf);
        let raw = unsafe {
            self.issue("isend").isend(
                send_mode.mode(),
                raw_buf(InBuffer::elements(&*buf), datatype)?,
                dest,
                tag,
                self.raw_handle(),
            )?
        };
        let handle = request.start(self, raw);
        Ok(NonBlockingResult::new(handle, IsendPending { _buf: buf }))
    }

    /// Blocking receive.
    ///
    /// Parameters: `recv_buf`, `source` (default any), `tag` (default any),
    /// `recv_count`, `status`. Without `recv_count`, a single-element buffer
    /// receives one element; any other buffer is sized from a probe of the
    /// matching message first. After the receive, a buffer whose policy
    /// allows it is resized to the number of elements that arrived.
    ///
    /// `T` comes from the receive buffer; an omitted one must be named, e.g.
    /// `recv_buf(alloc_container_of::<f64>())`.
    pub fn recv<T, Args, RB, S, Tg, C, St>(
        &self,
        args: Args,
    ) -> Result<RecvResult<RB::Buffer, C, St>>
    where
        T: MpiDatatype,
        Args: Collect<RecvArgs, Output = RecvArgs<RB, S, Tg, C, St>>,
        RB: RecvBufSlot<T>,
        S: RankSlot,
        Tg: TagSlot,
        C: CountSlot,
        St: StatusSlot,
    {
        let RecvArgs {
            recv_buf,
            source,
            tag,
            recv_count: mut count,
            status: mut status_slot,
        } = args.collect_into(<RecvArgs>::default());
        let (mut source, mut tag) = self.recv_envelope(&source, &tag)?;
        let datatype = self.datatype::<T>()?;
        let elem_size = self.transport().type_size(datatype)?;
        let mut buf = recv_buf.into_buffer();

        let capacity = match count.given() {
            Some(n) => usize::try_from(n).map_err(|_| {
                Error::InvalidArgument(format!("recv_count must not be negative, got {n}"))
            })?,
            None if buf.is_single() => 1,
            None => {
                let probed = self.issue("probe").probe(source, tag, self.raw_handle())?;
                tracing::debug!(
                    comm = self.raw_handle().0,
                    source = probed.source,
                    tag = probed.tag,
                    bytes = probed.bytes,
                    "probed message size"
                );
                // Receive exactly the probed message.
                if probed.source != self.transport().sentinels().proc_null {
                    source = probed.source;
                    tag = probed.tag;
                }
                elements(Status::from_raw(probed).bytes, elem_size)
            }
        };

        let data = &mut buf.prepare(capacity)?[..capacity];
        let raw = unsafe {
            self.issue("recv")
                .recv(raw_buf_mut(data, datatype)?, source, tag, self.raw_handle())?
        };
        let status = Status::from_raw(raw);
        let received = elements(status.bytes, elem_size);
        buf.prepare(received)?;

        count.store(count_of(received)?);
        status_slot.store(status);
        Ok(MpiResult::new()
            .with_recv_buf(buf.finish())
            .with_recv_count(count.finish())
            .with_status(status_slot.finish()))
    }

    /// Nonblocking receive.
    ///
    /// Parameters: `recv_buf`, `source`, `tag`, `recv_count`, `status`,
    /// `request`. The buffer is posted with room for `recv_count` elements
    /// if given, else with its current length (one for single elements);
    /// there is no probe. Once the request completes, a buffer whose policy
    /// allows it is resized to the number of elements that arrived.
    pub fn irecv<T, Args, RB, S, Tg, C, St, Q>(
        &self,
        args: Args,
    ) -> Result<NonBlockingResult<Q::Handle, IrecvPending<RB::Buffer, C, St>>>
    where
        T: MpiDatatype,
        Args: Collect<IrecvArgs, Output = IrecvArgs<RB, S, Tg, C, St, Q>>,
        RB: RecvBufSlot<T>,
        S: RankSlot,
        Tg: TagSlot,
        C: CountSlot,
        St: StatusSlot,
        Q: RequestSlot,
        Q::Handle: RequestHandle<IrecvPending<RB::Buffer, C, St>>,
    {
        let IrecvArgs {
            recv_buf,
            source,
            tag,
            recv_count: count,
            status,
            request,
        } = args.collect_into(<IrecvArgs>::default());
        let (source, tag) = self.recv_envelope(&source, &tag)?;
        let datatype = self.datatype::<T>()?;
        let elem_size = self.transport().type_size(datatype)?;
        let mut buf = Box::new(recv_buf.into_buffer());

        let capacity = match count.given() {
            Some(n) => {
                let n = usize::try_from(n).map_err(|_| {
                    Error::InvalidArgument(format!("recv_count must not be negative, got {n}"))
                })?;
                buf.prepare(n)?;
                n
            }
            None => buf.len(),
        };
        let raw = unsafe {
            let data = &mut buf.elements_mut()[..capacity];
            self.issue("irecv")
                .irecv(raw_buf_mut(data, datatype)?, source, tag, self.raw_handle())?
        };
        let handle = request.start(self, raw);
        Ok(NonBlockingResult::new(
            handle,
            IrecvPending {
                buf,
                count,
                status,
                elem_size,
            },
        ))
    }

    /// Block until a matching message is available and describe it.
    ///
    /// Parameters: `source` (default any), `tag` (default any). Pass `()`
    /// to probe for any message.
    pub fn probe<Args, S, Tg>(&self, args: Args) -> Result<Status>
    where
        Args: Collect<ProbeArgs, Output = ProbeArgs<S, Tg>>,
        S: RankSlot,
        Tg: TagSlot,
    {
        let ProbeArgs { source, tag } = args.collect_into(<ProbeArgs>::default());
        let (source, tag) = self.recv_envelope(&source, &tag)?;
        let raw = self.issue("probe").probe(source, tag, self.raw_handle())?;
        Ok(Status::from_raw(raw))
    }

    /// Describe a matching message if one is available.
    pub fn iprobe<Args, S, Tg>(&self, args: Args) -> Result<Option<Status>>
    where
        Args: Collect<ProbeArgs, Output = ProbeArgs<S, Tg>>,
        S: RankSlot,
        Tg: TagSlot,
    {
        let ProbeArgs { source, tag } = args.collect_into(<ProbeArgs>::default());
        let (source, tag) = self.recv_envelope(&source, &tag)?;
        let raw = self.issue("iprobe").iprobe(source, tag, self.raw_handle())?;
        Ok(raw.map(Status::from_raw))
    }

    fn send_envelope(&self, destination: &impl RankSlot, tag: &impl TagSlot) -> Result<(i32, i32)> {
        let dest = match destination.rank() {
            Some(rank) => self.peer(rank, false)?,
            None => return Err(Error::InvalidArgument("a destination is required".into())),
        };
        let tag = self.message_tag(tag.tag().unwrap_or(Tag::Value(0)), false)?;
        Ok((dest, tag))
    }

    fn recv_envelope(&self, source: &impl RankSlot, tag: &impl TagSlot) -> Result<(i32, i32)> {
        let source = self.peer(source.rank().unwrap_or(Rank::Any), true)?;
        let tag = self.message_tag(tag.tag().unwrap_or(Tag::Any), true)?;
        Ok((source, tag))
    }
}

fn elements(bytes: usize, elem_size: usize) -> usize {
    if elem_size == 0 {
        0
    } else {
        bytes / elem_size
    }
}

/// The in-flight part of an [`isend`](Communicator::isend): the send buffer.
pub struct IsendPending<B> {
    _buf: Box<B>,
}

impl<B> Completion for IsendPending<B> {
    type Output = ();

    fn complete(self, _status: Status) -> Result<()> {
        Ok(())
    }
}

/// The in-flight part of an [`irecv`](Communicator::irecv): the receive
/// buffer and the count and status slots filled on completion.
pub struct IrecvPending<B, C, S> {
    buf: Box<B>,
    count: C,
    status: S,
    elem_size: usize,
}

impl<B, C, S> Completion for IrecvPending<B, C, S>
where
    B: OutBuffer,
    C: CountSlot,
    S: StatusSlot,
{
    type Output = RecvResult<B, C, S>;

    fn complete(self, status: Status) -> Result<Self::Output> {
        let IrecvPending {
            buf,
            mut count,
            status: mut status_slot,
            elem_size,
        } = self;
        let mut buf = *buf;
        let received = elements(status.bytes, elem_size);
        buf.prepare(received)?;
        count.store(count_of(received)?);
        status_slot.store(status);
        Ok(MpiResult::new()
            .with_recv_buf(buf.finish())
            .with_recv_count(count.finish())
            .with_status(status_slot.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local;
    use crate::params::{
        alloc_container_of, destination, recv_buf, recv_count, recv_count_out, request,
        send_buf, send_mode, source, status_out, tag,
    };
    use crate::transport::SendMode;

    #[test]
    fn recv_sizes_library_buffers_by_probing() {
        local::run(2, |mpi| {
            let world = mpi.world();
            if world.rank() == 0 {
                world
                    .send((send_buf(&[1u64, 2, 3][..]), destination(1), tag(4)))
                    .unwrap();
            } else {
                let result = world
                    .recv((recv_buf(alloc_container_of::<u64>()), recv_count_out(), status_out()))
                    .unwrap();
                let (data, rest) = result.extract_recv_buffer();
                let (count, rest) = rest.extract_recv_count();
                let status = rest.into_value();
                assert_eq!(data, vec![1, 2, 3]);
                assert_eq!(count, 3);
                assert_eq!((status.source, status.tag), (0, 4));
            }
        });
    }

    #[test]
    fn recv_with_count_uses_caller_capacity() {
        local::run(2, |mpi| {
            let world = mpi.world();
            if world.rank() == 0 {
                world
                    .send((send_buf(&[5i32, 6][..]), destination(1), send_mode(SendMode::Synchronous)))
                    .unwrap();
            } else {
                let mut out = vec![0i32; 4];
                let status = world
                    .recv((recv_buf(&mut out), source(0), recv_count(4), status_out()))
                    .unwrap()
                    .into_value();
                assert_eq!(status.bytes, 8);
                assert_eq!(out, vec![5, 6, 0, 0]);
            }
        });
    }

    #[test]
    fn invalid_envelopes_are_rejected() {
        local::run(2, |mpi| {
            let world = mpi.world();
            let err = world.send((send_buf(1i32), destination(5))).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
            let err = world
                .send((send_buf(1i32), destination(Rank::Any)))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
            let err = world
                .send((send_buf(1i32), destination(0), tag(Tag::Any)))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        });
    }

    #[test]
    fn proc_null_completes_immediately() {
        local::run(1, |mpi| {
            let world = mpi.world();
            world.send((send_buf(7i32), destination(Rank::Null))).unwrap();
            let mut value = 3i32;
            let status = world
                .recv((recv_buf(&mut value), source(Rank::Null), status_out()))
                .unwrap()
                .into_value();
            assert_eq!(value, 3);
            assert_eq!(status.bytes, 0);
        });
    }

    #[test]
    fn irecv_resizes_on_completion() {
        local::run(2, |mpi| {
            let world = mpi.world();
            if world.rank() == 0 {
                let pending = world
                    .isend((send_buf(vec![9i16, 8]), destination(1), tag(2)))
                    .unwrap();
                pending.wait().unwrap();
            } else {
                let mut room = vec![0i16; 8];
                let pending = world
                    .irecv((recv_buf(&mut room).resize_to_fit(), tag(2), recv_count_out()))
                    .unwrap();
                let (count, _) = pending.wait().unwrap().extract_recv_count();
                assert_eq!(count, 2);
                assert_eq!(room, vec![9, 8]);
            }
        });
    }

    #[test]
    fn test_yields_the_result_once() {
        local::run(1, |mpi| {
            let world = mpi.world();
            let mut pending = world
                .irecv((recv_buf(alloc_container_of::<u8>()), recv_count(3), tag(1)))
                .unwrap();
            assert!(pending.test().unwrap().is_none());
            world
                .send((send_buf(&[1u8, 2, 3][..]), destination(0), tag(1)))
                .unwrap();
            let received = loop {
                if let Some(result) = pending.test().unwrap() {
                    break result.into_value();
                }
            };
            assert_eq!(received, vec![1, 2, 3]);
            assert!(pending.is_complete());
            assert!(matches!(pending.test(), Err(Error::LogicError(_))));
        });
    }

    #[test]
    fn pooled_isend_parks_dropped_buffers() {
        local::run(2, |mpi| {
            let world = mpi.world();
            if world.rank() == 0 {
                let pool = world.request_pool();
                let pending = world
                    .isend((send_buf(vec![1i32; 16]), destination(1), request(pool.get_request())))
                    .unwrap();
                drop(pending);
                pool.wait_all().unwrap();
                assert_eq!(pool.active(), 0);
            } else {
                let data = world
                    .recv(recv_buf(alloc_container_of::<i32>()))
                    .unwrap()
                    .into_value();
                assert_eq!(data.len(), 16);
            }
        });
    }

    #[test]
    fn probe_and_iprobe() {
        local::run(1, |mpi| {
            let world = mpi.world();
            assert_eq!(world.iprobe(()).unwrap(), None);
            world
                .send((send_buf(&[0.5f32; 3][..]), destination(0), tag(11)))
                .unwrap();
            let status = world.iprobe(tag(11)).unwrap().unwrap();
            assert_eq!(status.count::<f32>(), 3);
            assert_eq!(world.probe((source(0), tag(11))).unwrap(), status);
            let drained = world.recv(recv_buf(alloc_container_of::<f32>())).unwrap();
            assert_eq!(drained.into_value(), vec![0.5; 3]);
            assert_eq!(world.iprobe(()).unwrap(), None);
        });
    }
}
