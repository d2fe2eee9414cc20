//! Collective operations.
//!
//! Each operation folds its parameter pack into an argument record, resolves
//! the slots the caller left out (root, datatypes, counts, receive buffers),
//! exchanges counts only where no rank can know them, and hands raw buffer
//! descriptions to the transport. Counts follow MPI: the count of a rooted or
//! all-to-all collective is per rank.

use crate::buffer::{InBuffer, OutBuffer};
use crate::comm::{count_of, raw_buf, raw_buf_mut};
use crate::datatype::MpiDatatype;
use crate::error::{Error, Result};
use crate::operation::{BuiltinOp, ReductionOperator};
use crate::result::{MpiResult, NotPresent};
use crate::roles;
use crate::select::{
    AllgatherArgs, AllgathervArgs, AllreduceArgs, AllreduceInplaceArgs, AlltoallArgs,
    AlltoallvArgs, BcastArgs, Collect, CountSlot, ExscanArgs, GatherArgs, GathervArgs, MaybeIn,
    RecvBufSlot, ReduceArgs, Required, RootSlot, ScatterArgs, ScattervArgs, TypeSlot, VecSlot,
};
use crate::transport::{packed_displacements, RawBuf, RawBufMut, RawDatatype, RawVBuf, RawVBufMut};
use crate::Communicator;

type PartOf<B> = <B as OutBuffer>::Part;

impl Communicator {
    /// Broadcast the root's buffer to every rank.
    ///
    /// Parameters: `send_recv_buf` (required), `send_recv_count`, `root`,
    /// `send_recv_type`.
    ///
    /// Without `send_recv_count`, a single-element buffer moves one element
    /// and any other buffer first receives the root's length, so non-roots
    /// can pass a library-allocated buffer of unknown size:
    ///
    /// ```
    /// use mpiparams::local;
    /// use mpiparams::params::{alloc_new, send_recv_buf};
    ///
    /// let all = local::run(3, |mpi| {
    ///     let world = mpi.world();
    ///     if world.rank() == 0 {
    ///         let mut data: Vec<i32> = (0..10).collect();
    ///         world.bcast(send_recv_buf(&mut data)).unwrap();
    ///         data
    ///     } else {
    ///         world.bcast(send_recv_buf(alloc_new::<Vec<i32>>())).unwrap().into_value()
    ///     }
    /// });
    /// assert!(all.iter().all(|v| *v == (0..10).collect::<Vec<_>>()));
    /// ```
    pub fn bcast<Args, B, C, Rt, Ty>(
        &self,
        args: Args,
    ) -> Result<MpiResult<NotPresent, PartOf<B>, NotPresent, NotPresent, NotPresent, NotPresent, C::Part>>
    where
        Args: Collect<BcastArgs, Output = BcastArgs<B, C, Rt, Ty>>,
        B: OutBuffer + Required<roles::SendRecvBuf>,
        C: CountSlot,
        Rt: RootSlot,
        Ty: TypeSlot,
    {
        let BcastArgs {
            send_recv_buf: mut buf,
            send_recv_count: mut count,
            root,
            send_recv_type,
        } = args.collect_into(<BcastArgs>::default());
        let root = self.resolve_root(&root)?;
        let datatype = self.element_type::<B::Elem>(&send_recv_type)?;

        let n = match count.given() {
            Some(n) => non_negative(n, "send_recv_count")?,
            None if buf.is_single() => 1,
            None => {
                let len = if self.rank() == root { count_of(buf.len())? } else { 0 };
                non_negative(self.bcast_value(len, root)?, "broadcast count")?
            }
        };

        let data = if self.rank() == root {
            let available = buf.len();
            if available < n {
                return Err(Error::SizeMismatch {
                    expected: n,
                    actual: available,
                });
            }
            &mut buf.elements_mut()[..n]
        } else {
            &mut buf.prepare(n)?[..n]
        };
        unsafe {
            self.issue("bcast")
                .bcast(raw_buf_mut(data, datatype)?, root, self.raw_handle())?;
        }

        count.store(count_of(n)?);
        Ok(MpiResult::new()
            .with_send_recv_buf(buf.finish())
            .with_send_recv_count(count.finish()))
    }

    /// Gather equal-sized blocks at the root, in rank order.
    ///
    /// Parameters: `send_buf` (required), `recv_buf`, `root`, `send_type`,
    /// `recv_type`. The receive buffer is only touched on the root; a
    /// library-allocated one comes back empty elsewhere.
    pub fn gather<Args, SB, RB, Rt, ST, RT>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<GatherArgs, Output = GatherArgs<SB, RB, Rt, ST, RT>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        Rt: RootSlot,
        ST: TypeSlot,
        RT: TypeSlot,
    {
        let GatherArgs {
            send_buf,
            recv_buf,
            root,
            send_type,
            recv_type,
        } = args.collect_into(<GatherArgs>::default());
        let root = self.resolve_root(&root)?;
        let (send_type, recv_type) = self.paired_types::<SB::Elem>("gather", &send_type, &recv_type)?;
        let send = InBuffer::elements(&send_buf);
        let mut recv = recv_buf.into_buffer();

        let raw_recv = if self.rank() == root {
            let data = recv.prepare(send.len() * self.size() as usize)?;
            block_buf_mut(data, send.len(), recv_type)?
        } else {
            null_buf_mut(recv_type)
        };
        unsafe {
            self.issue("gather")
                .gather(raw_buf(send, send_type)?, raw_recv, root, self.raw_handle())?;
        }
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    /// Gather blocks of differing sizes at the root.
    ///
    /// Parameters: `send_buf` (required), `recv_buf`, `recv_counts`,
    /// `recv_displs`, `root`. Without `recv_counts` the root first gathers
    /// every rank's length. All ranks must agree on whether they pass it;
    /// every rank fails with [`Error::InvalidArgument`] when they do not, or
    /// when the root rejects its counts or displacements. Displacements
    /// default to the tightly packed layout. Counts and displacements
    /// requested as outputs are filled on the root.
    pub fn gatherv<Args, SB, RB, RC, RD, Rt>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>, NotPresent, RC::Part, RD::Part>>
    where
        Args: Collect<GathervArgs, Output = GathervArgs<SB, RB, RC, RD, Rt>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        RC: VecSlot,
        RD: VecSlot,
        Rt: RootSlot,
    {
        let GathervArgs {
            send_buf,
            recv_buf,
            mut recv_counts,
            mut recv_displs,
            root,
        } = args.collect_into(<GathervArgs>::default());
        let root = self.resolve_root(&root)?;
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);
        let is_root = self.rank() == root;

        let given = recv_counts.given();
        let own = match given {
            Some(counts) if is_root => self
                .variable_layout(counts, recv_displs.given(), "recv")
                .and_then(|displs| extent(counts, &displs).map(|_| Some(displs))),
            None if is_root => recv_displs
                .given()
                .map_or(Ok(()), |displs| self.check_per_rank(displs, "recv_displs"))
                .map(|()| None),
            _ => Ok(None),
        };
        let (checked_displs, _) =
            self.agree("gatherv", given.is_some(), own, is_root.then_some(ROOT_READY))?;

        let counts = match recv_counts.given() {
            Some(counts) => counts.to_vec(),
            None => self.gather_counts(send.len(), root)?,
        };
        let mut recv = recv_buf.into_buffer();

        let raw_send = raw_buf(send, datatype)?;
        if !is_root {
            let raw_recv = RawVBufMut {
                ptr: std::ptr::null_mut(),
                counts: &[],
                displs: &[],
                datatype,
            };
            unsafe {
                self.issue("gatherv")
                    .gatherv(raw_send, raw_recv, root, self.raw_handle())?;
            }
            return Ok(MpiResult::new()
                .with_recv_buf(recv.finish())
                .with_recv_counts(recv_counts.finish())
                .with_recv_displs(recv_displs.finish()));
        }

        let displs = match checked_displs {
            Some(displs) => displs,
            None => self.variable_layout(&counts, recv_displs.given(), "recv")?,
        };
        let data = recv.prepare(extent(&counts, &displs)?)?;
        let raw_recv = RawVBufMut {
            ptr: data.as_mut_ptr().cast(),
            counts: &counts,
            displs: &displs,
            datatype,
        };
        unsafe {
            self.issue("gatherv")
                .gatherv(raw_send, raw_recv, root, self.raw_handle())?;
        }

        recv_counts.store(&counts)?;
        recv_displs.store(&displs)?;
        Ok(MpiResult::new()
            .with_recv_buf(recv.finish())
            .with_recv_counts(recv_counts.finish())
            .with_recv_displs(recv_displs.finish()))
    }

    /// Split the root's buffer into equal blocks, one per rank.
    ///
    /// Parameters: `send_buf` (required on the root), `recv_buf`,
    /// `recv_count`, `root`, `send_type`, `recv_type`. Before any data moves
    /// the ranks agree on their arguments in one exchange, which also carries
    /// the root's block size when no rank passed `recv_count`. If the root
    /// passed no send buffer, every rank fails with [`Error::LogicError`]; if
    /// only some ranks passed `recv_count`, or any rank's arguments are
    /// rejected, every rank fails.
    ///
    /// `T` is inferred from whichever buffer a rank passes. A rank passing
    /// neither names it through its receive buffer, e.g.
    /// `recv_buf(alloc_container_of::<i32>())`.
    pub fn scatter<T, Args, SB, RB, RC, Rt, ST, RT>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>, NotPresent, NotPresent, NotPresent, NotPresent, RC::Part>>
    where
        T: MpiDatatype,
        Args: Collect<ScatterArgs, Output = ScatterArgs<SB, RB, RC, Rt, ST, RT>>,
        SB: MaybeIn<T>,
        RB: RecvBufSlot<T>,
        RC: CountSlot,
        Rt: RootSlot,
        ST: TypeSlot,
        RT: TypeSlot,
    {
        let ScatterArgs {
            send_buf,
            recv_buf,
            mut recv_count,
            root,
            send_type,
            recv_type,
        } = args.collect_into(<ScatterArgs>::default());
        let root = self.resolve_root(&root)?;
        let is_root = self.rank() == root;
        let send = if is_root {
            MaybeIn::<T>::elements(&send_buf)
        } else {
            None
        };
        let size = self.size() as usize;

        let given = recv_count.given();
        let own = self
            .paired_types::<T>("scatter", &send_type, &recv_type)
            .and_then(|types| Ok((given.map(|n| non_negative(n, "recv_count")).transpose()?, types)));
        let (own, root_code) = match own {
            Ok((count, types)) if is_root => match scatter_supply(send.map(<[T]>::len), count, size) {
                Ok(code) => (Ok((count, types)), Some(code)),
                Err(err) => (Err(err), Some(ROOT_READY)),
            },
            own => (own, is_root.then_some(ROOT_READY)),
        };
        let ((count, (send_type, recv_type)), block) =
            self.agree("scatter", given.is_some(), own, root_code)?;
        let n = match count {
            Some(n) => n,
            None => non_negative(block, "scatter count")?,
        };

        let raw_send = match send {
            Some(send) => RawBuf {
                ptr: send.as_ptr().cast(),
                count: count_of(n)?,
                datatype: send_type,
            },
            None => null_buf(send_type),
        };
        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(n)?;
        unsafe {
            self.issue("scatter").scatter(
                raw_send,
                raw_buf_mut(&mut data[..n], recv_type)?,
                root,
                self.raw_handle(),
            )?;
        }

        recv_count.store(count_of(n)?);
        Ok(MpiResult::new()
            .with_recv_buf(recv.finish())
            .with_recv_count(recv_count.finish()))
    }

    /// Send blocks of differing sizes from the root.
    ///
    /// Parameters: `send_buf` and `send_counts` (required on the root),
    /// `recv_buf`, `send_displs`, `recv_count`, `root`. The ranks first agree
    /// on their arguments: every rank fails with [`Error::LogicError`] when
    /// the root lacks `send_buf` or `send_counts`, and with an error when
    /// only some ranks pass `recv_count` or any rank's arguments are
    /// rejected. Without `recv_count` the root then scatters each rank its
    /// count.
    pub fn scatterv<T, Args, SB, RB, SC, SD, RC, Rt>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>, NotPresent, NotPresent, NotPresent, SD::Part, RC::Part>>
    where
        T: MpiDatatype,
        Args: Collect<ScattervArgs, Output = ScattervArgs<SB, RB, SC, SD, RC, Rt>>,
        SB: MaybeIn<T>,
        RB: RecvBufSlot<T>,
        SC: VecSlot,
        SD: VecSlot,
        RC: CountSlot,
        Rt: RootSlot,
    {
        let ScattervArgs {
            send_buf,
            recv_buf,
            send_counts,
            mut send_displs,
            mut recv_count,
            root,
        } = args.collect_into(<ScattervArgs>::default());
        let root = self.resolve_root(&root)?;
        let datatype = self.datatype::<T>()?;
        let is_root = self.rank() == root;

        let given = recv_count.given();
        let mut own = given.map(|n| non_negative(n, "recv_count")).transpose();
        // On the root: the send buffer with its counts and displacements.
        let mut layout = None;
        let mut root_code = None;
        if is_root {
            root_code = Some(ROOT_WITHOUT_INPUT);
            if let (Some(send), Some(counts)) = (MaybeIn::<T>::elements(&send_buf), send_counts.given()) {
                root_code = Some(ROOT_READY);
                match self.scatterv_layout(send.len(), counts, send_displs.given()) {
                    Ok(displs) => layout = Some((send, counts, displs)),
                    Err(err) => own = own.and(Err(err)),
                }
            }
        }
        let (count, _) = self.agree("scatterv", given.is_some(), own, root_code)?;
        let n = match count {
            Some(n) => n,
            None => {
                let counts = layout.as_ref().map(|(_, counts, _)| *counts);
                non_negative(self.scatter_counts(counts, root)?, "scatter count")?
            }
        };

        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(n)?;
        let raw_recv = raw_buf_mut(&mut data[..n], datatype)?;
        match &layout {
            Some((send, counts, displs)) => unsafe {
                let raw_send = RawVBuf {
                    ptr: send.as_ptr().cast(),
                    counts,
                    displs,
                    datatype,
                };
                self.issue("scatterv")
                    .scatterv(raw_send, raw_recv, root, self.raw_handle())?;
            },
            None => unsafe {
                let raw_send = RawVBuf {
                    ptr: std::ptr::null(),
                    counts: &[],
                    displs: &[],
                    datatype,
                };
                self.issue("scatterv")
                    .scatterv(raw_send, raw_recv, root, self.raw_handle())?;
            },
        }

        if let Some((_, _, displs)) = &layout {
            send_displs.store(displs)?;
        }
        recv_count.store(count_of(n)?);
        Ok(MpiResult::new()
            .with_recv_buf(recv.finish())
            .with_send_displs(send_displs.finish())
            .with_recv_count(recv_count.finish()))
    }

    /// Gather equal-sized blocks on every rank.
    ///
    /// Parameters: `send_buf` (required), `recv_buf`, `send_type`,
    /// `recv_type`.
    pub fn allgather<Args, SB, RB, ST, RT>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<AllgatherArgs, Output = AllgatherArgs<SB, RB, ST, RT>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        ST: TypeSlot,
        RT: TypeSlot,
    {
        let AllgatherArgs {
            send_buf,
            recv_buf,
            send_type,
            recv_type,
        } = args.collect_into(<AllgatherArgs>::default());
        let (send_type, recv_type) =
            self.paired_types::<SB::Elem>("allgather", &send_type, &recv_type)?;
        let send = InBuffer::elements(&send_buf);
        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(send.len() * self.size() as usize)?;
        let raw_recv = block_buf_mut(data, send.len(), recv_type)?;
        unsafe {
            self.issue("allgather")
                .allgather(raw_buf(send, send_type)?, raw_recv, self.raw_handle())?;
        }
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    /// Gather blocks of differing sizes on every rank.
    ///
    /// Parameters: `send_buf` (required), `recv_buf`, `recv_counts`,
    /// `recv_displs`. Without `recv_counts` every rank's length is
    /// allgathered first.
    pub fn allgatherv<Args, SB, RB, RC, RD>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>, NotPresent, RC::Part, RD::Part>>
    where
        Args: Collect<AllgathervArgs, Output = AllgathervArgs<SB, RB, RC, RD>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        RC: VecSlot,
        RD: VecSlot,
    {
        let AllgathervArgs {
            send_buf,
            recv_buf,
            mut recv_counts,
            mut recv_displs,
        } = args.collect_into(<AllgathervArgs>::default());
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);
        let mut recv = recv_buf.into_buffer();

        let counts = match recv_counts.given() {
            Some(counts) => counts.to_vec(),
            None => self.allgather_counts(send.len())?,
        };
        let displs = self.variable_layout(&counts, recv_displs.given(), "recv")?;

        let data = recv.prepare(extent(&counts, &displs)?)?;
        let raw_recv = RawVBufMut {
            ptr: data.as_mut_ptr().cast(),
            counts: &counts,
            displs: &displs,
            datatype,
        };
        unsafe {
            self.issue("allgatherv")
                .allgatherv(raw_buf(send, datatype)?, raw_recv, self.raw_handle())?;
        }

        recv_counts.store(&counts)?;
        recv_displs.store(&displs)?;
        Ok(MpiResult::new()
            .with_recv_buf(recv.finish())
            .with_recv_counts(recv_counts.finish())
            .with_recv_displs(recv_displs.finish()))
    }

    /// Exchange equal-sized blocks between every pair of ranks.
    ///
    /// Parameters: `send_buf` (required, one block per rank), `recv_buf`,
    /// `send_type`, `recv_type`.
    pub fn alltoall<Args, SB, RB, ST, RT>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<AlltoallArgs, Output = AlltoallArgs<SB, RB, ST, RT>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        ST: TypeSlot,
        RT: TypeSlot,
    {
        let AlltoallArgs {
            send_buf,
            recv_buf,
            send_type,
            recv_type,
        } = args.collect_into(<AlltoallArgs>::default());
        let (send_type, recv_type) =
            self.paired_types::<SB::Elem>("alltoall", &send_type, &recv_type)?;
        let send = InBuffer::elements(&send_buf);
        let size = self.size() as usize;
        if send.len() % size != 0 {
            return Err(Error::InvalidArgument(format!(
                "alltoall: {} elements do not split into {size} equal blocks",
                send.len()
            )));
        }
        let block = send.len() / size;

        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(send.len())?;
        let raw_recv = block_buf_mut(data, block, recv_type)?;
        let raw_send = RawBuf {
            ptr: send.as_ptr().cast(),
            count: count_of(block)?,
            datatype: send_type,
        };
        unsafe {
            self.issue("alltoall")
                .alltoall(raw_send, raw_recv, self.raw_handle())?;
        }
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    /// Exchange blocks of differing sizes between every pair of ranks.
    ///
    /// Parameters: `send_buf` and `send_counts` (required), `recv_buf`,
    /// `send_displs`, `recv_counts`, `recv_displs`. Without `recv_counts`
    /// the send counts are exchanged first.
    pub fn alltoallv<Args, SB, RB, SC, SD, RC, RD>(
        &self,
        args: Args,
    ) -> Result<MpiResult<PartOf<RB::Buffer>, NotPresent, RC::Part, RD::Part, SD::Part>>
    where
        Args: Collect<AlltoallvArgs, Output = AlltoallvArgs<SB, RB, SC, SD, RC, RD>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        SC: VecSlot + Required<roles::SendCounts>,
        SD: VecSlot,
        RC: VecSlot,
        RD: VecSlot,
    {
        let AlltoallvArgs {
            send_buf,
            recv_buf,
            send_counts,
            mut send_displs,
            mut recv_counts,
            mut recv_displs,
        } = args.collect_into(<AlltoallvArgs>::default());
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);

        let out_counts = send_counts.given().unwrap_or(&[]);
        let out_displs = self.variable_layout(out_counts, send_displs.given(), "send")?;
        let needed = extent(out_counts, &out_displs)?;
        if send.len() < needed {
            return Err(Error::SizeMismatch {
                expected: needed,
                actual: send.len(),
            });
        }

        let in_counts = match recv_counts.given() {
            Some(counts) => counts.to_vec(),
            None => self.alltoall_counts(out_counts)?,
        };
        let in_displs = self.variable_layout(&in_counts, recv_displs.given(), "recv")?;

        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(extent(&in_counts, &in_displs)?)?;
        let raw_send = RawVBuf {
            ptr: send.as_ptr().cast(),
            counts: out_counts,
            displs: &out_displs,
            datatype,
        };
        let raw_recv = RawVBufMut {
            ptr: data.as_mut_ptr().cast(),
            counts: &in_counts,
            displs: &in_displs,
            datatype,
        };
        unsafe {
            self.issue("alltoallv")
                .alltoallv(raw_send, raw_recv, self.raw_handle())?;
        }

        send_displs.store(&out_displs)?;
        recv_counts.store(&in_counts)?;
        recv_displs.store(&in_displs)?;
        Ok(MpiResult::new()
            .with_recv_buf(recv.finish())
            .with_recv_counts(recv_counts.finish())
            .with_recv_displs(recv_displs.finish())
            .with_send_displs(send_displs.finish()))
    }

    /// Element-wise reduction at the root.
    ///
    /// Parameters: `send_buf` and `op` (required), `recv_buf`, `root`.
    /// Builtin functors map to the stock operator; closures become a user
    /// operator that lives for this call only.
    pub fn reduce<Args, SB, RB, O, Rt>(&self, args: Args) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<ReduceArgs, Output = ReduceArgs<SB, RB, O, Rt>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        O: ReductionOperator<SB::Elem> + Required<roles::Op>,
        Rt: RootSlot,
    {
        let ReduceArgs {
            send_buf,
            recv_buf,
            op,
            root,
        } = args.collect_into(<ReduceArgs>::default());
        let root = self.resolve_root(&root)?;
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);
        let mut recv = recv_buf.into_buffer();

        let raw_recv = if self.rank() == root {
            raw_buf_mut(&mut recv.prepare(send.len())?[..send.len()], datatype)?
        } else {
            null_buf_mut(datatype)
        };
        let scoped = op.acquire(self.transport())?;
        unsafe {
            self.issue("reduce").reduce(
                raw_buf(send, datatype)?,
                raw_recv,
                scoped.raw(),
                root,
                self.raw_handle(),
            )?;
        }
        drop(scoped);
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    /// Element-wise reduction, result on every rank.
    ///
    /// Parameters: `send_buf` and `op` (required), `recv_buf`.
    pub fn allreduce<Args, SB, RB, O>(&self, args: Args) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<AllreduceArgs, Output = AllreduceArgs<SB, RB, O>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        O: ReductionOperator<SB::Elem> + Required<roles::Op>,
    {
        let AllreduceArgs {
            send_buf,
            recv_buf,
            op,
        } = args.collect_into(<AllreduceArgs>::default());
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);
        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(send.len())?;
        let raw_recv = raw_buf_mut(&mut data[..send.len()], datatype)?;
        let scoped = op.acquire(self.transport())?;
        unsafe {
            self.issue("allreduce").allreduce(
                Some(raw_buf(send, datatype)?),
                raw_recv,
                scoped.raw(),
                self.raw_handle(),
            )?;
        }
        drop(scoped);
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    /// [`allreduce`](Self::allreduce) with the result replacing the input.
    ///
    /// Parameters: `send_recv_buf` and `op` (required).
    pub fn allreduce_inplace<Args, B, O>(
        &self,
        args: Args,
    ) -> Result<MpiResult<NotPresent, PartOf<B>>>
    where
        Args: Collect<AllreduceInplaceArgs, Output = AllreduceInplaceArgs<B, O>>,
        B: OutBuffer + Required<roles::SendRecvBuf>,
        O: ReductionOperator<B::Elem> + Required<roles::Op>,
    {
        let AllreduceInplaceArgs {
            send_recv_buf: mut buf,
            op,
        } = args.collect_into(<AllreduceInplaceArgs>::default());
        let datatype = self.datatype::<B::Elem>()?;
        let raw = raw_buf_mut(buf.elements_mut(), datatype)?;
        let scoped = op.acquire(self.transport())?;
        unsafe {
            self.issue("allreduce")
                .allreduce(None, raw, scoped.raw(), self.raw_handle())?;
        }
        drop(scoped);
        Ok(MpiResult::new().with_send_recv_buf(buf.finish()))
    }

    /// Inclusive prefix reduction: rank `r` receives the reduction of the
    /// inputs of ranks `0..=r`.
    ///
    /// Parameters: `send_buf` and `op` (required), `recv_buf`.
    pub fn scan<Args, SB, RB, O>(&self, args: Args) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<AllreduceArgs, Output = AllreduceArgs<SB, RB, O>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        O: ReductionOperator<SB::Elem> + Required<roles::Op>,
    {
        let AllreduceArgs {
            send_buf,
            recv_buf,
            op,
        } = args.collect_into(<AllreduceArgs>::default());
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);
        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(send.len())?;
        let raw_recv = raw_buf_mut(&mut data[..send.len()], datatype)?;
        let scoped = op.acquire(self.transport())?;
        unsafe {
            self.issue("scan").scan(
                raw_buf(send, datatype)?,
                raw_recv,
                scoped.raw(),
                self.raw_handle(),
            )?;
        }
        drop(scoped);
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    /// Exclusive prefix reduction: rank `r` receives the reduction of the
    /// inputs of ranks `0..r`.
    ///
    /// Parameters: `send_buf` and `op` (required), `recv_buf`,
    /// `values_on_rank_0`. Rank 0 has no predecessors; its output is
    /// `values_on_rank_0` when given (one value fills every element), else
    /// the operator's identity for builtin functors, else left as it was.
    ///
    /// ```
    /// use mpiparams::local;
    /// use mpiparams::params::{op, ops, send_buf};
    ///
    /// let prefixes = local::run(3, |mpi| {
    ///     let world = mpi.world();
    ///     let mine = [world.rank() + 1];
    ///     world.exscan((send_buf(&mine), op(ops::Plus))).unwrap().into_value()
    /// });
    /// assert_eq!(prefixes, vec![vec![0], vec![1], vec![3]]);
    /// ```
    pub fn exscan<Args, SB, RB, O, V>(&self, args: Args) -> Result<MpiResult<PartOf<RB::Buffer>>>
    where
        Args: Collect<ExscanArgs, Output = ExscanArgs<SB, RB, O, V>>,
        SB: InBuffer + Required<roles::SendBuf>,
        RB: RecvBufSlot<SB::Elem>,
        O: ReductionOperator<SB::Elem> + Required<roles::Op>,
        V: MaybeIn<SB::Elem>,
    {
        let ExscanArgs {
            send_buf,
            recv_buf,
            op,
            values_on_rank_0,
        } = args.collect_into(<ExscanArgs>::default());
        let datatype = self.datatype::<SB::Elem>()?;
        let send = InBuffer::elements(&send_buf);
        let n = send.len();
        let mut recv = recv_buf.into_buffer();
        let data = recv.prepare(n)?;
        let raw_recv = raw_buf_mut(&mut data[..n], datatype)?;
        let scoped = op.acquire(self.transport())?;
        unsafe {
            self.issue("exscan").exscan(
                raw_buf(send, datatype)?,
                raw_recv,
                scoped.raw(),
                self.raw_handle(),
            )?;
        }
        drop(scoped);

        if self.rank() == 0 {
            let out = &mut recv.elements_mut()[..n];
            match MaybeIn::<SB::Elem>::elements(&values_on_rank_0) {
                Some([value]) => out.fill(*value),
                Some(values) if values.len() == n => out.copy_from_slice(values),
                Some(values) => {
                    return Err(Error::SizeMismatch {
                        expected: n,
                        actual: values.len(),
                    })
                }
                None => {
                    if let Some(identity) = ReductionOperator::<SB::Elem>::identity(&op) {
                        out.fill(identity);
                    }
                }
            }
        }
        Ok(MpiResult::new().with_recv_buf(recv.finish()))
    }

    // ========================================================================
    // Count exchanges
    // ========================================================================

    /// Broadcast one `int` from the root.
    fn bcast_value(&self, value: i32, root: i32) -> Result<i32> {
        let mut value = value;
        let datatype = self.datatype::<i32>()?;
        unsafe {
            self.issue("bcast").bcast(
                raw_buf_mut(std::slice::from_mut(&mut value), datatype)?,
                root,
                self.raw_handle(),
            )?;
        }
        tracing::debug!(comm = self.raw_handle().0, root, value, "broadcast count");
        Ok(value)
    }

    /// Every rank's `len`, at the root.
    fn gather_counts(&self, len: usize, root: i32) -> Result<Vec<i32>> {
        let mine = [count_of(len)?];
        let datatype = self.datatype::<i32>()?;
        let mut counts = Vec::new();
        let raw_recv = if self.rank() == root {
            counts.resize(self.size() as usize, 0);
            block_buf_mut(&mut counts, 1, datatype)?
        } else {
            null_buf_mut(datatype)
        };
        unsafe {
            self.issue("gather")
                .gather(raw_buf(&mine, datatype)?, raw_recv, root, self.raw_handle())?;
        }
        tracing::debug!(comm = self.raw_handle().0, root, "gathered counts");
        Ok(counts)
    }

    /// Every rank's `len`, everywhere.
    fn allgather_counts(&self, len: usize) -> Result<Vec<i32>> {
        let mine = [count_of(len)?];
        let datatype = self.datatype::<i32>()?;
        let mut counts = vec![0; self.size() as usize];
        let raw_recv = block_buf_mut(&mut counts, 1, datatype)?;
        unsafe {
            self.issue("allgather")
                .allgather(raw_buf(&mine, datatype)?, raw_recv, self.raw_handle())?;
        }
        tracing::debug!(comm = self.raw_handle().0, "allgathered counts");
        Ok(counts)
    }

    /// What every rank is about to send to this one.
    fn alltoall_counts(&self, send_counts: &[i32]) -> Result<Vec<i32>> {
        let datatype = self.datatype::<i32>()?;
        let mut counts = vec![0; self.size() as usize];
        let raw_send = RawBuf {
            ptr: send_counts.as_ptr().cast(),
            count: 1,
            datatype,
        };
        let raw_recv = block_buf_mut(&mut counts, 1, datatype)?;
        unsafe {
            self.issue("alltoall")
                .alltoall(raw_send, raw_recv, self.raw_handle())?;
        }
        tracing::debug!(comm = self.raw_handle().0, "exchanged counts");
        Ok(counts)
    }

    /// This rank's entry of the root's `counts`.
    fn scatter_counts(&self, counts: Option<&[i32]>, root: i32) -> Result<i32> {
        let datatype = self.datatype::<i32>()?;
        let raw_send = match counts {
            Some(counts) => RawBuf {
                ptr: counts.as_ptr().cast(),
                count: 1,
                datatype,
            },
            None => null_buf(datatype),
        };
        let mut mine = 0i32;
        unsafe {
            self.issue("scatter").scatter(
                raw_send,
                raw_buf_mut(std::slice::from_mut(&mut mine), datatype)?,
                root,
                self.raw_handle(),
            )?;
        }
        tracing::debug!(comm = self.raw_handle().0, root, count = mine, "scattered counts");
        Ok(mine)
    }

    /// One allreduce before an asymmetric collective moves data. Every rank
    /// reports whether it passed the receive count and whether its own
    /// arguments are usable; the root adds `root_code`.
    ///
    /// All ranks fail alike when they disagree about the count, when the
    /// root reports [`ROOT_WITHOUT_INPUT`], or when any rank rejected its
    /// arguments, in which case that rank returns its own error. Otherwise
    /// yields this rank's checked arguments and the root's code.
    fn agree<V>(
        &self,
        operation: &str,
        count_given: bool,
        own: Result<V>,
        root_code: Option<i32>,
    ) -> Result<(V, i32)> {
        let mine = [
            i32::from(count_given),
            i32::from(!count_given),
            i32::from(own.is_err()),
            root_code.unwrap_or(i32::MIN),
        ];
        let mut merged = [0i32; 4];
        let datatype = self.datatype::<i32>()?;
        unsafe {
            self.issue("allreduce").allreduce(
                Some(raw_buf(&mine, datatype)?),
                raw_buf_mut(&mut merged, datatype)?,
                self.transport().builtin_op(BuiltinOp::Max),
                self.raw_handle(),
            )?;
        }
        let [with_count, without_count, rejected, root_code] = merged;
        tracing::debug!(
            comm = self.raw_handle().0,
            operation,
            root_code,
            rejected,
            "agreed on arguments"
        );

        if with_count == 1 && without_count == 1 {
            return Err(Error::InvalidArgument(format!(
                "{operation}: the receive count was given on some ranks and not on others"
            )));
        }
        let own = own?;
        if root_code == ROOT_WITHOUT_INPUT {
            return Err(missing_scatter_input());
        }
        if rejected == 1 {
            return Err(Error::InvalidArgument(format!(
                "{operation}: another rank rejected its arguments"
            )));
        }
        Ok((own, root_code))
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Displacements for `counts`, given or packed, once both hold one entry
    /// per rank. `side` prefixes the parameter names in errors.
    fn variable_layout(&self, counts: &[i32], displs: Option<&[i32]>, side: &str) -> Result<Vec<i32>> {
        self.check_per_rank(counts, &format!("{side}_counts"))?;
        let displs = match displs {
            Some(displs) => displs.to_vec(),
            None => packed_displacements(counts)?,
        };
        self.check_per_rank(&displs, &format!("{side}_displs"))?;
        Ok(displs)
    }

    /// The root's displacements for a scatterv of `available` elements.
    fn scatterv_layout(&self, available: usize, counts: &[i32], displs: Option<&[i32]>) -> Result<Vec<i32>> {
        let displs = self.variable_layout(counts, displs, "send")?;
        let needed = extent(counts, &displs)?;
        if available < needed {
            return Err(Error::SizeMismatch {
                expected: needed,
                actual: available,
            });
        }
        Ok(displs)
    }

    /// Send and receive datatypes of a collective that requires them equal.
    fn paired_types<T: MpiDatatype>(
        &self,
        operation: &str,
        send: &impl TypeSlot,
        recv: &impl TypeSlot,
    ) -> Result<(RawDatatype, RawDatatype)> {
        let send = self.element_type::<T>(send)?;
        let recv = self.element_type::<T>(recv)?;
        self.check_same_type(operation, send, recv)?;
        Ok((send, recv))
    }

    fn check_per_rank(&self, values: &[i32], what: &str) -> Result<()> {
        if values.len() != self.size() as usize {
            return Err(Error::InvalidArgument(format!(
                "{what} holds {} entries for a communicator of size {}",
                values.len(),
                self.size()
            )));
        }
        Ok(())
    }
}

fn non_negative(count: i32, what: &str) -> Result<usize> {
    usize::try_from(count)
        .map_err(|_| Error::InvalidArgument(format!("{what} must not be negative, got {count}")))
}

fn missing_scatter_input() -> Error {
    Error::LogicError("the root did not provide the send buffer and counts to scatter".into())
}

/// The root's code in an argument agreement when its arguments are usable.
const ROOT_READY: i32 = 0;
/// The root's code when it lacks the data it would scatter.
const ROOT_WITHOUT_INPUT: i32 = -1;

/// The root's code for a scatter of `available` elements: the block size
/// when no count was given, [`ROOT_READY`] once a given count fits, or
/// [`ROOT_WITHOUT_INPUT`].
fn scatter_supply(available: Option<usize>, count: Option<usize>, size: usize) -> Result<i32> {
    let Some(available) = available else {
        return Ok(ROOT_WITHOUT_INPUT);
    };
    match count {
        Some(n) => {
            let needed = n.saturating_mul(size);
            if available < needed {
                return Err(Error::SizeMismatch {
                    expected: needed,
                    actual: available,
                });
            }
            Ok(ROOT_READY)
        }
        None => count_of(available / size),
    }
}

/// Elements a variable-count buffer spans.
fn extent(counts: &[i32], displs: &[i32]) -> Result<usize> {
    counts.iter().zip(displs).try_fold(0usize, |end, (&count, &displ)| {
        let count = non_negative(count, "count")?;
        let displ = non_negative(displ, "displacement")?;
        Ok(end.max(displ + count))
    })
}

/// A receive buffer of `block` elements per rank.
fn block_buf_mut<T>(data: &mut [T], block: usize, datatype: RawDatatype) -> Result<RawBufMut> {
    Ok(RawBufMut {
        ptr: data.as_mut_ptr().cast(),
        count: count_of(block)?,
        datatype,
    })
}

fn null_buf(datatype: RawDatatype) -> RawBuf {
    RawBuf {
        ptr: std::ptr::null(),
        count: 0,
        datatype,
    }
}

fn null_buf_mut(datatype: RawDatatype) -> RawBufMut {
    RawBufMut {
        ptr: std::ptr::null_mut(),
        count: 0,
        datatype,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local;
    use crate::params::{
        alloc_container_of, alloc_new, op, op_with, ops, recv_buf, recv_count, recv_count_out,
        recv_counts, recv_counts_out, recv_displs_out, root, send_buf, send_counts,
        send_displs_out, send_recv_buf, send_recv_count, send_type, values_on_rank_0,
        Commutative, NonCommutative,
    };

    #[test]
    fn extent_covers_the_furthest_block() {
        assert_eq!(extent(&[2, 1, 3], &[0, 5, 2]).unwrap(), 6);
        assert_eq!(extent(&[], &[]).unwrap(), 0);
        assert!(extent(&[-1], &[0]).is_err());
    }

    #[test]
    fn bcast_with_explicit_count_skips_the_exchange() {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            let mut data = if world.rank() == 1 { vec![5u8, 6, 7, 8] } else { vec![0; 4] };
            world
                .bcast((send_recv_buf(&mut data), send_recv_count(2), root(1)))
                .unwrap();
            data
        });
        assert_eq!(out[0], vec![5, 6, 0, 0]);
        assert_eq!(out[1], vec![5, 6, 7, 8]);
    }

    #[test]
    fn bcast_fails_when_the_root_lacks_elements() {
        local::run(1, |mpi| {
            let world = mpi.world();
            let mut data = vec![1i32];
            let err = world
                .bcast((send_recv_buf(&mut data), send_recv_count(3)))
                .unwrap_err();
            assert!(matches!(err, Error::SizeMismatch { expected: 3, actual: 1 }));
        });
    }

    #[test]
    fn gather_into_caller_buffer_checks_its_size() {
        local::run(1, |mpi| {
            let world = mpi.world();
            let mine = [3i32, 4];
            let mut small = vec![0i32; 1];
            let err = world
                .gather((send_buf(&mine), recv_buf(&mut small)))
                .unwrap_err();
            assert!(matches!(err, Error::SizePolicyViolated { required: 2, actual: 1 }));

            let mut roomy = vec![0i32; 3];
            world.gather((send_buf(&mine), recv_buf(&mut roomy))).unwrap();
            assert_eq!(roomy, vec![3, 4, 0]);
        });
    }

    #[test]
    fn gather_rejects_differing_datatypes() {
        local::run(1, |mpi| {
            let world = mpi.world();
            let bytes = world.datatype::<u8>().unwrap();
            let err = world
                .gather((send_buf(&[1i32][..]), send_type(bytes)))
                .unwrap_err();
            assert!(matches!(err, Error::TypeMismatch(_)));
        });
    }

    #[test]
    fn gatherv_reports_counts_and_displacements() {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            let mine = vec![world.rank() as u16; world.rank() as usize + 1];
            let result = world
                .gatherv((send_buf(&mine), recv_counts_out(), recv_displs_out()))
                .unwrap();
            let (data, rest) = result.extract_recv_buffer();
            let (counts, rest) = rest.extract_recv_counts();
            let (displs, _) = rest.extract_recv_displs();
            (data, counts, displs)
        });
        assert_eq!(out[0].0, vec![0, 1, 1, 2, 2, 2]);
        assert_eq!(out[0].1, vec![1, 2, 3]);
        assert_eq!(out[0].2, vec![0, 1, 3]);
        assert!(out[1].0.is_empty() && out[1].1.is_empty());
    }

    #[test]
    fn scatter_broadcasts_the_block_size() {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            let all: Vec<i64> = (0..6).collect();
            if world.rank() == 0 {
                world.scatter(send_buf(&all)).unwrap().into_value()
            } else {
                world
                    .scatter((recv_buf(alloc_container_of::<i64>()), recv_count_out()))
                    .unwrap()
                    .extract_recv_buffer()
                    .0
            }
        });
        assert_eq!(out, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    }

    #[test]
    fn scatter_without_send_buffer_fails_everywhere() {
        let out = local::run(2, |mpi| {
            let world = mpi.world();
            world
                .scatter(recv_buf(alloc_container_of::<i32>()))
                .map(|r| r.into_value())
        });
        assert!(out
            .iter()
            .all(|r| matches!(r, Err(Error::LogicError(_)))));
    }

    #[test]
    fn scatter_with_given_count_on_every_rank() {
        local::run(2, |mpi| {
            let world = mpi.world();
            let all = [1u32, 2, 3, 4];
            let mut mine = [0u32; 2];
            if world.rank() == 0 {
                world
                    .scatter((send_buf(&all), recv_buf(&mut mine), recv_count(2)))
                    .unwrap();
                assert_eq!(mine, [1, 2]);
            } else {
                world.scatter((recv_buf(&mut mine), recv_count(2))).unwrap();
                assert_eq!(mine, [3, 4]);
            }
        });
    }

    #[test]
    fn scatterv_sends_each_rank_its_count() {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            if world.rank() == 2 {
                let all = [7i32, 8, 9];
                let counts = [0, 1, 2];
                let result = world
                    .scatterv((send_buf(&all), send_counts(&counts), send_displs_out(), root(2)))
                    .unwrap();
                let (mine, rest) = result.extract_recv_buffer();
                let (displs, _) = rest.extract_send_displs();
                assert_eq!(displs, vec![0, 0, 1]);
                mine
            } else {
                world
                    .scatterv((recv_buf(alloc_container_of::<i32>()), root(2)))
                    .unwrap()
                    .into_value()
            }
        });
        assert_eq!(out, vec![vec![], vec![7], vec![8, 9]]);
    }

    #[test]
    fn allgather_and_allgatherv() {
        local::run(3, |mpi| {
            let world = mpi.world();
            let mine = [world.rank() * 10];
            let all = world.allgather(send_buf(&mine)).unwrap().into_value();
            assert_eq!(all, vec![0, 10, 20]);

            let ragged = vec![world.rank(); world.rank() as usize];
            let result = world.allgatherv(send_buf(&ragged)).unwrap();
            assert_eq!(result.into_value(), vec![1, 2, 2]);

            let counts = [0, 1, 2];
            let result = world
                .allgatherv((send_buf(&ragged), recv_counts(&counts), recv_displs_out()))
                .unwrap();
            let (data, rest) = result.extract_recv_buffer();
            assert_eq!(data, vec![1, 2, 2]);
            assert_eq!(rest.extract_recv_displs().0, vec![0, 0, 1]);
        });
    }

    #[test]
    fn alltoall_transposes_blocks() {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            let r = world.rank();
            let send: Vec<i32> = (0..3).map(|peer| r * 10 + peer).collect();
            world.alltoall(send_buf(&send)).unwrap().into_value()
        });
        assert_eq!(out[0], vec![0, 10, 20]);
        assert_eq!(out[2], vec![2, 12, 22]);
    }

    #[test]
    fn alltoall_requires_equal_blocks() {
        local::run(2, |mpi| {
            let world = mpi.world();
            let err = world.alltoall(send_buf(&[1, 2, 3][..])).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        });
    }

    #[test]
    fn alltoallv_exchanges_counts_when_absent() {
        let out = local::run(2, |mpi| {
            let world = mpi.world();
            // Rank r sends r + 1 copies of its rank to each peer.
            let n = world.rank() as usize + 1;
            let send = vec![world.rank(); 2 * n];
            let counts = [n as i32, n as i32];
            let result = world
                .alltoallv((send_buf(&send), send_counts(&counts), recv_counts_out()))
                .unwrap();
            let (data, rest) = result.extract_recv_buffer();
            (data, rest.extract_recv_counts().0)
        });
        assert_eq!(out[0], (vec![0, 1, 1], vec![1, 2]));
        assert_eq!(out[1], (vec![0, 1, 1], vec![1, 2]));
    }

    #[test]
    fn reductions_with_builtin_and_user_operators() {
        local::run(4, |mpi| {
            let world = mpi.world();
            let mine = [world.rank() + 1];
            let total = world
                .allreduce((send_buf(&mine), op(ops::Plus)))
                .unwrap()
                .into_value();
            assert_eq!(total, vec![10]);

            let widest = world
                .allreduce((send_buf(&mine), op_with(|a: &i32, b: &i32| *a.max(b), Commutative)))
                .unwrap()
                .into_value();
            assert_eq!(widest, vec![4]);

            let mut value = [world.rank()];
            world
                .allreduce_inplace((send_recv_buf(&mut value[..]), op(ops::Max)))
                .unwrap();
            assert_eq!(value, [3]);
        });
    }

    #[test]
    fn non_commutative_reduce_keeps_rank_order() {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            let mine = [world.rank() as i64 + 1];
            let first = world
                .reduce((send_buf(&mine), op_with(|a: &i64, _: &i64| *a, NonCommutative)))
                .unwrap()
                .into_value();
            let last = world
                .reduce((send_buf(&mine), op_with(|_: &i64, b: &i64| *b, NonCommutative)))
                .unwrap()
                .into_value();
            (first, last)
        });
        assert_eq!(out[0], (vec![1], vec![3]));
        assert_eq!(out[1], (vec![], vec![]));
    }

    #[test]
    fn scan_and_exscan_prefixes() {
        local::run(4, |mpi| {
            let world = mpi.world();
            let mine = [world.rank() + 1];
            let inclusive = world
                .scan((send_buf(&mine), op(ops::Plus)))
                .unwrap()
                .into_value();
            let r = world.rank() + 1;
            assert_eq!(inclusive, vec![r * (r + 1) / 2]);

            let product = world
                .exscan((send_buf(&mine), op(ops::Multiplies)))
                .unwrap()
                .into_value();
            let expected: i32 = (1..r).product();
            assert_eq!(product, vec![expected]);

            let seeded = world
                .exscan((send_buf(&mine), op(ops::Plus), values_on_rank_0(&[-1][..])))
                .unwrap()
                .into_value();
            if world.rank() == 0 {
                assert_eq!(seeded, vec![-1]);
            }
        });
    }

    #[test]
    fn exscan_with_a_closure_leaves_rank_0_as_it_was() {
        local::run(2, |mpi| {
            let world = mpi.world();
            let mine = [5i32, 6];
            let mut out = vec![9i32, 9];
            world
                .exscan((
                    send_buf(&mine),
                    recv_buf(&mut out),
                    op_with(|a: &i32, b: &i32| a + b, Commutative),
                ))
                .unwrap();
            if world.rank() == 0 {
                assert_eq!(out, vec![9, 9]);
            } else {
                assert_eq!(out, vec![5, 6]);
            }
        });
    }

    #[test]
    fn library_buffers_resize_to_fit() {
        local::run(2, |mpi| {
            let world = mpi.world();
            let mine = [1.5f64, 2.5];
            let mut out = recv_buf(alloc_new::<Vec<f64>>());
            out.resize_if_requested(|| 10).unwrap();
            let sums = world
                .allreduce((send_buf(&mine), out, op(ops::Plus)))
                .unwrap()
                .into_value();
            assert_eq!(sums, vec![3.0, 5.0]);
        });
    }
}
