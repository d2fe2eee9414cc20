//! Communicators.
//!
//! A [`Communicator`] is the entry point of every wrapped operation. The
//! operations themselves live next door: collectives in `collectives.rs`,
//! point-to-point transfers in `p2p.rs`. This file holds the communicator's
//! own state and the helpers they share.

use crate::datatype::MpiDatatype;
use crate::error::{Error, Result};
use crate::params::{Rank, Tag};
use crate::request::RequestPool;
use crate::select::{RootSlot, TypeSlot};
use crate::status::Status;
use crate::transport::{RawBuf, RawBufMut, RawComm, RawDatatype, Transport};
use crate::Context;
use std::cell::Cell;
use std::rc::Rc;

/// An MPI communicator.
///
/// Holds the environment alive. Operations take their arguments as named
/// parameters, see [`params`](crate::params).
///
/// # Example
///
/// ```
/// use mpiparams::local;
///
/// local::run(2, |mpi| {
///     let world = mpi.world();
///     println!("I am rank {} of {}", world.rank(), world.size());
/// });
/// ```
pub struct Communicator {
    ctx: Rc<Context>,
    raw: RawComm,
    rank: i32,
    size: i32,
    root: Cell<i32>,
    /// Freed on drop; the world communicator is not
    owned: bool,
}

impl Communicator {
    pub(crate) fn world(ctx: Rc<Context>) -> Self {
        let raw = ctx.transport().world();
        let (rank, size) = ctx.world_shape();
        Communicator {
            ctx,
            raw,
            rank,
            size,
            root: Cell::new(0),
            owned: false,
        }
    }

    fn from_raw(ctx: Rc<Context>, raw: RawComm, owned: bool) -> Result<Self> {
        let mut comm = Communicator {
            ctx,
            raw,
            rank: 0,
            size: 0,
            root: Cell::new(0),
            owned,
        };
        // On failure the drop of `comm` frees an owned handle
        comm.rank = comm.transport().comm_rank(raw)?;
        comm.size = comm.transport().comm_size(raw)?;
        Ok(comm)
    }

    /// Get the raw communicator handle (for advanced use).
    pub fn raw_handle(&self) -> RawComm {
        self.raw
    }

    /// Get the rank of the calling process in this communicator.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Get the number of processes in this communicator.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Duplicate this communicator (collective). The copy starts with the
    /// same default root.
    pub fn duplicate(&self) -> Result<Self> {
        let raw = self.transport().comm_dup(self.raw)?;
        let dup = Self::from_raw(Rc::clone(&self.ctx), raw, true)?;
        dup.root.set(self.root.get());
        Ok(dup)
    }

    /// The root rooted collectives use when no `root` parameter is given.
    pub fn root(&self) -> i32 {
        self.root.get()
    }

    /// Change the default root.
    pub fn set_root(&self, root: i32) -> Result<()> {
        if !self.is_valid_rank(root) {
            return Err(Error::InvalidArgument(format!(
                "root {root} is not a rank of a communicator of size {}",
                self.size
            )));
        }
        self.root.set(root);
        Ok(())
    }

    /// True if this process is the default root.
    pub fn is_root(&self) -> bool {
        self.rank == self.root.get()
    }

    /// True if `rank` names a process of this communicator.
    pub fn is_valid_rank(&self, rank: i32) -> bool {
        (0..self.size).contains(&rank)
    }

    /// Largest valid message tag.
    pub fn tag_upper_bound(&self) -> i32 {
        self.transport().tag_upper_bound()
    }

    /// The datatype handle registered for `T`, for the explicit `*_type`
    /// parameters.
    pub fn datatype<T: MpiDatatype>(&self) -> Result<RawDatatype> {
        self.ctx.datatype::<T>()
    }

    /// Number of `T` elements a status describes, using the size the
    /// transport reports for `T`'s datatype.
    pub fn element_count<T: MpiDatatype>(&self, status: &Status) -> Result<usize> {
        let size = self.transport().type_size(self.datatype::<T>()?)?;
        Ok(if size == 0 { 0 } else { status.bytes / size })
    }

    /// A new, empty request pool.
    ///
    /// Buffers handed to operations issued into the pool must outlive it.
    pub fn request_pool<'buf>(&self) -> RequestPool<'buf> {
        RequestPool::new(Rc::clone(&self.ctx))
    }

    /// Barrier synchronization.
    ///
    /// All processes in the communicator must call this function. No process
    /// will return until all processes have entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.issue("barrier").barrier(self.raw)
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    pub(crate) fn context(&self) -> Rc<Context> {
        Rc::clone(&self.ctx)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.ctx.transport()
    }

    /// The transport, for one primitive call.
    pub(crate) fn issue(&self, call: &'static str) -> &dyn Transport {
        tracing::trace!(call, comm = self.raw.0, rank = self.rank, "primitive call");
        self.transport()
    }

    /// The root a call uses.
    pub(crate) fn resolve_root(&self, slot: &impl RootSlot) -> Result<i32> {
        let root = slot.root().unwrap_or(self.root.get());
        if !self.is_valid_rank(root) {
            return Err(Error::InvalidArgument(format!(
                "root {root} is not a rank of a communicator of size {}",
                self.size
            )));
        }
        Ok(root)
    }

    /// The explicit datatype of a slot, or the one registered for `T`.
    pub(crate) fn element_type<T: MpiDatatype>(&self, slot: &impl TypeSlot) -> Result<RawDatatype> {
        match slot.datatype() {
            Some(datatype) => Ok(datatype),
            None => self.datatype::<T>(),
        }
    }

    /// Fail unless the send and receive datatypes are the same handle.
    pub(crate) fn check_same_type(
        &self,
        operation: &str,
        send: RawDatatype,
        recv: RawDatatype,
    ) -> Result<()> {
        if send != recv {
            return Err(Error::TypeMismatch(format!(
                "{operation}: send datatype {} differs from receive datatype {}",
                send.0, recv.0
            )));
        }
        Ok(())
    }

    /// Translate a destination or source.
    pub(crate) fn peer(&self, rank: Rank, allow_any: bool) -> Result<i32> {
        let sentinels = self.transport().sentinels();
        match rank {
            Rank::Value(r) if self.is_valid_rank(r) => Ok(r),
            Rank::Value(r) => Err(Error::InvalidArgument(format!(
                "rank {r} is not a rank of a communicator of size {}",
                self.size
            ))),
            Rank::Null => Ok(sentinels.proc_null),
            Rank::Any if allow_any => Ok(sentinels.any_source),
            Rank::Any => Err(Error::InvalidArgument(
                "any-source is only valid for receives and probes".into(),
            )),
        }
    }

    /// Translate a tag.
    pub(crate) fn message_tag(&self, tag: Tag, allow_any: bool) -> Result<i32> {
        match tag {
            Tag::Value(t) if (0..=self.tag_upper_bound()).contains(&t) => Ok(t),
            Tag::Value(t) => Err(Error::InvalidArgument(format!(
                "tag {t} is outside 0..={}",
                self.tag_upper_bound()
            ))),
            Tag::Any if allow_any => Ok(self.transport().sentinels().any_tag),
            Tag::Any => Err(Error::InvalidArgument(
                "any-tag is only valid for receives and probes".into(),
            )),
        }
    }
}

/// A count that fits the transport's `int`.
pub(crate) fn count_of(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        Error::InvalidArgument(format!("{len} elements exceed the largest transferable count"))
    })
}

/// Send-side description of `data`.
pub(crate) fn raw_buf<T>(data: &[T], datatype: RawDatatype) -> Result<RawBuf> {
    Ok(RawBuf {
        ptr: data.as_ptr().cast(),
        count: count_of(data.len())?,
        datatype,
    })
}

/// Receive-side description of `data`.
pub(crate) fn raw_buf_mut<T>(data: &mut [T], datatype: RawDatatype) -> Result<RawBufMut> {
    Ok(RawBufMut {
        ptr: data.as_mut_ptr().cast(),
        count: count_of(data.len())?,
        datatype,
    })
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if self.owned {
            if let Err(err) = self.transport().comm_free(self.raw) {
                tracing::warn!(comm = self.raw.0, %err, "failed to free communicator");
            }
        }
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("handle", &self.raw.0)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("root", &self.root.get())
            .finish()
    }
}

// Communicators are not Send or Sync: they share the environment through an
// Rc, and MPI communicators have thread-safety requirements of their own.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local;

    #[test]
    fn default_root_is_validated() {
        local::run(3, |mpi| {
            let world = mpi.world();
            assert_eq!(world.root(), 0);
            world.set_root(2).unwrap();
            assert!(world.is_root() == (world.rank() == 2));
            assert!(matches!(world.set_root(3), Err(Error::InvalidArgument(_))));
            assert_eq!(world.root(), 2);
        });
    }

    #[test]
    fn duplicates_keep_size_and_root() {
        let roots = local::run(2, |mpi| {
            let world = mpi.world();
            world.set_root(1).unwrap();
            let dup = world.duplicate().unwrap();
            assert_ne!(dup.raw_handle(), world.raw_handle());
            assert_eq!((dup.rank(), dup.size()), (world.rank(), world.size()));
            dup.barrier().unwrap();
            dup.root()
        });
        assert_eq!(roots, vec![1, 1]);
    }

    #[test]
    fn unknown_handles_fail_instead_of_guessing_a_shape() {
        let mpi = crate::Mpi::with_transport(crate::transport::local::LocalTransport::single()).unwrap();
        let err = Communicator::from_raw(Rc::clone(&mpi.ctx), RawComm(4242), false).unwrap_err();
        assert_eq!(err.class(), Some(crate::MpiErrorClass::Comm));

        let world = mpi.world();
        assert_eq!((world.rank(), world.size()), (0, 1));
    }

    #[test]
    fn ranks_and_tags_translate_to_sentinels() {
        local::run(2, |mpi| {
            let world = mpi.world();
            let sentinels = world.transport().sentinels();
            assert_eq!(world.peer(Rank::Value(1), false).unwrap(), 1);
            assert_eq!(world.peer(Rank::Null, false).unwrap(), sentinels.proc_null);
            assert_eq!(world.peer(Rank::Any, true).unwrap(), sentinels.any_source);
            assert!(world.peer(Rank::Any, false).is_err());
            assert!(world.peer(Rank::Value(2), true).is_err());
            assert_eq!(world.message_tag(Tag::Any, true).unwrap(), sentinels.any_tag);
            assert!(world.message_tag(Tag::Value(-3), true).is_err());
            let too_large = world.tag_upper_bound() + 1;
            assert!(world.message_tag(Tag::Value(too_large), false).is_err());
        });
    }

    #[test]
    fn element_count_uses_the_registered_size() {
        local::run(1, |mpi| {
            let world = mpi.world();
            let status = Status {
                source: 0,
                tag: 0,
                bytes: 32,
            };
            assert_eq!(world.element_count::<u64>(&status).unwrap(), 4);
            assert_eq!(world.element_count::<u8>(&status).unwrap(), 32);
        });
    }
}
