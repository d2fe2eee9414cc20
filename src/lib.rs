//! # mpiparams
//!
//! Type-safe, named-parameter MPI operations.
//!
//! Every operation is a method on a [`Communicator`] taking a tuple of named
//! parameters in any order. Parameters the caller leaves out are defaulted
//! (roots, tags, counts) or allocated by the library (receive buffers), and
//! whatever the library allocated comes back in the result:
//!
//! - unknown, duplicated or missing parameters are compile errors,
//! - output buffers carry a resize policy checked before the transfer,
//! - reductions pick the stock MPI operator for builtin functors and wrap
//!   closures in a scoped user operator otherwise,
//! - nonblocking operations keep their buffers alive until completion.
//!
//! ## Quick Start
//!
//! ```
//! use mpiparams::local;
//! use mpiparams::params::{op, ops, root, send_buf, send_recv_buf};
//!
//! let sums = local::run(4, |mpi| {
//!     let world = mpi.world();
//!
//!     // Broadcast from the communicator's default root (rank 0).
//!     let mut value = if world.rank() == 0 { 42 } else { 0 };
//!     world.bcast(send_recv_buf(&mut value)).unwrap();
//!     assert_eq!(value, 42);
//!
//!     // Reduce at rank 1 into a library-allocated buffer.
//!     let mine = [world.rank(), 1];
//!     world
//!         .reduce((send_buf(&mine), op(ops::Plus), root(1)))
//!         .unwrap()
//!         .into_value()
//! });
//! assert_eq!(sums[1], vec![6, 4]);
//! assert!(sums[0].is_empty());
//! ```
//!
//! With the `mpi` feature, [`Mpi::init`] binds to the system MPI library and
//! the program runs under `mpiexec`. Without it, [`local::run`] runs ranks as
//! threads of one process.
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `mpi` | Bind to a system MPI library through the C shim | MPI headers and library |
//! | `serialization` (default) | Send `serde` values as byte buffers | `serde`, `rmp-serde`, `serde_json` |

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]
#![allow(clippy::type_complexity)]

pub mod buffer;
mod collectives;
mod comm;
mod datatype;
mod error;
#[cfg(feature = "mpi")]
mod ffi;
pub mod operation;
mod p2p;
pub mod params;
pub mod request;
pub mod result;
pub mod roles;
pub mod select;
#[cfg(feature = "serialization")]
pub mod serialization;
mod status;
pub mod transport;

pub use comm::Communicator;
pub use datatype::{BuiltinType, Complex, DatatypeKind, DatatypeRegistry, MpiDatatype, StructLayout, TypeCategory};
pub use error::{Error, MpiErrorClass, Result};
pub use request::{PooledRequest, Request, RequestPool};
pub use result::{MpiResult, NonBlockingResult};
pub use status::Status;
pub use transport::local;

use std::rc::Rc;
use transport::{RawDatatype, Transport};

/// MPI thread support levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but MPI calls only from main thread
    Funneled = 1,
    /// Multi-threaded, but MPI calls serialized by user
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

impl ThreadLevel {
    /// The level matching an `MPI_THREAD_*` value; unknown values read as
    /// `Multiple`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ThreadLevel::Single,
            1 => ThreadLevel::Funneled,
            2 => ThreadLevel::Serialized,
            _ => ThreadLevel::Multiple,
        }
    }
}

/// Everything the communicators of one environment share: the transport, the
/// datatypes registered on it and the shape of the world communicator.
pub(crate) struct Context {
    transport: Box<dyn Transport>,
    registry: DatatypeRegistry,
    world_rank: i32,
    world_size: i32,
}

impl Context {
    fn new(transport: Box<dyn Transport>) -> Result<Self> {
        // Dropping a half-built context still finalizes the transport
        let mut ctx = Context {
            transport,
            registry: DatatypeRegistry::new(),
            world_rank: 0,
            world_size: 0,
        };
        let world = ctx.transport.world();
        ctx.world_rank = ctx.transport.comm_rank(world)?;
        ctx.world_size = ctx.transport.comm_size(world)?;
        Ok(ctx)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Rank and size of this process in the world communicator.
    pub(crate) fn world_shape(&self) -> (i32, i32) {
        (self.world_rank, self.world_size)
    }

    pub(crate) fn datatype<T: MpiDatatype>(&self) -> Result<RawDatatype> {
        self.registry.datatype::<T>(self.transport())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.registry.free_all(self.transport());
        if let Err(err) = self.transport.finalize() {
            tracing::warn!(transport = self.transport.name(), %err, "finalize failed");
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("transport", &self.transport.name())
            .field("derived_types", &self.registry.len())
            .finish()
    }
}

/// Environment handle.
///
/// Owns the transport. Communicators and requests keep the environment alive;
/// once the last of them is gone, derived datatypes are freed and the
/// transport is finalized.
///
/// # Example
///
/// ```no_run
/// # #[cfg(feature = "mpi")]
/// # fn main() -> mpiparams::Result<()> {
/// use mpiparams::Mpi;
///
/// let mpi = Mpi::init()?;
/// let world = mpi.world();
/// println!("Running on {} processes", world.size());
/// # Ok(())
/// # }
/// # #[cfg(not(feature = "mpi"))]
/// # fn main() {}
/// ```
pub struct Mpi {
    ctx: Rc<Context>,
    thread_level: ThreadLevel,
}

impl Mpi {
    /// Initialize MPI with single-threaded support.
    ///
    /// # Errors
    ///
    /// Returns an error if MPI is already initialized or if initialization fails.
    #[cfg(feature = "mpi")]
    pub fn init() -> Result<Self> {
        Self::init_thread(ThreadLevel::Single)
    }

    /// Initialize MPI with the specified thread support level.
    ///
    /// The level actually provided is available from
    /// [`thread_level()`](Self::thread_level).
    ///
    /// # Errors
    ///
    /// Returns an error if MPI is already initialized or if initialization fails.
    #[cfg(feature = "mpi")]
    pub fn init_thread(required: ThreadLevel) -> Result<Self> {
        let (transport, provided) = transport::mpi::MpiTransport::init_thread(required)?;
        Ok(Mpi {
            ctx: Rc::new(Context::new(Box::new(transport))?),
            thread_level: provided,
        })
    }

    /// An environment over an arbitrary transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot report this process's rank
    /// or the size of the world communicator.
    pub fn with_transport<T: Transport + 'static>(transport: T) -> Result<Self> {
        tracing::debug!(transport = transport.name(), "environment created");
        Ok(Mpi {
            ctx: Rc::new(Context::new(Box::new(transport))?),
            thread_level: ThreadLevel::Single,
        })
    }

    /// Get the thread support level that was provided.
    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    /// Get a handle to `MPI_COMM_WORLD`.
    pub fn world(&self) -> Communicator {
        Communicator::world(Rc::clone(&self.ctx))
    }

    /// The transport this environment runs on.
    pub fn transport(&self) -> &dyn Transport {
        self.ctx.transport()
    }

    /// Get the current wall-clock time.
    pub fn wtime(&self) -> f64 {
        self.ctx.transport().wtime()
    }

    /// Get the library version string.
    pub fn version(&self) -> Result<String> {
        self.ctx.transport().version()
    }
}

impl std::fmt::Debug for Mpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpi")
            .field("transport", &self.ctx.transport().name())
            .field("thread_level", &self.thread_level)
            .finish()
    }
}

// Mpi is not Send or Sync: the Rc it holds ties it to the thread that created
// it, as MPI requires below ThreadLevel::Multiple.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;

    #[test]
    fn thread_levels_are_ordered() {
        assert!(ThreadLevel::Single < ThreadLevel::Multiple);
        assert_eq!(ThreadLevel::from_raw(2), ThreadLevel::Serialized);
        assert_eq!(ThreadLevel::from_raw(99), ThreadLevel::Multiple);
    }

    #[test]
    fn local_environment_reports_its_transport() {
        let mpi = Mpi::with_transport(LocalTransport::single()).unwrap();
        assert_eq!(mpi.transport().name(), "local");
        assert!(mpi.version().unwrap().contains("local"));
        assert!(mpi.wtime() >= 0.0);
        assert_eq!(mpi.world().size(), 1);
    }

    #[test]
    fn derived_types_are_cached_per_environment() {
        #[allow(dead_code)]
        #[derive(Clone, Copy)]
        struct Pair {
            a: i32,
            b: f64,
        }
        crate::impl_struct_datatype!(Pair { a: i32, b: f64 });

        let mpi = Mpi::with_transport(LocalTransport::single()).unwrap();
        let ctx = Rc::clone(&mpi.ctx);
        let first = ctx.datatype::<Pair>().unwrap();
        assert_eq!(ctx.datatype::<Pair>().unwrap(), first);
        assert_eq!(ctx.registry.len(), 1);
    }
}
