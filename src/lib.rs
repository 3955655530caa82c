//! Passive-target RMA synchronization.
//!
//! A process exposes windows of memory; other processes lock a window at a target rank
//! (shared or exclusive), issue put, get, accumulate and atomic operations against it,
//! then flush or unlock. Lock requests are lazy and ride on the first operation when
//! they can; targets queue requests they cannot grant, with a bounded payload budget.
//!
//! The engine is single-threaded per process and progresses only when called. Processes
//! talk through a [`Transport`]; [`loopback_fabric`] connects in-process ranks.

mod macros;

pub mod accumulate;
pub mod config;
pub mod datatype;
pub mod error;
pub mod lockqueue;
pub mod op;
pub mod packet;
mod passive;
pub mod region;
pub mod target;
pub mod transport;
pub mod utils;
pub mod window;

pub use accumulate::{do_accumulate_op, OpHandle, ReduceOp};
pub use config::{ProgressMode, RmaConfig};
pub use datatype::{BasicType, Datatype, DerivedType, Element};
pub use error::{Result, RmaError};
pub use op::{OriginData, OriginResult, RmaCall, RmaRequest};
pub use packet::{LockMode, WinHandle};
pub use passive::RmaProcess;
pub use region::{MemRegion, ResultBuffer};
pub use target::{LockAssert, TargetAccessState};
pub use transport::{loopback_fabric, loopback_fabric_with, LoopbackOptions, Transport};
pub use window::{LocalLock, WinAccessState};

/// Index of a process within the window group.
pub type Rank = usize;
