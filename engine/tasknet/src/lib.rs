//! Federated hierarchical task runtime.
//!
//! A task tree combines five kinds of node: `Simple` (a unit of work on a
//! named queue of a named peer), `Sequential` (children run left to right),
//! `Parallel` (children run independently), `Synchronized` (a barrier that
//! releases only when every child succeeded) and `External` (a persisted
//! wait for an operator decision). Trees are persisted so a restarted node
//! recovers its in-flight work, and cross node boundaries as HTTPS POSTs
//! authenticated by pinned certificates.

pub mod api;
pub mod engine;
pub mod error;
pub mod handler;
pub mod store;
pub mod store_postgres;
pub mod task;
pub mod transport;

pub use engine::{NodeIdentity, TaskEngine};
pub use error::TaskError;
pub use handler::{ActionHandler, HandlerRegistry, TaskContext};
pub use store::{MemoryTaskStore, TaskStore};
pub use store_postgres::PgTaskStore;
pub use task::{
	ExternalSpec, ParallelSpec, Receiver, SequentialSpec, SimpleSpec, SynchronizedSpec,
	TaskEnvelope, TaskId, TaskKind, TaskRecord, TaskSpec, TaskStatus, UpdateEnvelope,
};
pub use transport::{certs_differ, TlsMaterial, Transport};
