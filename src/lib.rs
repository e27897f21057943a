//! tenax is a fault-tolerant allreduce/broadcast engine for data-parallel
//! training workers.
//!
//! A fixed set of ranks cooperates over point-to-point TCP links to run
//! sequence-numbered collectives. Before every step the cluster reduces a
//! small action summary to agree on what happens next; when a rank
//! crashes and rejoins, the survivors replay whatever it is missing
//! (recent results from a sparsely replicated in-memory buffer, or the
//! latest checkpoint blob) and the job continues without restarting.

pub(crate) mod collective;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub(crate) mod protocol;
pub(crate) mod reduce;
pub(crate) mod transport;
pub mod types;

pub use cluster::{bootstrap_local, SeedHandle, SeedNode};
pub use collective::ReduceFunction;
pub use config::EngineConfig;
pub use engine::{Checkpointable, TenaxEngine};
pub use error::{Result, TenaxError};
pub use types::{DataType, Rank, ReduceOp};
