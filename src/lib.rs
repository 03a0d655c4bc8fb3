//! # quarry
//!
//! Persistent, priority-ordered work queue with a concurrency-aware
//! scheduling agent.
//!
//! Producers push opaque payloads (optionally deduplicated by a unique
//! address, optionally batched into groups); agents claim them with
//! at-most-one-claim semantics over a transactional store, run them
//! through registered runners, and heartbeat a lease until completion.
//! Blocked callers wake on notifications rather than polling, and running
//! jobs can safely re-enter the queue through a recursion-scoped region.

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod fanout;
pub mod group;
pub mod model;
pub mod notify;
pub mod queue;
pub mod runner;
pub mod store;
pub mod tasks;
pub mod telemetry;

mod sync;
