//! Bucket visiting crate.
//!
//! This crate implements the coordinator side of HoloStore's visit protocol:
//! a client names a super-shard plus a progress cursor, and the coordinator
//! expands it into the shards it currently owns, fans scoped visit commands out
//! to replicas, and folds their replies into one resumable reply. The storage,
//! membership, and wire layers are supplied by the caller through the traits
//! in `visit`.

pub mod config;
pub mod visit;

pub use config::VisitorConfig;
