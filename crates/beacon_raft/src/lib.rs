//! Raft consensus crate.
//!
//! This crate provides the single-group Raft implementation used by
//! beacon_store. The API surface is intentionally small: higher layers supply
//! a `StateMachine` and a `Transport`, then drive writes through
//! `RaftNode::propose` and reads through `RaftNode::read_barrier`.

pub mod raft;
