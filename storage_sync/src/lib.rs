//! Storage synchronization between a source contract and its copy on
//! another chain: which slots differ, and the proof blob that ports them.

pub mod diff;
pub mod env;
pub mod migration;
pub mod provider;
pub mod rpc;
pub mod tracing;
