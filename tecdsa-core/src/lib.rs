//! Core of the t-ECDSA keep operator node.
//!
//! A keep is an on-chain entity backed by one off-chain threshold-signing
//! group. This crate contains everything between the chain facade and the
//! cryptographic party machines: the keep lifecycle manager, the TSS session
//! engine, the network bridge, the block counter, and the in-process chain
//! and network implementations used by local runs and tests.

pub mod application;
pub mod domain;
pub mod foundation;
pub mod infrastructure;
pub mod protocol;
