//! Runtime wiring for the t-ECDSA keep operator.

pub mod runner;
