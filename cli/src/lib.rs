//! Support code for the `rsp-train` binary.

pub mod backend;
