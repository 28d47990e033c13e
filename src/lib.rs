// File: lib.rs
//
// The purpose of this file is to expose the crate's modules as a library
// so integration tests can drive a multi-node ring without going through
// the CLI binary.

pub mod channel;
pub mod error;
pub mod hash;
pub mod msg;
pub mod node;
pub mod ring;
pub mod storage;
