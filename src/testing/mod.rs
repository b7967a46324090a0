//! Testing utilities and mock implementations
//!
//! Lets the client be driven end to end without a network: scripted connect
//! outcomes, injected inbound lines and recorded outbound lines.

pub mod mocks;

pub use mocks::*;
