//! Staking module - proof-of-stake kernels anchored on service-node payments

mod kernel;
mod minter;
mod pointer;

pub use kernel::*;
pub use minter::*;
pub use pointer::*;
