//! JSON-RPC API Module
//!
//! HTTP interface for operators to query the service-node lists.

mod methods;
mod server;

pub use methods::*;
pub use server::*;
