//! Consensus module - network parameters, compact targets and difficulty
//! retargeting

mod difficulty;
mod params;
mod target;

pub use difficulty::*;
pub use params::*;
pub use target::*;
