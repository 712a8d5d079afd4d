//! P2P module - gossip of service-node announcements and pings

mod gossip;
mod outbound;
mod peer;
mod protocol;
mod sync;
mod transport;

pub use gossip::*;
pub use outbound::*;
pub use peer::*;
pub use protocol::*;
pub use sync::*;
pub use transport::*;
