//! relaydm test harness
//!
//! In-process relays that speak the relay frame protocol, for deterministic
//! tests of connections, the pool, the offline queue and the DM controller
//! without network access.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod network;
pub mod node;
pub mod relay;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use network::MockRelayNetwork;
pub use node::TestNode;
pub use relay::{AckMode, MockRelay};
