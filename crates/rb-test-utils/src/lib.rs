// rb-test-utils: shared test doubles for the relaybus suites.
//
// Provides a scripted mock bus server (for exercising client behavior
// against misbehaving peers) and a raw frame-level link (for exercising the
// real server without the client library in the way).

pub mod mock_bus_server;
pub mod test_link;

pub use mock_bus_server::{JoinReply, MockBusOptions, MockBusServer};
pub use test_link::TestLink;
