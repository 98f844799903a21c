// mp-test-utils: shared test utilities for the pairing platform.
//
// A WebSocket client speaking the wire protocol, in-memory collaborator
// mocks, and a fault-injecting store wrapper.

pub mod collab;
pub mod store;
pub mod ws_client;

pub use collab::{MockAuth, RecordingHistory, RecordingReports};
pub use store::FlakyStore;
pub use ws_client::TestWsClient;
