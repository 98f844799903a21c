// mp-core: the pairing platform core.
//
// Four subsystems over one shared-store abstraction:
//
//   fleet       instance registration, heartbeats, load-aware admission
//   registry    user <-> socket map with cross-instance fan-out
//   queue       per-modality FIFO wait queues with atomic pair extraction
//   session     authoritative active-pair state and teardown
//
// plus the orchestration layers that tie them together:
//
//   engine      join -> match -> create session, skip/rematch/friend-call
//   relay       per-session WebRTC signaling and chat pass-through
//   supervisor  connection lifecycle, dispatch, rate limiting, cleanup
//
// Everything cluster-shared lives behind `store::SharedStore`; everything
// external (auth, user directory, reports, history, metrics) is an injected
// trait so the composition root and the tests choose the implementations.

pub mod clock;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use error::CoreError;
pub use supervisor::{ConnectedUser, Core, CoreDeps};
