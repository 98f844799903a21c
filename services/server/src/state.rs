use crate::collab::OpenDirectory;
use crate::metrics::SnapshotMetrics;
use mp_core::Core;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
    pub metrics: Arc<SnapshotMetrics>,
    /// Profile cache fed from auth claims; see `collab::OpenDirectory`.
    pub directory: Arc<OpenDirectory>,
}

impl AppState {
    pub fn new(
        core: Arc<Core>,
        metrics: Arc<SnapshotMetrics>,
        directory: Arc<OpenDirectory>,
    ) -> Self {
        Self {
            core,
            metrics,
            directory,
        }
    }
}
