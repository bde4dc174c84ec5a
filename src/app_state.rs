use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{editor::InferenceHandle, inbox::InboxWatcher, publisher::ArtifactPublisher};
use crate::store::JobStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<JobStore>,
    pub inbox: Arc<InboxWatcher>,
    pub publisher: Arc<ArtifactPublisher>,
    pub inference: Arc<InferenceHandle>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<JobStore>,
        inbox: Arc<InboxWatcher>,
        publisher: Arc<ArtifactPublisher>,
        inference: Arc<InferenceHandle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            inbox,
            publisher,
            inference,
        }
    }
}
