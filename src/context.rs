use crate::config::Settings;
use crate::store::MetadataStore;
use std::sync::Arc;

/// Shared handles passed to every component at construction.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: MetadataStore,
}

impl AppContext {
    pub fn new(settings: Settings) -> Self {
        let store = MetadataStore::new(settings.metadata_path());
        Self {
            settings: Arc::new(settings),
            store,
        }
    }
}
