use std::sync::Arc;

use trendpulse_llm::LlmProvider;
use trendpulse_store::Store;
use trendpulse_vector::VectorIndex;

/// Everything a stage run talks to. Chat and embedding go through separate
/// providers because deployments usually split them across endpoints and
/// models; both are often the same concrete client type.
pub struct Services {
    pub store: Store,
    pub vector: VectorIndex,
    pub chat: Arc<dyn LlmProvider>,
    pub embedder: Arc<dyn LlmProvider>,
}

impl Services {
    pub fn new(
        store: Store,
        vector: VectorIndex,
        chat: Arc<dyn LlmProvider>,
        embedder: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            store,
            vector,
            chat,
            embedder,
        }
    }
}
