use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::BarSource;
use crate::provider::ProviderId;

/// Explicit provider lookup table built at composition time.
///
/// Registration happens where the application wires itself together and the
/// registry is passed by reference to whatever needs it; there is no
/// module-global state and no import-order sensitivity.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    sources: BTreeMap<ProviderId, Arc<dyn BarSource>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its own id, replacing any previous entry.
    pub fn register(&mut self, source: Arc<dyn BarSource>) {
        self.sources.insert(source.id(), source);
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn BarSource>> {
        self.sources.get(&id).cloned()
    }

    pub fn contains(&self, id: ProviderId) -> bool {
        self.sources.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.sources.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
