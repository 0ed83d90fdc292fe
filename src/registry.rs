//! Module registry held by a [`Connection`](crate::Connection).
//!
//! Maps bus module ids to the shared state of the module instances created
//! against the connection. Population happens when a module is constructed;
//! the dispatch path looks modules up here for every decoded line.

use crate::error::{CtlabError, CtlabResult};
use crate::module::ModuleCore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Module id to module state, unique keys.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<u8, Arc<ModuleCore>>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, core: Arc<ModuleCore>) -> CtlabResult<()> {
        let mut modules = self.modules.write();
        let id = core.id();
        if modules.contains_key(&id) {
            return Err(CtlabError::DuplicateModule(id));
        }
        modules.insert(id, core);
        Ok(())
    }

    pub(crate) fn get(&self, id: u8) -> Option<Arc<ModuleCore>> {
        self.modules.read().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: u8) -> bool {
        self.modules.write().remove(&id).is_some()
    }

    /// Whether a module with this id is registered.
    pub fn contains(&self, id: u8) -> bool {
        self.modules.read().contains_key(&id)
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.modules.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Whether no module is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::GenericDecoder;

    fn core(id: u8) -> Arc<ModuleCore> {
        Arc::new(ModuleCore::new(id, Arc::new(GenericDecoder), &[]))
    }

    #[test]
    fn rejects_duplicate_ids() {
        let registry = ModuleRegistry::new();
        registry.register(core(3)).unwrap();
        assert!(matches!(
            registry.register(core(3)),
            Err(CtlabError::DuplicateModule(3))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lists_ids_sorted_and_removes() {
        let registry = ModuleRegistry::new();
        for id in [7, 1, 4] {
            registry.register(core(id)).unwrap();
        }
        assert_eq!(registry.ids(), vec![1, 4, 7]);

        assert!(registry.remove(4));
        assert!(!registry.remove(4));
        assert!(!registry.contains(4));
        assert!(registry.get(1).is_some());
    }
}
