// ABOUTME: In-memory map from run identifier to internal URL, consulted by the reverse proxy
// ABOUTME: Many concurrent readers, writes only from lifecycle transitions into and out of ready

use std::collections::HashMap;
use std::sync::RwLock;

/// Registry of runs currently exposed through the preview proxy. Presence
/// reflects reachability, not ownership.
#[derive(Default)]
pub struct GatewayRegistry {
    entries: RwLock<HashMap<String, String>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str, url: &str) {
        let mut entries = self.entries.write().expect("gateway registry poisoned");
        entries.insert(run_id.to_string(), url.to_string());
    }

    pub fn unregister(&self, run_id: &str) {
        let mut entries = self.entries.write().expect("gateway registry poisoned");
        entries.remove(run_id);
    }

    pub fn resolve(&self, run_id: &str) -> Option<String> {
        let entries = self.entries.read().expect("gateway registry poisoned");
        entries.get(run_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("gateway registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_unregister_roundtrip() {
        let registry = GatewayRegistry::new();
        registry.register("run1", "http://localhost:3001");
        assert_eq!(
            registry.resolve("run1"),
            Some("http://localhost:3001".to_string())
        );
        assert_eq!(registry.len(), 1);

        registry.unregister("run1");
        assert_eq!(registry.resolve("run1"), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_missing_is_noop() {
        let registry = GatewayRegistry::new();
        registry.unregister("ghost");
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_reregister_overwrites() {
        let registry = GatewayRegistry::new();
        registry.register("run1", "http://localhost:3001");
        registry.register("run1", "http://localhost:3002");
        assert_eq!(
            registry.resolve("run1"),
            Some("http://localhost:3002".to_string())
        );
        assert_eq!(registry.len(), 1);
    }
}
