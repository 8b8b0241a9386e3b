//! Harness selection by id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::sdk::SdkHarness;
use super::server::ServerHarness;
use super::subprocess::CliHarness;
use super::Harness;

/// Harnesses available to the binary, keyed by [`Harness::id`], with one of
/// them selected.
pub struct HarnessRegistry {
    harnesses: HashMap<String, Arc<dyn Harness>>,
    selected: String,
}

impl HarnessRegistry {
    pub fn new(selected: impl Into<String>) -> Self {
        Self {
            harnesses: HashMap::new(),
            selected: selected.into(),
        }
    }

    /// The three built-in runtimes, each configured from its environment
    /// defaults. Construction performs no I/O.
    pub fn with_builtin(selected: impl Into<String>) -> Self {
        let mut registry = Self::new(selected);
        registry.register(Arc::new(SdkHarness::new()));
        registry.register(Arc::new(CliHarness::new()));
        registry.register(Arc::new(ServerHarness::new()));
        registry
    }

    pub fn register(&mut self, harness: Arc<dyn Harness>) {
        self.harnesses.insert(harness.id().to_string(), harness);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Harness>> {
        self.harnesses.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.harnesses.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// The selected harness. There is no fallback to another runtime.
    pub fn selected(&self) -> Result<Arc<dyn Harness>> {
        self.get(&self.selected).ok_or_else(|| {
            anyhow!(
                "Harness '{}' is not registered (available: {})",
                self.selected,
                self.ids().join(", ")
            )
        })
    }

    /// Shut down every registered harness.
    pub async fn shutdown_all(&self) {
        for harness in self.harnesses.values() {
            harness.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HARNESS_IDS;
    use crate::harness::{AgentConfig, HarnessSession};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        id: &'static str,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Harness for Counting {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        fn run(&self, _config: AgentConfig, _prompt: &str) -> Box<dyn HarnessSession> {
            unimplemented!("not exercised")
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn builtin_runtimes_match_the_configurable_ids() {
        let registry = HarnessRegistry::with_builtin("server");
        let mut expected = HARNESS_IDS.to_vec();
        expected.sort_unstable();
        assert_eq!(registry.ids(), expected);
        assert_eq!(registry.selected().unwrap().id(), "server");
    }

    #[test]
    fn unknown_selection_is_an_error() {
        let mut registry = HarnessRegistry::new("docker");
        registry.register(Arc::new(Counting {
            id: "cli",
            shutdowns: Arc::default(),
        }));
        let err = registry.selected().err().unwrap().to_string();
        assert!(err.contains("'docker'"));
        assert!(err.contains("available: cli"));
    }

    #[tokio::test]
    async fn shutdown_reaches_every_harness() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut registry = HarnessRegistry::new("sdk");
        for id in ["sdk", "cli"] {
            registry.register(Arc::new(Counting {
                id,
                shutdowns: Arc::clone(&shutdowns),
            }));
        }
        registry.shutdown_all().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    }
}
