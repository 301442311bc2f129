use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::workflow::{Target, Workflow};

/// Key of the sentinel workflow substituted for removed definitions.
pub const REMOVED_WORKFLOW_KEY: &str = "removed_workflow";

type WorkflowFactory = Arc<dyn Fn() -> Workflow + Send + Sync>;

enum Entry {
    Built(Arc<Workflow>),
    Lazy(WorkflowFactory),
}

/// Immutable mapping from workflow key to workflow definition.
///
/// Definitions may be registered eagerly or lazily; a lazy entry is built
/// on first lookup and cached. Unknown keys resolve to the
/// `removed_workflow` sentinel so historical runs stay inspectable, but
/// starting or resuming a sentinel workflow is refused by the engine.
pub struct WorkflowRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    removed: Arc<Workflow>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            removed: Arc::new(removed_workflow()),
        }
    }

    /// Register a workflow definition under its own name.
    pub fn register(&self, workflow: Workflow) {
        let key = workflow.name.clone();
        self.entries
            .write()
            .expect("workflow registry poisoned")
            .insert(key, Entry::Built(Arc::new(workflow)));
    }

    /// Register a deferred workflow constructor, built at most once on
    /// first lookup.
    pub fn register_lazy(
        &self,
        key: impl Into<String>,
        factory: impl Fn() -> Workflow + Send + Sync + 'static,
    ) {
        self.entries
            .write()
            .expect("workflow registry poisoned")
            .insert(key.into(), Entry::Lazy(Arc::new(factory)));
    }

    /// Look up a workflow by key.
    pub fn get(&self, key: &str) -> Option<Arc<Workflow>> {
        {
            let entries = self.entries.read().expect("workflow registry poisoned");
            match entries.get(key) {
                Some(Entry::Built(wf)) => return Some(wf.clone()),
                Some(Entry::Lazy(_)) => {}
                None => return None,
            }
        }

        // Build the lazy entry outside the read lock, then cache it.
        let mut entries = self.entries.write().expect("workflow registry poisoned");
        match entries.get(key) {
            Some(Entry::Built(wf)) => Some(wf.clone()),
            Some(Entry::Lazy(factory)) => {
                let wf = Arc::new(factory());
                tracing::debug!(workflow = %wf.name, "Built lazily registered workflow");
                entries.insert(key.to_string(), Entry::Built(wf.clone()));
                Some(wf)
            }
            None => None,
        }
    }

    /// Look up a workflow, substituting the removed-workflow sentinel for
    /// unknown keys.
    pub fn get_or_removed(&self, key: &str) -> Arc<Workflow> {
        self.get(key).unwrap_or_else(|| self.removed.clone())
    }

    /// Registered workflow keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("workflow registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether the given workflow is the removed-workflow sentinel.
    pub fn is_removed(workflow: &Workflow) -> bool {
        workflow.name == REMOVED_WORKFLOW_KEY && workflow.steps.is_empty()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentinel standing in for workflows that were removed from the codebase
/// while persisted runs still reference them.
fn removed_workflow() -> Workflow {
    Workflow::new(REMOVED_WORKFLOW_KEY, Target::System)
        .description("Placeholder for workflows that have been removed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use crate::workflow::Step;

    fn sample_workflow(name: &str) -> Workflow {
        Workflow::new(name, Target::Create).step(Step::new("noop", Signal::Success))
    }

    #[test]
    fn test_register_and_get() {
        let registry = WorkflowRegistry::new();
        registry.register(sample_workflow("create_thing"));

        let wf = registry.get("create_thing").unwrap();
        assert_eq!(wf.name, "create_thing");
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_lazy_registration_builds_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = WorkflowRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        registry.register_lazy("lazy_wf", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            sample_workflow("lazy_wf")
        });

        assert_eq!(built.load(Ordering::SeqCst), 0);
        let first = registry.get("lazy_wf").unwrap();
        let second = registry.get("lazy_wf").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_key_resolves_to_sentinel() {
        let registry = WorkflowRegistry::new();
        let wf = registry.get_or_removed("deleted_long_ago");

        assert!(WorkflowRegistry::is_removed(&wf));
        assert!(wf.steps.is_empty());
    }
}
