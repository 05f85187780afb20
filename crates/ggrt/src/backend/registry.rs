//! Runtime backend registry for selecting backends by name.
//!
//! Backend crates register a constructor under a name; applications create
//! instances by name without depending on the concrete backend type.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::Backend;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        let mut backends = self.backends.write().expect("backend registry poisoned");
        if backends.insert(name.clone(), constructor).is_some() {
            tracing::debug!(backend = %name, "replaced registered backend");
        }
    }

    fn create(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let backends = self.backends.read().expect("backend registry poisoned");
        let constructor = backends.get(name)?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend constructor under `name`, replacing any previous entry.
///
/// The constructor runs each time the backend is requested via [`create_backend`].
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Create a backend instance by name; `None` if nothing is registered under it.
pub fn create_backend(name: &str) -> Option<Arc<dyn Backend>> {
    global_registry().create(name)
}

/// Registered backend names, sorted.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}

pub fn has_backend(name: &str) -> bool {
    global_registry().has_backend(name)
}
