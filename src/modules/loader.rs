//! In-memory module loader and the per-session preload cache.
//!
//! # Example
//!
//! ```ignore
//! use rowwire_client::modules::StaticModuleLoader;
//!
//! let loader = StaticModuleLoader::new();
//! loader.register("/c/button.js", exports);
//! let slow = loader.register_deferred("/c/chart.js");
//! // ... later, once the code is available:
//! slow.resolve(chart_exports);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::{pick_export, LoadContext, ModuleDescriptor, ModuleLoader};
use crate::chunk::{Chunk, ChunkPoll, ChunkStatus, Deferred};
use crate::error::{Result, RowwireError};
use crate::value::Value;

/// Loader backed by modules registered up front.
///
/// Modules registered with [`register`](Self::register) are available
/// synchronously. Modules registered with
/// [`register_deferred`](Self::register_deferred) become available when
/// the returned [`Deferred`] is resolved with their exports.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: RefCell<HashMap<String, Value>>,
    deferred: RefCell<HashMap<String, Deferred>>,
    preloads: Cell<usize>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module whose exports are available right away.
    pub fn register(&self, specifier: &str, exports: Value) {
        tracing::debug!(specifier, "registered module");
        self.modules.borrow_mut().insert(specifier.to_string(), exports);
    }

    /// Register a module that loads later. Resolve the returned handle with
    /// the module's exports, or reject it to fail the load.
    pub fn register_deferred(&self, specifier: &str) -> Deferred {
        let deferred = Deferred::new();
        self.deferred
            .borrow_mut()
            .insert(specifier.to_string(), deferred.clone());
        deferred
    }

    /// Number of preload calls received, for checking deduplication.
    pub fn preload_count(&self) -> usize {
        self.preloads.get()
    }

    fn exports(&self, specifier: &str) -> Option<Value> {
        if let Some(exports) = self.modules.borrow().get(specifier) {
            return Some(exports.clone());
        }
        self.deferred
            .borrow()
            .get(specifier)
            .and_then(|d| d.chunk().fulfilled_value())
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn preload(&self, module: &ModuleDescriptor, _context: &LoadContext) -> Option<Deferred> {
        self.preloads.set(self.preloads.get() + 1);
        if self.modules.borrow().contains_key(&module.specifier) {
            return None;
        }
        match self.deferred.borrow().get(&module.specifier) {
            Some(deferred) => Some(deferred.clone()),
            None => Some(Deferred::rejected(RowwireError::ModuleLoad(format!(
                "no module registered for \"{}\"",
                module.specifier
            )))),
        }
    }

    fn require(&self, module: &ModuleDescriptor) -> Result<Value> {
        let exports = self
            .exports(&module.specifier)
            .ok_or_else(|| RowwireError::ModuleNotPreloaded(module.specifier.clone()))?;
        Ok(pick_export(&exports, module))
    }
}

/// Preload state per specifier, owned by one session.
#[derive(Default)]
pub(crate) struct ModuleCache {
    loads: RefCell<HashMap<String, Chunk>>,
}

impl ModuleCache {
    /// Start loading `module` unless it already is.
    ///
    /// Returns `None` when the module is ready, otherwise the chunk that
    /// settles once it is.
    pub(crate) fn preload(
        &self,
        loader: &dyn ModuleLoader,
        module: &ModuleDescriptor,
        context: &LoadContext,
    ) -> Option<Chunk> {
        let cached = self.loads.borrow().get(&module.specifier).cloned();
        let chunk = match cached {
            Some(chunk) => chunk,
            None => {
                tracing::debug!(specifier = %module.specifier, "preloading module");
                let chunk = match loader.preload(module, context) {
                    Some(deferred) => deferred.chunk().clone(),
                    None => Chunk::fulfilled(Value::Undefined),
                };
                self.loads
                    .borrow_mut()
                    .insert(module.specifier.clone(), chunk.clone());
                chunk
            }
        };
        match chunk.status() {
            ChunkStatus::Fulfilled => None,
            _ => Some(chunk),
        }
    }

    /// Fetch the export once the preload succeeded.
    pub(crate) fn require(&self, loader: &dyn ModuleLoader, module: &ModuleDescriptor) -> Result<Value> {
        let load = self.loads.borrow().get(&module.specifier).cloned();
        match load.map(|chunk| chunk.poll()) {
            Some(ChunkPoll::Ready(_)) => loader.require(module),
            Some(ChunkPoll::Failed(err)) => Err(err),
            _ => Err(RowwireError::ModuleNotPreloaded(module.specifier.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;

    fn descriptor(specifier: &str, name: &str) -> ModuleDescriptor {
        ModuleDescriptor {
            specifier: specifier.to_string(),
            name: name.to_string(),
            is_async: false,
        }
    }

    fn exports(name: &str, value: &str) -> Value {
        let object = Object::new();
        object.insert(name, Value::from(value));
        Value::Object(object)
    }

    #[test]
    fn test_registered_module_is_ready() {
        let loader = StaticModuleLoader::new();
        loader.register("/a.js", exports("A", "a"));
        let cache = ModuleCache::default();
        let module = descriptor("/a.js", "A");

        assert!(cache.preload(&loader, &module, &LoadContext::default()).is_none());
        assert_eq!(cache.require(&loader, &module).unwrap().as_str(), Some("a"));
    }

    #[test]
    fn test_preload_is_memoized() {
        let loader = StaticModuleLoader::new();
        let deferred = loader.register_deferred("/b.js");
        let cache = ModuleCache::default();
        let module = descriptor("/b.js", "B");
        let ctx = LoadContext::default();

        let first = cache.preload(&loader, &module, &ctx).unwrap();
        let second = cache.preload(&loader, &module, &ctx).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(loader.preload_count(), 1);

        deferred.resolve(exports("B", "b"));
        assert!(cache.preload(&loader, &module, &ctx).is_none());
        assert_eq!(loader.preload_count(), 1);
        assert_eq!(cache.require(&loader, &module).unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_require_before_preload_fails() {
        let loader = StaticModuleLoader::new();
        loader.register("/a.js", exports("A", "a"));
        let cache = ModuleCache::default();
        let err = cache.require(&loader, &descriptor("/a.js", "A")).unwrap_err();
        assert!(matches!(err, RowwireError::ModuleNotPreloaded(_)));
    }

    #[test]
    fn test_failed_load_is_reported() {
        let loader = StaticModuleLoader::new();
        let cache = ModuleCache::default();
        let module = descriptor("/missing.js", "x");

        let load = cache.preload(&loader, &module, &LoadContext::default()).unwrap();
        assert_eq!(load.status(), ChunkStatus::Rejected);
        assert!(matches!(
            cache.require(&loader, &module),
            Err(RowwireError::ModuleLoad(_))
        ));
    }
}
