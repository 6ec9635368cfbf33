//! Module references and the loader boundary.
//!
//! Module rows name code that the consumer must load before the value can
//! be used. The [`Manifest`] maps wire names to loadable specifiers, the
//! [`ModuleLoader`] does the actual loading, and each session keeps a
//! cache so a module is preloaded once no matter how often it is named.

mod loader;
mod manifest;

pub use loader::StaticModuleLoader;
pub(crate) use loader::ModuleCache;
pub use manifest::{Manifest, ManifestEntry, ModuleLoadingPolicy};

use crate::chunk::Deferred;
use crate::error::Result;
use crate::value::Value;

/// A resolved module reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// What the loader loads.
    pub specifier: String,
    /// Export to pick: `"*"` for the whole module, `""` for the default.
    pub name: String,
    /// The module's exports are wrapped in a promise-like default.
    pub is_async: bool,
}

/// Loading hints for one preload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadContext {
    pub prefix: String,
    pub cross_origin: Option<String>,
    pub nonce: Option<String>,
}

/// Loads module code on behalf of a session.
pub trait ModuleLoader {
    /// Start loading `module`.
    ///
    /// `None` means the module can be required right away. A returned
    /// [`Deferred`] is settled by the loader when loading finishes.
    fn preload(&self, module: &ModuleDescriptor, context: &LoadContext) -> Option<Deferred>;

    /// The export named by `module`. Only called once its preload settled.
    fn require(&self, module: &ModuleDescriptor) -> Result<Value>;
}

/// Pick the export named by `module` out of a module's exports.
pub fn pick_export(exports: &Value, module: &ModuleDescriptor) -> Value {
    let exports = if module.is_async {
        exports.get("default")
    } else {
        exports.clone()
    };
    match module.name.as_str() {
        "*" => exports,
        "" => exports.get("default"),
        name => exports.get(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;

    fn descriptor(name: &str, is_async: bool) -> ModuleDescriptor {
        ModuleDescriptor {
            specifier: "/m.js".to_string(),
            name: name.to_string(),
            is_async,
        }
    }

    #[test]
    fn test_pick_export() {
        let exports = Object::new();
        exports.insert("default", Value::from("d"));
        exports.insert("named", Value::from("n"));
        let exports = Value::Object(exports);

        assert_eq!(pick_export(&exports, &descriptor("named", false)).as_str(), Some("n"));
        assert_eq!(pick_export(&exports, &descriptor("", false)).as_str(), Some("d"));
        assert!(pick_export(&exports, &descriptor("*", false)).same_value(&exports));
        assert!(pick_export(&exports, &descriptor("missing", false)).is_undefined());
    }

    #[test]
    fn test_pick_export_async_unwraps_default() {
        let inner = Object::new();
        inner.insert("run", Value::from("r"));
        let outer = Object::new();
        outer.insert("default", Value::Object(inner));

        let picked = pick_export(&Value::Object(outer), &descriptor("run", true));
        assert_eq!(picked.as_str(), Some("r"));
    }
}
