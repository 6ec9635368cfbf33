//! Manifest: how module references on the wire map to loadable modules.
//!
//! The manifest is produced by the build that bundled the consumer. It is
//! deserialized from JSON:
//!
//! ```json
//! {
//!   "moduleMap": { "app/button.js": { "default": { "specifier": "/c/button.js", "name": "default" } } },
//!   "serverMap": { "act#1": { "specifier": "/s/actions.js", "name": "save" } },
//!   "moduleLoading": { "prefix": "/static/", "crossOrigin": "anonymous" }
//! }
//! ```

use std::collections::HashMap;

use serde::Deserialize;

use super::ModuleDescriptor;
use crate::error::{Result, RowwireError};

/// One loadable export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub specifier: String,
    #[serde(default)]
    pub name: String,
}

/// Hints passed to the loader when preloading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoadingPolicy {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub cross_origin: Option<String>,
}

/// Module and server-reference lookup tables.
///
/// An absent `module_map` means module references already carry loadable
/// specifiers and are used as they arrive.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub module_map: Option<HashMap<String, HashMap<String, ManifestEntry>>>,
    #[serde(default)]
    pub server_map: Option<HashMap<String, ManifestEntry>>,
    #[serde(default)]
    pub module_loading: Option<ModuleLoadingPolicy>,
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolve the `[path, export, async]` metadata of a module row.
    ///
    /// The export falls back to `"*"` and then `"default"` when the exact
    /// name is not listed.
    pub fn resolve_client_reference(&self, metadata: &serde_json::Value) -> Result<ModuleDescriptor> {
        let path = metadata
            .get(0)
            .and_then(|v| v.as_str())
            .ok_or_else(|| RowwireError::Unsupported(format!("Invalid module reference {}", metadata)))?;
        let export = metadata.get(1).and_then(|v| v.as_str()).unwrap_or("");
        let is_async = metadata.get(2).and_then(|v| v.as_bool()).unwrap_or(false);

        let Some(module_map) = &self.module_map else {
            return Ok(ModuleDescriptor {
                specifier: path.to_string(),
                name: export.to_string(),
                is_async,
            });
        };
        let exports = module_map
            .get(path)
            .ok_or_else(|| RowwireError::ModuleNotFound(path.to_string()))?;
        let entry = [export, "*", "default"]
            .iter()
            .find_map(|key| exports.get(*key))
            .ok_or_else(|| RowwireError::ExportNotFound {
                module: path.to_string(),
                export: export.to_string(),
            })?;
        Ok(ModuleDescriptor {
            specifier: entry.specifier.clone(),
            name: entry.name.clone(),
            is_async,
        })
    }

    /// Resolve a remote-procedure id through the server map.
    pub fn resolve_server_reference(&self, id: &str) -> Result<ModuleDescriptor> {
        let entry = self
            .server_map
            .as_ref()
            .and_then(|map| map.get(id))
            .ok_or_else(|| RowwireError::ServerReferenceNotFound(id.to_string()))?;
        Ok(ModuleDescriptor {
            specifier: entry.specifier.clone(),
            name: entry.name.clone(),
            is_async: false,
        })
    }
}
