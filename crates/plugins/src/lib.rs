//! Built-in file-type plugins for lixmerge.
//!
//! - [`JsonMessagesPlugin`]: JSON arrays of translation messages, diffed per
//!   message and resolved by field union.
//! - [`PropertiesPlugin`]: `key=value` files, diffed as a whole and resolved
//!   by last writer wins.

pub mod json_messages;
pub mod properties;

use std::sync::Arc;

use lixmerge_core::errors::RegistryError;
use lixmerge_core::registry::PluginRegistry;

pub use json_messages::JsonMessagesPlugin;
pub use properties::PropertiesPlugin;

/// A registry with every built-in plugin at its default glob.
pub fn builtin_registry() -> Result<PluginRegistry, RegistryError> {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(JsonMessagesPlugin::default()))?;
    registry.register(Arc::new(PropertiesPlugin::default()))?;
    Ok(registry)
}
