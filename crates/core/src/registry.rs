//! Plugin registry: maps file paths to the plugins responsible for them.
//!
//! Plugins are kept in registration order. For a given path every plugin
//! whose glob matches is returned in that order; the first one owns the file
//! (apply, conflict, and resolution duties) and the rest may contribute
//! supplementary whole-file diffs.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::ProcessRole;
use crate::errors::{PluginError, PluginResolutionError, RegistryError};
use crate::plugin::{Capabilities, Plugin};

// ---------------------------------------------------------------------------
// Registered plugin
// ---------------------------------------------------------------------------

/// A plugin together with the metadata captured when it was registered.
pub struct RegisteredPlugin {
    plugin: Arc<dyn Plugin>,
    key: String,
    glob: String,
    capabilities: Capabilities,
    order: usize,
    setup: OnceCell<()>,
}

impl RegisteredPlugin {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// Position in registration order.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn matches(&self, path: &str) -> bool {
        matches_pattern(path, &self.glob)
    }
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("key", &self.key)
            .field("glob", &self.glob)
            .field("capabilities", &self.capabilities)
            .field("order", &self.order)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Keys must be unique and globs well-formed.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let key = plugin.key().to_string();
        let glob = plugin.glob().to_string();

        if self.plugins.iter().any(|p| p.key == key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        validate_glob(&glob)?;

        let capabilities = plugin.capabilities();
        info!(
            plugin = %key,
            glob = %glob,
            kinds = capabilities.entity_kinds.len(),
            whole_file_diff = capabilities.whole_file_diff,
            "registered plugin"
        );

        let order = self.plugins.len();
        self.plugins.push(Arc::new(RegisteredPlugin {
            plugin,
            key,
            glob,
            capabilities,
            order,
            setup: OnceCell::new(),
        }));
        Ok(())
    }

    /// Every plugin whose glob matches `path`, in registration order.
    pub fn resolve(&self, path: &str) -> Vec<Arc<RegisteredPlugin>> {
        let matched: Vec<_> = self
            .plugins
            .iter()
            .filter(|p| p.matches(path))
            .cloned()
            .collect();
        if matched.len() > 1 {
            debug!(
                path,
                owner = matched[0].key(),
                candidates = matched.len(),
                "multiple plugins match, first registered owns the file"
            );
        }
        matched
    }

    /// The owning plugin for `path`.
    pub fn owner(&self, path: &str) -> Result<Arc<RegisteredPlugin>, PluginResolutionError> {
        self.plugins
            .iter()
            .find(|p| p.matches(path))
            .cloned()
            .ok_or_else(|| PluginResolutionError::NoMatch {
                path: path.to_string(),
            })
    }

    pub fn get(&self, key: &str) -> Option<Arc<RegisteredPlugin>> {
        self.plugins.iter().find(|p| p.key == key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run each plugin's one-time setup. Only the main process performs it;
    /// workers skip it entirely. A plugin whose setup succeeded is never set
    /// up again; a failed setup is retried on the next call. Returns how many
    /// plugins were set up by this call.
    pub async fn setup_all(&self, role: ProcessRole) -> Result<usize, PluginError> {
        if role != ProcessRole::Main {
            debug!(%role, "skipping plugin setup outside the main process");
            return Ok(0);
        }
        let mut ran = 0;
        for entry in &self.plugins {
            if entry.setup.initialized() {
                continue;
            }
            entry
                .setup
                .get_or_try_init(|| entry.plugin().setup())
                .await
                .inspect_err(|e| warn!(plugin = entry.key(), error = %e, "plugin setup failed"))?;
            debug!(plugin = entry.key(), "plugin setup complete");
            ran += 1;
        }
        Ok(ran)
    }
}

// ---------------------------------------------------------------------------
// Glob handling
// ---------------------------------------------------------------------------

/// Test whether `path` matches a glob `pattern`.
///
/// Supports `*`, `**`, `?`, `[...]` classes and `{a,b}` alternatives.
pub fn matches_pattern(path: &str, pattern: &str) -> bool {
    // Normalize to forward slashes for consistent matching.
    let path = path.replace('\\', "/");
    let pat = pattern.replace('\\', "/");
    glob_match::glob_match(&pat, &path)
}

/// Reject patterns `glob-match` would silently misinterpret.
pub fn validate_glob(pattern: &str) -> Result<(), RegistryError> {
    let invalid = |detail: &str| RegistryError::InvalidGlob {
        pattern: pattern.to_string(),
        detail: detail.to_string(),
    };

    if pattern.trim().is_empty() {
        return Err(invalid("pattern is empty"));
    }
    if pattern.contains("***") {
        return Err(invalid("more than two consecutive '*'"));
    }

    let mut in_class = false;
    let mut brace_depth = 0usize;
    let mut alternative_len = 0usize;
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if in_class {
            if c == ']' {
                in_class = false;
            }
            alternative_len += 1;
            continue;
        }
        match c {
            '[' => {
                in_class = true;
                // A leading ']' or '!]' is part of the class, not its end.
                if chars.peek() == Some(&'!') {
                    chars.next();
                }
                if chars.peek() == Some(&']') {
                    chars.next();
                }
                alternative_len += 1;
            }
            ']' => return Err(invalid("unmatched ']'")),
            '{' => {
                if brace_depth > 0 {
                    return Err(invalid("nested '{' alternatives are not supported"));
                }
                brace_depth += 1;
                alternative_len = 0;
            }
            ',' if brace_depth > 0 => {
                if alternative_len == 0 {
                    return Err(invalid("empty alternative"));
                }
                alternative_len = 0;
            }
            '}' => {
                if brace_depth == 0 {
                    return Err(invalid("unmatched '}'"));
                }
                if alternative_len == 0 {
                    return Err(invalid("empty alternative"));
                }
                brace_depth -= 1;
                alternative_len = 1;
            }
            _ => alternative_len += 1,
        }
    }

    if in_class {
        return Err(invalid("unclosed '['"));
    }
    if brace_depth > 0 {
        return Err(invalid("unclosed '{'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordPlugin;

    #[test]
    fn test_register_and_resolve_in_order() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(RecordPlugin::new("records", "**/*.json")))
            .unwrap();
        registry
            .register(Arc::new(RecordPlugin::new("locales", "locales/**")))
            .unwrap();

        let matched = registry.resolve("locales/en.json");
        let keys: Vec<&str> = matched.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["records", "locales"]);
        assert_eq!(registry.owner("locales/en.json").unwrap().key(), "records");
        assert_eq!(registry.owner("locales/en.txt").unwrap().key(), "locales");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(RecordPlugin::new("records", "*.json")))
            .unwrap();
        let err = registry
            .register(Arc::new(RecordPlugin::new("records", "*.yaml")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKey(ref k) if k == "records"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .register(Arc::new(RecordPlugin::new("broken", "src/[abc.json")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidGlob { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_no_match_is_resolution_error() {
        let registry = PluginRegistry::new();
        assert!(registry.resolve("logo.png").is_empty());
        assert!(matches!(
            registry.owner("logo.png"),
            Err(PluginResolutionError::NoMatch { .. })
        ));
    }

    #[test]
    fn test_validate_glob() {
        for ok in [
            "*.json",
            "**/*.json",
            "src/{a,b}/*.rs",
            "[!.]*.txt",
            "[]]x",
            "data/??.csv",
        ] {
            assert!(validate_glob(ok).is_ok(), "expected '{ok}' to be valid");
        }
        for bad in [
            "", "  ", "a/***/b", "[abc", "abc]", "{a,b", "a,b}", "{a,,b}", "{,a}", "{a,}",
            "{a,{b,c}}",
        ] {
            assert!(validate_glob(bad).is_err(), "expected '{bad}' to be invalid");
        }
    }

    #[test]
    fn test_matches_pattern_normalizes_separators() {
        assert!(matches_pattern("locales\\en.json", "locales/*.json"));
        assert!(matches_pattern("a/b/c.json", "**/*.json"));
        assert!(!matches_pattern("a/b/c.yaml", "**/*.json"));
    }

    #[tokio::test]
    async fn test_setup_runs_only_in_main_role() {
        let plugin = Arc::new(RecordPlugin::new("records", "*.json"));
        let mut registry = PluginRegistry::new();
        registry.register(plugin.clone()).unwrap();

        assert_eq!(registry.setup_all(ProcessRole::Worker).await.unwrap(), 0);
        assert_eq!(plugin.setup_calls(), 0);

        assert_eq!(registry.setup_all(ProcessRole::Main).await.unwrap(), 1);
        assert_eq!(plugin.setup_calls(), 1);

        assert_eq!(registry.setup_all(ProcessRole::Main).await.unwrap(), 0);
        assert_eq!(plugin.setup_calls(), 1);
    }
}
