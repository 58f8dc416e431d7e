//! Sections of `worldsync-config.yaml` owned by the engine.
//!
//! The core config types ignore `templates` and `arena`; the engine pulls
//! them out of the raw YAML tree and falls back to built-in defaults when a
//! section is absent.

use serde::de::DeserializeOwned;
use worldsync_arena::ArenaConfig;
use worldsync_core::TemplateCatalog;

use crate::error::EngineError;

/// Parse `contents` into a raw YAML tree.
pub fn parse_raw(contents: &str) -> Result<serde_yml::Value, EngineError> {
    serde_yml::from_str(contents).map_err(|e| EngineError::Bootstrap {
        message: format!("failed to parse config YAML: {e}"),
    })
}

/// Deserialize the top-level `name` section, if present.
fn section<T: DeserializeOwned>(
    raw: &serde_yml::Value,
    name: &str,
) -> Result<Option<T>, EngineError> {
    raw.get(name)
        .map(|value| {
            serde_yml::from_value(value.clone()).map_err(|e| EngineError::Bootstrap {
                message: format!("failed to parse {name} config: {e}"),
            })
        })
        .transpose()
}

/// The agent catalog from `templates`, or the built-in town.
pub fn template_catalog(raw: &serde_yml::Value) -> Result<TemplateCatalog, EngineError> {
    Ok(section(raw, "templates")?.unwrap_or_else(TemplateCatalog::builtin))
}

/// The `arena` section, or defaults.
pub fn arena_config(raw: &serde_yml::Value) -> Result<ArenaConfig, EngineError> {
    Ok(section(raw, "arena")?.unwrap_or_default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_builtins() {
        let raw = parse_raw("world:\n  role: world-sim\n").unwrap();
        assert_eq!(template_catalog(&raw).unwrap(), TemplateCatalog::builtin());
        assert_eq!(arena_config(&raw).unwrap(), ArenaConfig::default());
    }

    #[test]
    fn sections_are_read_when_present() {
        let raw = parse_raw(
            r"
templates:
  - id: smith
    name: Blacksmith
    location: Forge
    count: 2
arena:
  min_participants: 8
",
        )
        .unwrap();
        let catalog = template_catalog(&raw).unwrap();
        assert_eq!(catalog.templates().len(), 1);
        assert_eq!(catalog.bootstrap(chrono::Utc::now()).len(), 2);
        assert_eq!(arena_config(&raw).unwrap().min_participants, 8);
    }

    #[test]
    fn malformed_section_is_an_error() {
        let raw = parse_raw("arena:\n  min_participants: lots\n").unwrap();
        assert!(matches!(
            arena_config(&raw),
            Err(EngineError::Bootstrap { .. })
        ));
    }
}
