//! Engine-wide defaults, loaded from TOML the same way the teacher loads its
//! provider/framework configuration: a typed schema, `${VAR}` /
//! `${VAR:-default}` environment expansion, and a `load`/`load_str` pair of
//! entry points.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Which TAP dialect the emitter produces. Only one exists today; kept as
/// an enum so a future TAP14 emitter slots in without an API break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapVersion {
    V13,
}

impl Default for TapVersion {
    fn default() -> Self {
        TapVersion::V13
    }
}

/// Engine-wide defaults applied when a test file doesn't override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrency applied to the implicit file root when the top-level
    /// call site does not specify one. Per §3, the root default is 1.
    pub default_concurrency: usize,

    /// Which TAP dialect to emit.
    pub tap_dialect: TapVersion,

    /// Whether diagnostics are batched into a single YAML-block comment per
    /// result line (`true`, the TAP-recommended default) or written as soon
    /// as `diagnostic()` is called (`false`).
    pub buffer_diagnostics: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 1,
            tap_dialect: TapVersion::V13,
            buffer_diagnostics: true,
        }
    }
}

/// Loads engine configuration from a TOML file on disk.
pub fn load_config(path: &Path) -> EngineResult<EngineConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_str(&content)
}

/// Loads engine configuration from a TOML string, expanding `${VAR}` /
/// `${VAR:-default}` references in any string-valued field first.
///
/// Useful for embedding configuration or testing without touching disk.
pub fn load_config_str(content: &str) -> EngineResult<EngineConfig> {
    let expanded = expand_env(content)?;
    let config: EngineConfig = toml::from_str(&expanded)?;
    Ok(config)
}

/// Expands `${VAR}` (required) and `${VAR:-default}` (optional) references
/// and unescapes `$$` to a literal `$`. Mirrors the teacher's expansion
/// convention, scoped down since this config has no nested provider tables.
fn expand_env(value: &str) -> EngineResult<String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                let mut spec = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    spec.push(c);
                }

                if let Some((var, default)) = spec.split_once(":-") {
                    result.push_str(&std::env::var(var).unwrap_or_else(|_| default.to_string()));
                } else if let Ok(val) = std::env::var(&spec) {
                    result.push_str(&val);
                } else {
                    return Err(EngineError::MissingEnvVar(spec));
                }
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.default_concurrency, 1);
        assert_eq!(config.tap_dialect, TapVersion::V13);
        assert!(config.buffer_diagnostics);
    }

    #[test]
    fn loads_overrides_from_toml() {
        let config = load_config_str(
            r#"
            default_concurrency = 4
            buffer_diagnostics = false
            "#,
        )
        .unwrap();
        assert_eq!(config.default_concurrency, 4);
        assert!(!config.buffer_diagnostics);
    }

    #[test]
    fn expands_env_var_with_default() {
        let config = load_config_str("default_concurrency = ${TAPESTRY_TEST_CONCURRENCY:-3}")
            .unwrap();
        assert_eq!(config.default_concurrency, 3);
    }

    #[test]
    fn missing_required_env_var_errors() {
        let err = load_config_str("default_concurrency = ${TAPESTRY_DEFINITELY_UNSET_VAR}");
        assert!(matches!(err, Err(EngineError::MissingEnvVar(_))));
    }
}
