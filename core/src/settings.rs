//! Reconciliation settings on disk.
//!
//! Settings live in a YAML file. Missing keys take their defaults, so an
//! empty file is valid.

use std::path::Path;

use crate::error::SettingsError;
use crate::types::ReconcileSettings;


/// Returns the defaults used when no settings file is given.
pub fn default_settings() -> ReconcileSettings {
    ReconcileSettings::default()
}


/// Load settings from a YAML file.
pub fn load(path: &Path) -> Result<ReconcileSettings, SettingsError> {
    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&content)
}


/// Save settings to a YAML file.
pub fn save(path: &Path, settings: &ReconcileSettings) -> Result<(), SettingsError> {
    let content = serde_yaml::to_string(settings)?;
    std::fs::write(path, content).map_err(|source| SettingsError::Io {
        path: path.display().to_string(),
        source,
    })
}


/// Parse settings from a YAML string.
pub fn parse(content: &str) -> Result<ReconcileSettings, SettingsError> {
    let blank = content.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with('#')
    });
    if blank {
        return Ok(default_settings());
    }
    Ok(serde_yaml::from_str(content)?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::retry::RetryPolicy;
    use crate::types::BackoffStrategy;

    #[test]
    fn empty_content_gives_defaults() {
        assert_eq!(parse("").unwrap(), default_settings());
        assert_eq!(parse("# nothing here\n").unwrap(), default_settings());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let s = parse("settling_delay_ms: 250\nstrict_confirmation: true\n").unwrap();
        assert_eq!(s.settling_delay_ms, 250);
        assert!(s.strict_confirmation);
        assert_eq!(s.read_retry, default_settings().read_retry);
    }

    #[test]
    fn nested_retry_policy() {
        let yaml = "\
write_retry:
  max_retries: 2
  strategy: linear
  base_delay_ms: 300
session_deadline_ms: null
";
        let s = parse(yaml).unwrap();
        assert_eq!(s.write_retry, RetryPolicy::new(2, BackoffStrategy::Linear, 300));
        assert_eq!(s.session_deadline_ms, None);
    }

    #[test]
    fn bad_strategy_is_rejected() {
        let err = parse("read_retry:\n  strategy: sometimes\n").unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/roster/settings.yaml")).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
        assert!(err.to_string().contains("settings.yaml"));
    }
}
