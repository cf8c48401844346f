//! Configuration linting for best practices
//!
//! Checks configuration for settings that work but are likely mistakes.

use super::{ValidationResult, ValidationWarning};
use crate::{Config, StorageConfig};

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let listener = &config.listener;

    if config.storage == StorageConfig::Memory {
        result.add_warning(ValidationWarning::new(
            "Memory storage loses the serving certificate on restart (consider file or kubernetes storage)",
        ));
    }

    // A persisted leaf signed by a per-process CA stops verifying after restart
    if config.storage != StorageConfig::Memory && config.ca.cert_file.is_none() {
        result.add_warning(ValidationWarning::new(
            "Serving certificate is persisted but the CA is not (set ca.cert_file and ca.key_file)",
        ));
    }

    if listener.expiration_days_check == 0 {
        result.add_warning(ValidationWarning::new(
            "expiration_days_check = 0 falls back to the default renewal window of 30 days",
        ));
    }

    if listener.max_sans > 0 && listener.sans.len() >= listener.max_sans {
        result.add_warning(ValidationWarning::new(format!(
            "Configured SANs ({}) reach max_sans ({}); no names will be learned",
            listener.sans.len(),
            listener.max_sans
        )));
    }

    if !listener.allowed_names.is_empty() && listener.sans.is_empty() {
        result.add_warning(ValidationWarning::new(
            "allowed_names is set without sans; IP addresses seen on connections will be rejected",
        ));
    }

    if listener.address.ends_with(":80") {
        result.add_warning(ValidationWarning::new(format!(
            "Listener '{}' serves HTTPS on port 80",
            listener.address
        )));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_lint_memory_storage() {
        let config = Config::default();

        let result = lint_config(&config);

        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("Memory storage")));
    }

    #[test]
    fn test_lint_persisted_without_ca_files() {
        let mut config = Config::default();
        config.storage = StorageConfig::File {
            path: PathBuf::from("/tmp/serving.json"),
        };

        let result = lint_config(&config);

        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("CA is not")));
        assert!(!result
            .warnings
            .iter()
            .any(|w| w.message.contains("Memory storage")));
    }

    #[test]
    fn test_lint_expiration_default_window() {
        let mut config = Config::default();
        config.listener.expiration_days_check = 0;

        let result = lint_config(&config);

        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("default renewal window of 30 days")));
    }

    #[test]
    fn test_lint_max_sans_reached() {
        let mut config = Config::default();
        config.listener.sans = vec!["a.example".to_string(), "b.example".to_string()];
        config.listener.max_sans = 2;

        let result = lint_config(&config);

        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("reach max_sans")));
    }
}
