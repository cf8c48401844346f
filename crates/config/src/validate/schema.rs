//! Schema validation
//!
//! Field rules from the `validator` derives plus checks that span fields.

use std::net::IpAddr;

use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::{Config, StorageConfig};

/// Run the derived field rules.
pub fn validate_schema(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    if let Err(errors) = config.validate() {
        flatten_errors("", &errors, &mut result);
    }
    result
}

fn flatten_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for err in field_errors {
                    let detail = err
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| err.code.to_string());
                    result.add_error(ValidationError::new(
                        ErrorCategory::Schema,
                        format!("Invalid value for '{}': {}", path, detail),
                    ));
                }
            }
            ValidationErrorsKind::Struct(nested) => flatten_errors(&path, nested, result),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    flatten_errors(&format!("{}[{}]", path, index), nested, result);
                }
            }
        }
    }
}

/// Checks the derives can't express.
pub fn validate_cross_field(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    match (&config.ca.cert_file, &config.ca.key_file) {
        (Some(_), None) | (None, Some(_)) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                "ca.cert_file and ca.key_file must be set together",
            ));
        }
        _ => {}
    }

    match &config.storage {
        StorageConfig::Memory => {}
        StorageConfig::File { path } => {
            if path.as_os_str().is_empty() {
                result.add_error(ValidationError::new(
                    ErrorCategory::Storage,
                    "storage.path must not be empty",
                ));
            }
        }
        StorageConfig::Kubernetes { namespace, name } => {
            if namespace.is_empty() || name.is_empty() {
                result.add_error(ValidationError::new(
                    ErrorCategory::Storage,
                    "storage.namespace and storage.name are required for kubernetes storage",
                ));
            }
        }
    }

    if let Some(redirect) = &config.listener.redirect_address {
        if *redirect == config.listener.address {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                format!(
                    "listener.redirect_address {} is the same as listener.address",
                    redirect
                ),
            ));
        }
    }

    for san in &config.listener.sans {
        if san.is_empty() || (san.contains(':') && san.parse::<IpAddr>().is_err()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                format!("listener.sans entry '{}' is not a hostname or IP address", san),
            ));
        }
    }

    result
}
