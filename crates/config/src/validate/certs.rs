//! Certificate validation
//!
//! Validates configured CA files: pairing, parseability, CA flag and expiry.
//! Missing files are fine; the listener generates and saves a CA there.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Validate the CA certificate files
pub fn validate_ca_files(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let (Some(cert_file), Some(key_file)) = (&config.ca.cert_file, &config.ca.key_file) else {
        return result;
    };

    match (cert_file.exists(), key_file.exists()) {
        (false, false) => {
            return result;
        }
        (true, false) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "CA certificate {:?} exists but private key {:?} does not",
                    cert_file, key_file
                ),
            ));
            return result;
        }
        (false, true) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "CA private key {:?} exists but certificate {:?} does not",
                    key_file, cert_file
                ),
            ));
            return result;
        }
        (true, true) => {}
    }

    match load_and_validate_ca(cert_file) {
        Ok(Some(expiry_warning)) => {
            result.add_warning(expiry_warning);
        }
        Ok(None) => {}
        Err(e) => {
            result.add_error(e);
        }
    }

    if let Err(e) = check_key_file(key_file) {
        result.add_error(e);
    }

    result
}

/// Load the CA certificate and check its flags and expiry
fn load_and_validate_ca(cert_path: &Path) -> Result<Option<ValidationWarning>, ValidationError> {
    use std::fs;

    let cert_pem = fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read CA certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse CA certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    if !cert.is_ca() {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Certificate {:?} is not a CA certificate", cert_path),
        ));
    }

    let now = SystemTime::now();
    let not_after = cert
        .validity()
        .not_after
        .to_datetime()
        .unix_timestamp()
        .max(0) as u64;
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after);

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "CA certificate expired: {:?} (expired at {})",
                cert_path,
                cert.validity().not_after
            ),
        ));
    }

    // Leaves are valid for up to a year, so warn a year ahead
    let one_year = Duration::from_secs(365 * 86400);
    if expiry_time < now + one_year {
        return Ok(Some(ValidationWarning::new(format!(
            "CA certificate expires within a year: {:?} (expires at {})",
            cert_path,
            cert.validity().not_after
        ))));
    }

    Ok(None)
}

fn check_key_file(key_path: &Path) -> Result<(), ValidationError> {
    let key_pem = std::fs::read(key_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read CA private key {:?}: {}", key_path, e),
        )
    })?;

    let blocks = pem::parse_many(&key_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse CA private key {:?}: {}", key_path, e),
        )
    })?;

    if !blocks.iter().any(|b| b.tag().ends_with("PRIVATE KEY")) {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!("No private key found in {:?}", key_path),
        ));
    }

    Ok(())
}
