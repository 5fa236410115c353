//! Start-up checks for a gateway configuration.
//!
//! Everything found is reported at once so an operator can fix a file in one pass.

use crate::config::{GatewayConfig, LogOutputType};
use std::path::Path;

const MIN_HEADER_SIZE: usize = 1024;
const MAX_HEADER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct GatewayConfigValidator<'a> {
    config: &'a GatewayConfig,
}

impl<'a> GatewayConfigValidator<'a> {
    pub fn new(config: &'a GatewayConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_credentials(&mut result);
        self.validate_listener_tls(&mut result);
        self.validate_upstream_trust(&mut result);
        self.validate_limits(&mut result);
        self.validate_logging(&mut result);

        result
    }

    fn validate_credentials(&self, result: &mut ValidationResult) {
        match (&self.config.proxy_username, &self.config.proxy_password) {
            (Some(username), Some(_)) => {
                // The decoded credential is split at the first ':'
                if username.contains(':') {
                    result.add_error("proxy_username must not contain ':'".to_string());
                }
                if username.is_empty() {
                    result.add_warning("proxy_username is empty".to_string());
                }
            }
            _ => {
                result.add_error(
                    "proxy_username and proxy_password are required; every tunnel is authenticated"
                        .to_string(),
                );
            }
        }
    }

    fn validate_listener_tls(&self, result: &mut ValidationResult) {
        match (&self.config.private_key, &self.config.certificate) {
            (Some(key), Some(cert)) => {
                for (what, path) in [("private_key", key), ("certificate", cert)] {
                    if !Path::new(path).is_file() {
                        result.add_error(format!("{} file not found: {}", what, path));
                    }
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                result.add_error(
                    "private_key and certificate must be configured together".to_string(),
                );
            }
            (None, None) => {
                result.add_warning(format!(
                    "Listener on {} is plain TCP; credentials travel unencrypted",
                    self.config.listen_addr
                ));
                result.add_suggestion(
                    "Set private_key and certificate to serve the gateway over TLS".to_string(),
                );
            }
        }
    }

    fn validate_upstream_trust(&self, result: &mut ValidationResult) {
        for path in &self.config.upstream_ca_files {
            if !path.is_file() {
                result.add_error(format!("upstream CA file not found: {}", path.display()));
            }
        }
    }

    fn validate_limits(&self, result: &mut ValidationResult) {
        let size = self.config.max_header_size;
        if !(MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&size) {
            result.add_error(format!(
                "max_header_size must be between {} and {} bytes, got {}",
                MIN_HEADER_SIZE, MAX_HEADER_SIZE, size
            ));
        }

        if self.config.connect_timeout_secs == Some(0) {
            result.add_error("connect_timeout_secs must be greater than 0".to_string());
        } else if self.config.connect_timeout_secs.is_none() {
            result.add_suggestion(
                "Set connect_timeout_secs to bound how long an unreachable upstream can hold a client"
                    .to_string(),
            );
        }
    }

    fn validate_logging(&self, result: &mut ValidationResult) {
        let Some(logging) = &self.config.logging else {
            return;
        };
        for target in logging.targets.iter().flatten() {
            if matches!(target.output_type, LogOutputType::File) && target.path.is_none() {
                result.add_error("File log target requires a path".to_string());
            }
        }
    }
}

/// Validates `config`, turning any errors into a single message.
pub fn validate_config(config: &GatewayConfig) -> Result<ValidationResult, String> {
    let result = GatewayConfigValidator::new(config).validate();
    if result.is_valid {
        Ok(result)
    } else {
        Err(result.errors.join("; "))
    }
}
