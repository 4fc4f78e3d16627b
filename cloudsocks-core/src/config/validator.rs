//! Configuration validation

use super::schema::Config;
use crate::error::ValidationError;
use ipnet::IpNet;
use std::net::IpAddr;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate entire configuration
    pub fn validate(config: &Config) -> Result<(), ValidationError> {
        Self::validate_proxy(config)?;
        Self::validate_patterns(config)?;
        Self::validate_ranges(config)?;
        Self::validate_probe_target(config)?;
        Self::validate_vpn(config)?;
        Ok(())
    }

    fn validate_proxy(config: &Config) -> Result<(), ValidationError> {
        if config.proxy.listen_host.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidListenHost {
                host: config.proxy.listen_host.clone(),
            });
        }

        if config.proxy.connect_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: "proxy.connect_timeout_ms",
            });
        }

        if config.repository.provisioning_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: "repository.provisioning_timeout_ms",
            });
        }

        Ok(())
    }

    /// Validate upstream host wildcard patterns
    fn validate_patterns(config: &Config) -> Result<(), ValidationError> {
        for pattern in &config.repository.allowed_hosts {
            // Basic validation: no double wildcards
            if pattern.is_empty() || pattern.contains("**") {
                return Err(ValidationError::InvalidPattern {
                    pattern: pattern.clone(),
                });
            }

            if pattern.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(ValidationError::InvalidPattern {
                    pattern: pattern.clone(),
                });
            }
        }

        Ok(())
    }

    fn validate_ranges(config: &Config) -> Result<(), ValidationError> {
        for cidr in &config.repository.allowed_ranges {
            if cidr.parse::<IpNet>().is_err() {
                return Err(ValidationError::InvalidCidr { cidr: cidr.clone() });
            }
        }

        Ok(())
    }

    fn validate_probe_target(config: &Config) -> Result<(), ValidationError> {
        let Some(target) = &config.repository.probe_target else {
            return Ok(());
        };

        let valid = target
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);

        if valid {
            Ok(())
        } else {
            Err(ValidationError::InvalidProbeTarget {
                target: target.clone(),
            })
        }
    }

    fn validate_vpn(config: &Config) -> Result<(), ValidationError> {
        if !config.vpn.args.iter().any(|arg| arg.contains("{port}")) {
            return Err(ValidationError::MissingPortPlaceholder);
        }

        Ok(())
    }
}
