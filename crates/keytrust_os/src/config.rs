#![forbid(unsafe_code)]

use keytrust_kernel_contracts::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustContainerConfig {
    pub container_name: String,
    pub context_id: String,
    pub max_policy_fetch_batch: u16,
}

impl TrustContainerConfig {
    pub fn mvp_v1(
        container_name: impl Into<String>,
        context_id: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let config = Self {
            container_name: container_name.into(),
            context_id: context_id.into(),
            max_policy_fetch_batch: 16,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Validate for TrustContainerConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        for (field, value) in [
            ("trust_container_config.container_name", &self.container_name),
            ("trust_container_config.context_id", &self.context_id),
        ] {
            if value.trim().is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must not be empty",
                });
            }
            if value.len() > 64 || !value.is_ascii() {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must be ASCII and <= 64 chars",
                });
            }
        }
        if self.max_policy_fetch_batch == 0 || self.max_policy_fetch_batch > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "trust_container_config.max_policy_fetch_batch",
                reason: "must be within 1..=64",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_config_01_defaults_validate_and_bad_values_fail() {
        let config = TrustContainerConfig::mvp_v1("com.example.keytrust", "defaultContext").unwrap();
        assert_eq!(config.max_policy_fetch_batch, 16);
        assert!(TrustContainerConfig::mvp_v1("", "ctx").is_err());
        assert!(TrustContainerConfig::mvp_v1("c", "ctx\u{2603}").is_err());

        let mut bad = config;
        bad.max_policy_fetch_batch = 0;
        assert!(bad.validate().is_err());
    }
}
