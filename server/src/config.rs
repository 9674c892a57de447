//! Application configuration loaded from environment variables.

use crate::error::{Error, Result};

/// Which backend holds the key-encryption-key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KekProviderKind {
    Local,
    GcpKms,
    AwsKms,
}

impl KekProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KekProviderKind::Local => "local",
            KekProviderKind::GcpKms => "gcp_kms",
            KekProviderKind::AwsKms => "aws_kms",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(KekProviderKind::Local),
            "gcp_kms" => Ok(KekProviderKind::GcpKms),
            "aws_kms" => Ok(KekProviderKind::AwsKms),
            other => Err(Error::Validation(format!(
                "Unknown encryption KEK provider: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_port: u16,
    pub jwt_secret: String,

    // Envelope encryption
    pub encryption_kek_provider: KekProviderKind,
    pub encryption_kek_local_key: Option<String>,
    pub encryption_kek_local_key_file: Option<String>,
    pub encryption_gcp_kms_key_name: Option<String>,
    pub encryption_aws_kms_key_id: Option<String>,

    // Slack (chat provider)
    pub slack_signing_secret: Option<String>,
    pub slack_client_id: Option<String>,
    pub slack_client_secret: Option<String>,
    pub slack_oauth_redirect_uri: Option<String>,

    // GitHub (global app fallback)
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,
    pub github_oauth_redirect_uri: Option<String>,

    pub sse_queue_capacity: usize,
    pub enable_metrics: bool,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let kek_provider = KekProviderKind::parse(
            &std::env::var("ENCRYPTION_KEK_PROVIDER").unwrap_or_else(|_| "local".to_string()),
        )?;

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/valet".to_string()),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| "change-me-in-production".to_string()),
            encryption_kek_provider: kek_provider,
            encryption_kek_local_key: env_opt("ENCRYPTION_KEK_LOCAL_KEY"),
            encryption_kek_local_key_file: env_opt("ENCRYPTION_KEK_LOCAL_KEY_FILE"),
            encryption_gcp_kms_key_name: env_opt("ENCRYPTION_GCP_KMS_KEY_NAME"),
            encryption_aws_kms_key_id: env_opt("ENCRYPTION_AWS_KMS_KEY_ID"),
            slack_signing_secret: env_opt("SLACK_SIGNING_SECRET"),
            slack_client_id: env_opt("SLACK_CLIENT_ID"),
            slack_client_secret: env_opt("SLACK_CLIENT_SECRET"),
            slack_oauth_redirect_uri: env_opt("SLACK_OAUTH_REDIRECT_URI"),
            github_client_id: env_opt("GITHUB_CLIENT_ID"),
            github_client_secret: env_opt("GITHUB_CLIENT_SECRET"),
            github_oauth_redirect_uri: env_opt("GITHUB_OAUTH_REDIRECT_URI"),
            sse_queue_capacity: std::env::var("SSE_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .unwrap_or(64),
            enable_metrics: matches!(
                std::env::var("ENABLE_METRICS").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
            ),
        };

        config.validate_kek()?;
        Ok(config)
    }

    /// A selected-but-unconfigured KEK provider fails at startup, not on
    /// first token write.
    fn validate_kek(&self) -> Result<()> {
        match self.encryption_kek_provider {
            KekProviderKind::Local => {
                if self.encryption_kek_local_key.is_none()
                    && self.encryption_kek_local_key_file.is_none()
                {
                    return Err(Error::Validation(
                        "ENCRYPTION_KEK_LOCAL_KEY or ENCRYPTION_KEK_LOCAL_KEY_FILE must be set \
                         for the local KEK provider"
                            .to_string(),
                    ));
                }
            }
            KekProviderKind::GcpKms => {
                if self.encryption_gcp_kms_key_name.is_none() {
                    return Err(Error::Validation(
                        "ENCRYPTION_GCP_KMS_KEY_NAME required for gcp_kms provider".to_string(),
                    ));
                }
            }
            KekProviderKind::AwsKms => {
                if self.encryption_aws_kms_key_id.is_none() {
                    return Err(Error::Validation(
                        "ENCRYPTION_AWS_KMS_KEY_ID required for aws_kms provider".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kek_provider() {
        assert_eq!(
            KekProviderKind::parse("local").unwrap(),
            KekProviderKind::Local
        );
        assert_eq!(
            KekProviderKind::parse("gcp_kms").unwrap(),
            KekProviderKind::GcpKms
        );
        assert_eq!(
            KekProviderKind::parse("aws_kms").unwrap(),
            KekProviderKind::AwsKms
        );
        assert!(KekProviderKind::parse("vault").is_err());
    }

    #[test]
    fn unconfigured_gcp_kek_is_rejected() {
        let config = Config {
            database_url: String::new(),
            server_port: 8080,
            jwt_secret: String::new(),
            encryption_kek_provider: KekProviderKind::GcpKms,
            encryption_kek_local_key: None,
            encryption_kek_local_key_file: None,
            encryption_gcp_kms_key_name: None,
            encryption_aws_kms_key_id: None,
            slack_signing_secret: None,
            slack_client_id: None,
            slack_client_secret: None,
            slack_oauth_redirect_uri: None,
            github_client_id: None,
            github_client_secret: None,
            github_oauth_redirect_uri: None,
            sse_queue_capacity: 64,
            enable_metrics: false,
        };
        assert!(config.validate_kek().is_err());
    }
}
