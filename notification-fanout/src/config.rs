/// Process configuration, loaded once at startup from environment
/// variables, following the same `Config::from_env()` shape the teacher's
/// `notification-service::config` module uses.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub retry: RetryConfig,
    pub transports: TransportConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

/// Bus tunables: queue names are fixed by §6, but poll waits and batch
/// sizes are the spec's stated defaults, overridable.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub ingress_wait_seconds: i32,
    pub ingress_max_messages: i32,
    pub dispatcher_wait_seconds: i32,
    pub dispatcher_max_messages: i32,
}

/// Retry/backoff constants, named explicitly in §4.7. Overridable for
/// tests; production defaults match the spec exactly.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: i32,
    pub backoff_base_secs: u64,
    pub ingress_publish_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            backoff_base_secs: 2,
            ingress_publish_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub sms_endpoint: String,
    pub sms_basic_auth_user: String,
    pub sms_basic_auth_pass: String,
    pub email_endpoint: String,
    pub email_bearer_token: String,
    pub apns_certificate_path: Option<String>,
    pub apns_key_id: String,
    pub apns_team_id: String,
    pub apns_bundle_id: String,
    pub apns_production: bool,
}

impl Config {
    /// Loads configuration from the process environment, defaulting every
    /// tunable named by the spec to its stated constant. Missing
    /// `DATABASE_URL` is the only hard failure — everything else degrades
    /// to a usable default so the service can boot against LocalStack-style
    /// test infrastructure without a full `.env`.
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable not set".to_string())?;

        Ok(Config {
            app: AppConfig {
                http_bind: env_or("HTTP_BIND", "0.0.0.0:8000"),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_parsed("DB_MAX_CONNECTIONS", 5),
                min_connections: env_parsed("DB_MIN_CONNECTIONS", 2),
                connect_timeout_secs: env_parsed("DB_CONNECT_TIMEOUT_SECS", 5),
                acquire_timeout_secs: env_parsed("DB_ACQUIRE_TIMEOUT_SECS", 10),
            },
            bus: BusConfig {
                region: env_or("AWS_REGION", "us-east-1"),
                endpoint_url: std::env::var("AWS_ENDPOINT_URL").ok(),
                ingress_wait_seconds: env_parsed("INGRESS_WAIT_SECONDS", 20),
                ingress_max_messages: env_parsed("INGRESS_MAX_MESSAGES", 10),
                dispatcher_wait_seconds: env_parsed("DISPATCHER_WAIT_SECONDS", 5),
                dispatcher_max_messages: env_parsed("DISPATCHER_MAX_MESSAGES", 10),
            },
            retry: RetryConfig {
                max_retries: env_parsed("MAX_RETRIES", 5),
                backoff_base_secs: env_parsed("BACKOFF_BASE_SECS", 2),
                ingress_publish_attempts: env_parsed("INGRESS_PUBLISH_ATTEMPTS", 3),
            },
            transports: TransportConfig {
                sms_endpoint: env_or("SMS_ENDPOINT", "https://sms.example.com/send"),
                sms_basic_auth_user: env_or("SMS_AUTH_USER", ""),
                sms_basic_auth_pass: env_or("SMS_AUTH_PASS", ""),
                email_endpoint: env_or("EMAIL_ENDPOINT", "https://email.example.com/send"),
                email_bearer_token: env_or("EMAIL_BEARER_TOKEN", ""),
                apns_certificate_path: std::env::var("APNS_CERTIFICATE_PATH").ok(),
                apns_key_id: env_or("APNS_KEY_ID", ""),
                apns_team_id: env_or("APNS_TEAM_ID", ""),
                apns_bundle_id: env_or("APNS_BUNDLE_ID", "com.example.app"),
                apns_production: env_parsed("APNS_PRODUCTION", false),
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_defaults_match_spec() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.backoff_base_secs, 2);
        assert_eq!(retry.ingress_publish_attempts, 3);
    }

    #[test]
    fn env_parsed_falls_back_to_default_on_missing_or_bad_value() {
        std::env::remove_var("NF_TEST_NOT_SET");
        assert_eq!(env_parsed::<i32>("NF_TEST_NOT_SET", 7), 7);
    }
}
