//! Server configuration loaded from environment variables.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use coupon_core::coordinator::RecyclePolicy;
use coupon_node_lib::NodeConfig;

#[derive(Clone, Debug)]
pub struct Config {
    /// Store, cooldown and recycling settings.
    pub node: NodeConfig,
    /// Address to bind the HTTP server.
    pub bind_addr: String,
    /// Origins allowed to call the API with credentials.
    pub allowed_origins: Vec<String>,
    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`.
    pub trust_proxy: bool,
    /// Expose `DELETE /api/cooldowns`.
    pub test_routes: bool,
    /// Add `Secure` to the identity cookie.
    pub secure_cookie: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut node = NodeConfig::default();

        if let Ok(path) = std::env::var("COUPON_DATA_DIR") {
            node.data_dir = PathBuf::from(path);
        }

        node.cooldown_secs = std::env::var("COUPON_COOLDOWN_SECS")
            .unwrap_or_else(|_| node.cooldown_secs.to_string())
            .parse()
            .context("COUPON_COOLDOWN_SECS must be a positive integer")?;
        if node.cooldown_secs == 0 {
            bail!("COUPON_COOLDOWN_SECS must be greater than zero");
        }

        node.sweep_interval_secs = std::env::var("COUPON_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| node.sweep_interval_secs.to_string())
            .parse()
            .context("COUPON_SWEEP_INTERVAL_SECS must be a positive integer")?;

        if let Ok(policy) = std::env::var("COUPON_RECYCLE_POLICY") {
            node.policy = policy
                .parse::<RecyclePolicy>()
                .context("COUPON_RECYCLE_POLICY must be `expire` or `reset-on-exhaustion`")?;
        }

        if let Ok(codes) = std::env::var("COUPON_SEED_CODES") {
            node.seed_codes = split_list(&codes);
        }

        if let Ok(salt) = std::env::var("COUPON_IP_SALT") {
            node.ip_salt = salt;
        }

        node.composite_keys = env_flag("COUPON_COMPOSITE_KEY")?;

        let bind_addr = match (std::env::var("COUPON_BIND_ADDR"), std::env::var("PORT")) {
            (Ok(addr), _) => addr,
            (Err(_), Ok(port)) => {
                let port: u16 = port.parse().context("PORT must be a valid port number")?;
                format!("0.0.0.0:{port}")
            }
            (Err(_), Err(_)) => "0.0.0.0:3000".to_string(),
        };

        let allowed_origins = split_list(
            &std::env::var("COUPON_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5175".to_string()),
        );

        Ok(Config {
            node,
            bind_addr,
            allowed_origins,
            trust_proxy: env_flag("COUPON_TRUST_PROXY")?,
            test_routes: env_flag("COUPON_TEST_ROUTES")?,
            secure_cookie: env_flag("COUPON_SECURE_COOKIE")?,
        })
    }
}

/// Comma-separated list, trimmed, empties dropped.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Unset means `false`.
fn env_flag(name: &str) -> Result<bool> {
    match std::env::var(name) {
        Ok(v) => parse_flag(&v).with_context(|| format!("{name} must be true or false")),
        Err(_) => Ok(false),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("not a boolean: {other}"),
    }
}
