use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use url::Url;

use crate::{broker::BrokerOptions, guard::RateLimitConfig};

#[derive(Debug, Parser)]
#[command(
    name = "beach-broker",
    author,
    version,
    about = "Brokers remote-browser sessions without exposing upstream credentials"
)]
pub struct Cli {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "BROKER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// API key for the provisioning service.
    #[arg(long, env = "HYPERBEAM_API_KEY", hide_env_values = true)]
    pub hyperbeam_api_key: Option<String>,

    /// Base URL of the provisioning API.
    #[arg(
        long,
        env = "HYPERBEAM_BASE_URL",
        default_value = provisioner_sdk::DEFAULT_BASE_URL
    )]
    pub hyperbeam_base_url: String,

    /// Page opened when a client does not request one.
    #[arg(long, env = "BROKER_DEFAULT_URL", default_value = "https://youtube.com")]
    pub default_url: String,

    /// Session TTL used when a client does not request one.
    #[arg(long, env = "BROKER_DEFAULT_TTL_SECS", default_value_t = 300)]
    pub default_ttl_secs: u64,

    /// Largest TTL a client may request.
    #[arg(long, env = "BROKER_MAX_TTL_SECS", default_value_t = 86_400)]
    pub max_ttl_secs: u64,

    #[arg(long, env = "BROKER_RATE_LIMIT_MAX", default_value_t = 30)]
    pub rate_limit_max: u32,

    #[arg(long, env = "BROKER_RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    pub rate_limit_window_ms: u64,

    /// Request bodies above this size are rejected with 413.
    #[arg(long, env = "BROKER_MAX_BODY_BYTES", default_value_t = 16 * 1024)]
    pub max_body_bytes: usize,

    #[arg(
        long,
        env = "BROKER_CSRF_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub csrf_enabled: bool,

    /// Mark the CSRF cookie `Secure`; enable when served over https.
    #[arg(long, env = "BROKER_CSRF_SECURE_COOKIE", default_value_t = false)]
    pub csrf_secure_cookie: bool,

    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub openrouter_api_key: Option<String>,

    #[arg(
        long,
        env = "OPENROUTER_BASE_URL",
        default_value = "https://openrouter.ai/api/v1"
    )]
    pub openrouter_base_url: String,

    #[arg(long, env = "OPENROUTER_IMAGE_MODEL", default_value = "openai/dall-e-3")]
    pub openrouter_image_model: String,

    #[arg(long, env = "OPENROUTER_CHAT_MODEL", default_value = "openai/gpt-3.5-turbo")]
    pub openrouter_chat_model: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BROKER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

/// Shared by the chat and image proxies.
#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub image_model: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    pub hyperbeam_api_key: Option<String>,
    pub hyperbeam_base_url: String,
    pub broker: BrokerOptions,
    pub rate_limit: RateLimitConfig,
    pub max_body_bytes: usize,
    pub csrf_enabled: bool,
    pub csrf_secure_cookie: bool,
    pub openrouter: OpenRouterConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Url::parse(&cli.hyperbeam_base_url)
            .with_context(|| format!("invalid HYPERBEAM_BASE_URL: {}", cli.hyperbeam_base_url))?;
        Url::parse(&cli.default_url)
            .with_context(|| format!("invalid BROKER_DEFAULT_URL: {}", cli.default_url))?;
        Url::parse(&cli.openrouter_base_url)
            .with_context(|| format!("invalid OPENROUTER_BASE_URL: {}", cli.openrouter_base_url))?;

        if cli.default_ttl_secs == 0 || cli.default_ttl_secs > cli.max_ttl_secs {
            bail!(
                "default ttl {}s must be between 1 and the max ttl {}s",
                cli.default_ttl_secs,
                cli.max_ttl_secs
            );
        }
        if cli.rate_limit_max == 0 || cli.rate_limit_window_ms == 0 {
            bail!("rate limit max and window must both be greater than zero");
        }

        Ok(BrokerConfig {
            listen_addr,
            hyperbeam_api_key: normalize_opt(cli.hyperbeam_api_key),
            hyperbeam_base_url: cli.hyperbeam_base_url,
            broker: BrokerOptions {
                default_url: cli.default_url,
                default_ttl: Duration::from_secs(cli.default_ttl_secs),
                max_ttl: Duration::from_secs(cli.max_ttl_secs),
            },
            rate_limit: RateLimitConfig {
                max_requests: cli.rate_limit_max,
                window: Duration::from_millis(cli.rate_limit_window_ms),
            },
            max_body_bytes: cli.max_body_bytes,
            csrf_enabled: cli.csrf_enabled,
            csrf_secure_cookie: cli.csrf_secure_cookie,
            openrouter: OpenRouterConfig {
                api_key: normalize_opt(cli.openrouter_api_key),
                base_url: cli.openrouter_base_url,
                chat_model: cli.openrouter_chat_model,
                image_model: cli.openrouter_image_model,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
