//! Command-line and environment configuration
//!
//! Every flag can also be set through a `CERTPILOT_*` environment variable,
//! which is how the controller is normally configured in-cluster.

use std::time::Duration;

use clap::Args;

use crate::controller::ControllerSettings;
use crate::manager::ManagerConfig;
use crate::Error;

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Raw controller flags
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Ownership label value and server-side apply field manager
    #[arg(long, env = "CERTPILOT_CONTROLLER_NAME", default_value = crate::DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,

    /// Base URL of the platform API
    #[arg(long, env = "CERTPILOT_PLATFORM_URL")]
    pub platform_url: Option<String>,

    /// Bearer token for the platform API
    #[arg(long, env = "CERTPILOT_PLATFORM_TOKEN", hide_env_values = true)]
    pub platform_token: Option<String>,

    /// Timeout of every platform API call, in seconds
    #[arg(long, env = "CERTPILOT_PLATFORM_TIMEOUT_SECS", default_value_t = 5)]
    pub platform_timeout_secs: u64,

    /// Maximum number of secured routes; 0 disables the quota
    #[arg(long, env = "CERTPILOT_SECURED_ROUTES_QUOTA", default_value_t = 0)]
    pub secured_routes_quota: i64,

    /// Renew certificates with less than this many days of validity left
    #[arg(long, env = "CERTPILOT_RENEW_BEFORE_DAYS", default_value_t = 30)]
    pub renew_before_days: u64,

    /// Period of the renewal scan, in seconds
    #[arg(long, env = "CERTPILOT_RENEWAL_INTERVAL_SECS", default_value_t = 3600)]
    pub renewal_interval_secs: u64,

    /// Period of the quota usage report, in seconds
    #[arg(long, env = "CERTPILOT_REPORT_INTERVAL_SECS", default_value_t = 10)]
    pub report_interval_secs: u64,

    /// Number of concurrent issuance workers
    #[arg(long, env = "CERTPILOT_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Retries of a failing certificate request before it is dropped
    #[arg(long, env = "CERTPILOT_MAX_RETRIES", default_value_t = 10)]
    pub max_retries: u32,

    /// How long the initial cache sync may take, in seconds
    #[arg(long, env = "CERTPILOT_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 120)]
    pub cache_sync_timeout_secs: u64,
}

/// Validated controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Ownership label value
    pub controller_name: String,
    /// Base URL of the platform API, without trailing slash
    pub platform_url: String,
    /// Bearer token for the platform API
    pub platform_token: String,
    /// Timeout of every platform API call
    pub platform_timeout: Duration,
    /// Quota ceiling, 0 when disabled
    pub secured_routes_quota: i64,
    /// Remaining validity below which a certificate is renewed
    pub renew_before: Duration,
    /// Period of the renewal scan
    pub renewal_interval: Duration,
    /// Period of the quota usage report
    pub report_interval: Duration,
    /// Number of issuance workers
    pub workers: usize,
    /// Retries per certificate request
    pub max_retries: u32,
    /// Deadline of the initial cache sync
    pub cache_sync_timeout: Duration,
}

fn positive_secs(flag: &str, secs: u64) -> Result<Duration, Error> {
    if secs == 0 {
        return Err(Error::validation(format!("--{flag} must be greater than 0")));
    }
    Ok(Duration::from_secs(secs))
}

fn required(flag: &str, value: Option<String>) -> Result<String, Error> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::validation(format!("--{flag} is required")))
}

impl Config {
    /// Validate raw flags
    pub fn from_args(args: ControllerArgs) -> Result<Self, Error> {
        let controller_name = args.controller_name.trim().to_string();
        if controller_name.is_empty() {
            return Err(Error::validation("--controller-name must not be empty"));
        }

        let platform_url = required("platform-url", args.platform_url)?;
        if !platform_url.starts_with("http://") && !platform_url.starts_with("https://") {
            return Err(Error::validation(format!(
                "--platform-url must be an http(s) URL, got {platform_url}"
            )));
        }
        let platform_token = required("platform-token", args.platform_token)?;

        if args.secured_routes_quota < 0 {
            return Err(Error::validation("--secured-routes-quota must not be negative"));
        }
        if args.workers == 0 {
            return Err(Error::validation("--workers must be at least 1"));
        }

        Ok(Self {
            controller_name,
            platform_url: platform_url.trim_end_matches('/').to_string(),
            platform_token,
            platform_timeout: positive_secs("platform-timeout-secs", args.platform_timeout_secs)?,
            secured_routes_quota: args.secured_routes_quota,
            renew_before: Duration::from_secs(
                args.renew_before_days.saturating_mul(SECONDS_PER_DAY),
            ),
            renewal_interval: positive_secs("renewal-interval-secs", args.renewal_interval_secs)?,
            report_interval: positive_secs("report-interval-secs", args.report_interval_secs)?,
            workers: args.workers,
            max_retries: args.max_retries,
            cache_sync_timeout: positive_secs(
                "cache-sync-timeout-secs",
                args.cache_sync_timeout_secs,
            )?,
        })
    }

    /// Manager tunables
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            controller_name: self.controller_name.clone(),
            renew_before: self.renew_before,
            renewal_interval: self.renewal_interval,
            workers: self.workers,
            max_retries: self.max_retries,
        }
    }

    /// Controller settings
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            controller_name: self.controller_name.clone(),
            cache_sync_timeout: self.cache_sync_timeout,
        }
    }
}
