// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bot configuration from the environment

use anyhow::{Context, Result};
use std::time::Duration;

use crate::forge::github::DEFAULT_API_URL;
use crate::licenses::DEFAULT_LICENSE_URL;

pub const DEFAULT_ADDR: &str = ":8080";
pub const DEFAULT_REFRESH_SECS: u64 = 3600;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;

/// Runtime configuration for `lurebot serve`
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on, as `host:port`
    pub addr: String,
    /// Webhook secret; requests are rejected while unset
    pub secret: Option<String>,
    pub github_token: Option<String>,
    pub workers: usize,
    pub api_url: String,
    pub license_url: String,
    pub refresh_every: Duration,
    pub job_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let addr = parse_listen_addr(&get("LURE_BOT_ADDR").unwrap_or_else(|| DEFAULT_ADDR.into()))
            .context("Invalid LURE_BOT_ADDR")?;

        let workers = match get("LURE_BOT_WORKERS") {
            Some(value) => value.parse().context("Invalid LURE_BOT_WORKERS")?,
            None => default_workers(),
        };
        if workers == 0 {
            anyhow::bail!("LURE_BOT_WORKERS must be at least 1");
        }

        let refresh_secs = match get("LURE_BOT_REFRESH_SECS") {
            Some(value) => value.parse().context("Invalid LURE_BOT_REFRESH_SECS")?,
            None => DEFAULT_REFRESH_SECS,
        };
        let timeout_secs = match get("LURE_BOT_JOB_TIMEOUT_SECS") {
            Some(value) => value.parse().context("Invalid LURE_BOT_JOB_TIMEOUT_SECS")?,
            None => DEFAULT_JOB_TIMEOUT_SECS,
        };

        Ok(Self {
            addr,
            secret: get("LURE_BOT_SECRET"),
            github_token: get("LURE_BOT_GITHUB_TOKEN"),
            workers,
            api_url: get("LURE_BOT_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()),
            license_url: get("LURE_BOT_LICENSE_URL").unwrap_or_else(|| DEFAULT_LICENSE_URL.into()),
            refresh_every: Duration::from_secs(refresh_secs.max(1)),
            job_timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }
}

/// One worker per available CPU
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Normalize a listen address; a bare `:port` listens on every interface
pub fn parse_listen_addr(addr: &str) -> Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("{:?} has no port", addr))?;
    port.parse::<u16>()
        .with_context(|| format!("{:?} is not a valid port", port))?;

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}
