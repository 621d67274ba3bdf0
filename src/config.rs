use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::lease::Pool;
use crate::supervisor::RetryPolicy;

pub const DEFAULT_START_IP: &str = "192.168.1.2/24";
pub const DEFAULT_PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const DEFAULT_LEASE_RANGE: usize = 253;

/// Server configuration, read once from the environment at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Lease pool. `gateway` comes from `PUBLIC_IP`, which is also the
    /// server identifier handed to clients.
    pub pool: Pool,
    pub workers: usize,
    /// Provision unknown clients with the default workflow.
    pub default_workflows: bool,
    /// MAC prefixes whose packets are dropped.
    pub ignore_ouis: Vec<String>,
    /// Relay addresses whose packets are dropped.
    pub ignore_giaddrs: Vec<String>,
    pub bind_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: Pool {
                start: Ipv4Addr::new(192, 168, 1, 2),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: DEFAULT_PUBLIC_IP,
                range_size: DEFAULT_LEASE_RANGE,
            },
            workers: default_workers(),
            default_workflows: false,
            ignore_ouis: Vec::new(),
            ignore_giaddrs: Vec::new(),
            bind_retry: RetryPolicy::default(),
        }
    }
}

/// Half the available parallelism, at least one.
pub fn default_workers() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    (parallelism / 2).max(1)
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|error| Error::InvalidConfig(format!("{}={:?}: {}", key, value, error)))
}

fn list(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `lookup`, which maps a variable name to
    /// its value. Unset and empty variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let start: Ipv4Net = parse(
            "START_IP",
            &get("START_IP").unwrap_or_else(|| DEFAULT_START_IP.to_string()),
        )?;
        let gateway = match get("PUBLIC_IP") {
            Some(value) => parse("PUBLIC_IP", &value)?,
            None => DEFAULT_PUBLIC_IP,
        };
        let range_size = match get("LEASE_RANGE") {
            Some(value) => parse("LEASE_RANGE", &value)?,
            None => DEFAULT_LEASE_RANGE,
        };
        let workers = match get("BOOTS_DHCP_WORKERS") {
            Some(value) => parse("BOOTS_DHCP_WORKERS", &value)?,
            None => defaults.workers,
        };

        let mut bind_retry = defaults.bind_retry;
        if let Some(value) = get("DHCP_BIND_ATTEMPTS") {
            bind_retry.attempts = parse("DHCP_BIND_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("DHCP_BIND_DELAY_MS") {
            bind_retry.initial_delay = Duration::from_millis(parse("DHCP_BIND_DELAY_MS", &value)?);
        }

        let config = Self {
            pool: Pool {
                start: start.addr(),
                subnet_mask: start.netmask(),
                gateway,
                range_size,
            },
            workers,
            default_workflows: get("ENABLE_DEFAULT_WORKFLOWS").as_deref() == Some("1"),
            ignore_ouis: list(get("DHCP_IGNORE_OUI")),
            ignore_giaddrs: list(get("DHCP_IGNORE_GIADDR")),
            bind_retry,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.range_size == 0 {
            return Err(Error::InvalidConfig(
                "LEASE_RANGE must be greater than 0".to_string(),
            ));
        }

        let start = u64::from(u32::from(self.pool.start));
        let end = u64::try_from(self.pool.range_size)
            .ok()
            .and_then(|range| start.checked_add(range));
        if end.is_none_or(|end| end > u64::from(u32::MAX) + 1) {
            return Err(Error::InvalidConfig(format!(
                "LEASE_RANGE {} runs past 255.255.255.255 from {}",
                self.pool.range_size, self.pool.start
            )));
        }

        if self.pool.offset(self.pool.gateway).is_some() {
            return Err(Error::InvalidConfig(
                "PUBLIC_IP must not be within the lease range".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(Error::InvalidConfig(
                "BOOTS_DHCP_WORKERS must be greater than 0".to_string(),
            ));
        }

        if self.bind_retry.attempts == 0 {
            return Err(Error::InvalidConfig(
                "DHCP_BIND_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Last address of the pool.
    pub fn pool_end(&self) -> Ipv4Addr {
        self.pool.address(self.pool.range_size.saturating_sub(1))
    }
}
