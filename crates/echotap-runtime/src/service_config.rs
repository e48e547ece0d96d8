//! Environment-driven service configuration.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Runtime configuration, loaded once at startup. Malformed values are
/// fatal with a message naming the offending variable.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub engine_url: String,
    pub engine_user: String,
    pub engine_pass: String,
    pub app_name: String,
    pub bind_ip: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
    pub echo_host: String,
    pub echo_port: u16,
    pub metrics_interval: Duration,
    pub service_port: u16,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_ip_raw = value_or(&lookup, "BIND_IP", "0.0.0.0");
        let bind_ip: IpAddr = bind_ip_raw
            .parse()
            .with_context(|| format!("invalid BIND_IP '{bind_ip_raw}'"))?;

        let port_range = value_or(&lookup, "PORT_RANGE", "4500-50000");
        let (port_min, port_max) = parse_port_range(&port_range)?;

        let echo_port_raw = value_or(&lookup, "ECHO_PORT", "4000");
        let echo_port: u16 = echo_port_raw
            .parse()
            .with_context(|| format!("invalid ECHO_PORT '{echo_port_raw}'"))?;

        let metrics_interval_raw = value_or(&lookup, "METRICS_INTERVAL_SEC", "5");
        let metrics_interval_sec: u64 = metrics_interval_raw
            .parse()
            .with_context(|| format!("invalid METRICS_INTERVAL_SEC '{metrics_interval_raw}'"))?;

        let service_port_raw = value_or(&lookup, "SERVICE_PORT", "9090");
        let service_port: u16 = service_port_raw
            .parse()
            .with_context(|| format!("invalid SERVICE_PORT '{service_port_raw}'"))?;

        Ok(Self {
            engine_url: value_or(&lookup, "ENGINE_URL", "localhost:8088"),
            engine_user: value_or(&lookup, "ENGINE_USER", "asterisk"),
            engine_pass: value_or(&lookup, "ENGINE_PASS", "asterisk"),
            app_name: value_or(&lookup, "APP_NAME", "echotap"),
            bind_ip,
            port_min,
            port_max,
            echo_host: value_or(&lookup, "ECHO_HOST", "127.0.0.1"),
            echo_port,
            metrics_interval: Duration::from_secs(metrics_interval_sec),
            service_port,
        })
    }
}

fn value_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let Some((min_raw, max_raw)) = raw.split_once('-') else {
        bail!("invalid PORT_RANGE '{raw}', expected MIN-MAX");
    };
    let min: u16 = min_raw
        .trim()
        .parse()
        .with_context(|| format!("invalid PORT_RANGE minimum '{min_raw}'"))?;
    let max: u16 = max_raw
        .trim()
        .parse()
        .with_context(|| format!("invalid PORT_RANGE maximum '{max_raw}'"))?;
    if min == 0 || min > max {
        bail!("invalid PORT_RANGE '{raw}', minimum must be non-zero and at most the maximum");
    }
    Ok((min, max))
}
