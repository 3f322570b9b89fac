//! Runtime configuration.
//!
//! Every knob is a CLI flag with an environment fallback, so the agent runs
//! from a `.env` file in development and from explicit flags in production.
//! Decimal price parameters are scaled to 1e-9 fixed point at parse time;
//! everything downstream is integer arithmetic.

use anyhow::{bail, Result};
use clap::Parser;

/// Parse a decimal string into 1e-9 fixed point.
fn fixed9(s: &str) -> Result<i64, String> {
    let value: f64 = s.parse().map_err(|e| format!("invalid decimal: {e}"))?;
    if !value.is_finite() {
        return Err("value must be finite".to_string());
    }
    Ok((value * 1e9).round() as i64)
}

#[derive(Parser, Debug, Clone)]
#[command(name = "quotebot", about = "Two-sided quoting agent", version)]
pub struct Config {
    /// WebSocket endpoint of the public book feed
    #[arg(long, env = "QUOTEBOT_FEED_URL", default_value = "ws://127.0.0.1:8889/ws")]
    pub feed_url: String,

    /// Trading gate host
    #[arg(long, env = "QUOTEBOT_GATE_HOST", default_value = "127.0.0.1")]
    pub gate_host: String,

    /// Trading gate port
    #[arg(long, env = "QUOTEBOT_GATE_PORT", default_value_t = 8887)]
    pub gate_port: u16,

    /// Session login id
    #[arg(long, env = "QUOTEBOT_LOGIN", default_value_t = 1)]
    pub login: u32,

    /// Trading account id
    #[arg(long, env = "QUOTEBOT_ACCOUNT", default_value_t = 1)]
    pub account: i64,

    /// Instrument id to quote
    #[arg(long, env = "QUOTEBOT_INSTRUMENT", default_value_t = 1)]
    pub instrument: i32,

    /// Quote size per side
    #[arg(long, env = "QUOTEBOT_VOLUME", default_value_t = 1)]
    pub volume: i32,

    /// Starting position (inventory carried in from the previous run)
    #[arg(long, env = "QUOTEBOT_POSITION", default_value_t = 0)]
    pub position: i32,

    /// Absolute position bound
    #[arg(long, env = "QUOTEBOT_MAXPOSITION", default_value_t = 10)]
    pub maxposition: i32,

    /// Half-spread each quote keeps from the mid, in price units
    #[arg(long, env = "QUOTEBOT_INTEREST", default_value = "1", value_parser = fixed9)]
    pub interest: i64,

    /// Quote skew per unit of inventory, in price units
    #[arg(long, env = "QUOTEBOT_SHIFT", default_value = "0", value_parser = fixed9)]
    pub shift: i64,

    /// Instrument price tick, in price units
    #[arg(long, env = "QUOTEBOT_INCREMENT", default_value = "1", value_parser = fixed9)]
    pub increment: i64,

    /// First request id for this session; must exceed every id of the
    /// previous run (the agent logs its high-water mark on shutdown)
    #[arg(long, env = "QUOTEBOT_FIRSTREQ", default_value_t = 1)]
    pub firstreq: u64,

    /// Outbound requests allowed per second
    #[arg(long, env = "QUOTEBOT_FLOODLIMIT", default_value_t = 5)]
    pub floodlimit: i32,
}

impl Config {
    /// Cross-field checks clap cannot express. Fatal before any connection.
    pub fn validate(&self) -> Result<()> {
        if self.increment <= 0 {
            bail!("increment must be positive, got {}", self.increment);
        }
        if self.volume < 0 {
            bail!("volume must be non-negative, got {}", self.volume);
        }
        if self.maxposition < 0 {
            bail!("maxposition must be non-negative, got {}", self.maxposition);
        }
        if self.position.abs() > self.maxposition {
            bail!(
                "starting position {} outside [-{}, {}]",
                self.position,
                self.maxposition,
                self.maxposition
            );
        }
        if self.firstreq == 0 {
            bail!("firstreq must be positive: 0 is the no-request sentinel");
        }
        if self.floodlimit <= 0 {
            bail!("floodlimit must be positive, got {}", self.floodlimit);
        }
        Ok(())
    }
}
