//! Session configuration.
//!
//! [`SessionConfigInput`] is the serde-facing shape (TOML, millisecond
//! fields, everything optional); [`SessionConfigInput::resolve`] validates it
//! into the runtime [`SessionConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TICK_RATE_HZ: u32 = 20;
pub const DEFAULT_ASSUMED_RTT: Duration = Duration::from_millis(100);
pub const DEFAULT_BAD_CONNECTION_THRESHOLD: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PORT: u16 = 7777;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("tick_rate_hz must be between 1 and 1000, got {0}")]
    TickRate(u32),
    #[error("bad_connection_threshold ({bad:?}) must be shorter than connection_timeout ({timeout:?})")]
    Thresholds { bad: Duration, timeout: Duration },
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("simulation.loss must be within [0, 1], got {0}")]
    Loss(f64),
    #[error("simulation.min_latency_ms ({min}) exceeds max_latency_ms ({max})")]
    Latency { min: u64, max: u64 },
    #[error("invalid bind address {0:?}")]
    BindAddr(String),
}

// ─── Input (serde) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub bind: Option<String>,
    pub tick_rate_hz: Option<u32>,
    pub assumed_rtt_ms: Option<u64>,
    pub bad_connection_threshold_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub join_timeout_ms: Option<u64>,
    pub timeouts_enabled: Option<bool>,
    pub simulation: Option<SimulationConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulationConfigInput {
    pub loss: Option<f64>,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub seed: Option<u64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Artificial inbound impairment applied by
/// [`SimulatedChannel`](crate::sim::SimulatedChannel).
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Probability in `[0, 1]` that an inbound datagram is dropped.
    pub loss: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            seed: 0x5EED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bind: SocketAddr,
    pub tick_rate_hz: u32,
    /// Round-trip time assumed when deciding to resend a reliable.
    pub assumed_rtt: Duration,
    /// Silence after which a connection is flagged [`Bad`](crate::connection::ConnectionState::Bad).
    pub bad_connection_threshold: Duration,
    /// Silence after which a connection is dropped.
    pub connection_timeout: Duration,
    pub join_timeout: Duration,
    pub timeouts_enabled: bool,
    /// Wrap the transport in a simulated channel when set.
    pub simulation: Option<SimulationConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            assumed_rtt: DEFAULT_ASSUMED_RTT,
            bad_connection_threshold: DEFAULT_BAD_CONNECTION_THRESHOLD,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            timeouts_enabled: true,
            simulation: None,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    /// Age after which an unconfirmed reliable is written again (1.5 × RTT).
    pub fn resend_threshold(&self) -> Duration {
        self.assumed_rtt * 3 / 2
    }

    /// Parse and resolve a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigTomlError> {
        let input: SessionConfigInput = toml::from_str(s)?;
        Ok(input.resolve()?)
    }
}

/// Failure loading a TOML config.
#[derive(Debug, Error)]
pub enum ConfigTomlError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

fn non_zero_ms(
    value: Option<u64>,
    default: Duration,
    field: &'static str,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigError::Zero { field }),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

impl SessionConfigInput {
    pub fn resolve(self) -> Result<SessionConfig, ConfigError> {
        let defaults = SessionConfig::default();

        let bind = match self.bind {
            Some(s) => s.parse().map_err(|_| ConfigError::BindAddr(s))?,
            None => defaults.bind,
        };

        let tick_rate_hz = self.tick_rate_hz.unwrap_or(defaults.tick_rate_hz);
        if !(1..=1000).contains(&tick_rate_hz) {
            return Err(ConfigError::TickRate(tick_rate_hz));
        }

        let assumed_rtt =
            non_zero_ms(self.assumed_rtt_ms, defaults.assumed_rtt, "assumed_rtt_ms")?;
        let bad_connection_threshold = non_zero_ms(
            self.bad_connection_threshold_ms,
            defaults.bad_connection_threshold,
            "bad_connection_threshold_ms",
        )?;
        let connection_timeout = non_zero_ms(
            self.connection_timeout_ms,
            defaults.connection_timeout,
            "connection_timeout_ms",
        )?;
        if bad_connection_threshold >= connection_timeout {
            return Err(ConfigError::Thresholds {
                bad: bad_connection_threshold,
                timeout: connection_timeout,
            });
        }
        let join_timeout =
            non_zero_ms(self.join_timeout_ms, defaults.join_timeout, "join_timeout_ms")?;

        let simulation = self.simulation.map(SimulationConfigInput::resolve).transpose()?;

        Ok(SessionConfig {
            bind,
            tick_rate_hz,
            assumed_rtt,
            bad_connection_threshold,
            connection_timeout,
            join_timeout,
            timeouts_enabled: self.timeouts_enabled.unwrap_or(defaults.timeouts_enabled),
            simulation,
        })
    }
}

impl SimulationConfigInput {
    pub fn resolve(self) -> Result<SimulationConfig, ConfigError> {
        let defaults = SimulationConfig::default();
        let loss = self.loss.unwrap_or(defaults.loss);
        if !(0.0..=1.0).contains(&loss) {
            return Err(ConfigError::Loss(loss));
        }
        let min = self.min_latency_ms.unwrap_or(0);
        let max = self.max_latency_ms.unwrap_or(min);
        if min > max {
            return Err(ConfigError::Latency { min, max });
        }
        Ok(SimulationConfig {
            loss,
            min_latency: Duration::from_millis(min),
            max_latency: Duration::from_millis(max),
            seed: self.seed.unwrap_or(defaults.seed),
        })
    }
}
