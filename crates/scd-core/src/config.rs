//! Configuration for the edge client and the collector.
//!
//! Loaded from a TOML file with three tables: `[relay]`, `[experiment]`
//! and `[timing]`. Every field has a default, so a partial file is valid.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::protocol::{AccelOdr, ModeConfig, SensorMask};
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScdConfig {
    pub relay: RelayConfig,
    pub experiment: ExperimentConfig,
    pub timing: TimingConfig,
}

impl ScdConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: ScdConfig = toml::from_str(&content)?;
        config.experiment.mode_config()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// TCP relay link between edge and collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Collector host name or address.
    pub host: String,
    /// Collector TCP port.
    pub port: u16,
    /// Collector HTTP port used for idle polling.
    pub http_port: u16,
    /// Largest message sent in one write (bounds `BDT_REQ` chunks).
    pub packet_max: usize,
    /// Per-call receive timeout.
    pub recv_timeout_ms: u64,
    /// How long the collector waits for the edge to connect.
    pub accept_timeout_ms: u64,
    /// Send/receive failures tolerated before the link is rebuilt.
    pub error_threshold: u32,
    /// Consecutive empty reads tolerated before the peer counts as gone.
    pub null_threshold: u32,
    /// Idle time after which the edge polls the collector over HTTP.
    pub poll_interval_s: u64,
    /// Lifetime of an accepted connection on the collector.
    pub keep_time_s: u64,
    /// Time the collector gives the edge to record before sending `BDT_END`.
    pub bdt_run_delay_ms: u64,
    /// Link reconnect attempts.
    pub reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            http_port: 8081,
            packet_max: 1024,
            recv_timeout_ms: 1_000,
            accept_timeout_ms: 30_000,
            error_threshold: 8,
            null_threshold: 3,
            poll_interval_s: 300,
            keep_time_s: 86_400,
            bdt_run_delay_ms: 10_000,
            reconnect_attempts: 10,
            reconnect_interval_ms: 3_000,
        }
    }
}

impl RelayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn keep_time(&self) -> Duration {
        Duration::from_secs(self.keep_time_s)
    }

    pub fn bdt_run_delay(&self) -> Duration {
        Duration::from_millis(self.bdt_run_delay_ms)
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.reconnect_interval_ms),
            self.reconnect_attempts,
        )
    }
}

/// Experiment parameters written into the STE mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Recording time of one `BDT_RUN`.
    pub run_time_ms: u64,
    /// Radio idle time before a keep-alive start/stop cycle.
    pub idle_interval_s: u64,
    /// Accelerometer ODR in Hz (400, 800, 1600, 3200 or 6400).
    pub accel_odr_hz: u32,
    /// Light sensor at 800 ms instead of 100 ms.
    pub light_odr_slow: bool,
    /// Sensor enable mask (accel 0x01, mag 0x02, light 0x04, temp 0x08).
    pub sensors: u8,
    pub accel_threshold: u16,
    pub light_threshold_low: u32,
    pub light_threshold_high: u32,
    pub magnet_threshold: u16,
    pub temp_threshold_low: u16,
    pub temp_threshold_high: u16,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let mode = ModeConfig::default();
        Self {
            run_time_ms: 3_000,
            idle_interval_s: 60,
            accel_odr_hz: mode.accel_odr.hz(),
            light_odr_slow: mode.light_odr_slow,
            sensors: mode.sensors.bits(),
            accel_threshold: mode.accel_threshold,
            light_threshold_low: mode.light_threshold_low,
            light_threshold_high: mode.light_threshold_high,
            magnet_threshold: mode.magnet_threshold,
            temp_threshold_low: mode.temp_threshold_low,
            temp_threshold_high: mode.temp_threshold_high,
        }
    }
}

impl ExperimentConfig {
    pub fn run_time(&self) -> Duration {
        Duration::from_millis(self.run_time_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_s)
    }

    /// Base mode configuration; time stamp and flash mode are set per run.
    pub fn mode_config(&self) -> Result<ModeConfig> {
        let accel_odr = AccelOdr::from_hz(self.accel_odr_hz)
            .ok_or_else(|| anyhow!("unsupported accelerometer ODR {} Hz", self.accel_odr_hz))?;
        Ok(ModeConfig {
            sensors: SensorMask::from_bits(self.sensors),
            accel_odr,
            light_odr_slow: self.light_odr_slow,
            accel_threshold: self.accel_threshold,
            light_threshold_low: self.light_threshold_low,
            light_threshold_high: self.light_threshold_high,
            magnet_threshold: self.magnet_threshold,
            temp_threshold_low: self.temp_threshold_low,
            temp_threshold_high: self.temp_threshold_high,
            ..ModeConfig::default()
        })
    }
}

/// Device settle delays and polling bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause after enabling notifications before the start command.
    pub settle_ms: u64,
    /// Pause between writing the mode config and reading it back.
    pub config_readback_ms: u64,
    /// Gap between the two reads of the rolling check.
    pub rolling_check_ms: u64,
    /// Generic command register poll interval while stopping.
    pub stop_poll_ms: u64,
    pub stop_poll_attempts: u32,
    /// Longest gap between BDT notifications before the status is queried.
    pub bdt_wait_ms: u64,
    /// Pause after the flash erase command before reconnecting.
    pub erase_wait_ms: u64,
    /// Radio reconnect attempts and interval.
    pub reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    /// Upper bound on one notification wait.
    pub notify_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 700,
            config_readback_ms: 300,
            rolling_check_ms: 500,
            stop_poll_ms: 700,
            stop_poll_attempts: 20,
            bdt_wait_ms: 8_000,
            erase_wait_ms: 10_000,
            reconnect_attempts: 5,
            reconnect_interval_ms: 2_000,
            notify_poll_ms: 100,
        }
    }
}

impl TimingConfig {
    /// No delays at all; used with scripted and simulated transports.
    pub fn immediate() -> Self {
        Self {
            settle_ms: 0,
            config_readback_ms: 0,
            rolling_check_ms: 0,
            stop_poll_ms: 0,
            stop_poll_attempts: 5,
            bdt_wait_ms: 0,
            erase_wait_ms: 0,
            reconnect_attempts: 3,
            reconnect_interval_ms: 0,
            notify_poll_ms: 0,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn config_readback(&self) -> Duration {
        Duration::from_millis(self.config_readback_ms)
    }

    pub fn rolling_check(&self) -> Duration {
        Duration::from_millis(self.rolling_check_ms)
    }

    pub fn bdt_wait(&self) -> Duration {
        Duration::from_millis(self.bdt_wait_ms)
    }

    pub fn erase_wait(&self) -> Duration {
        Duration::from_millis(self.erase_wait_ms)
    }

    pub fn notify_poll(&self) -> Duration {
        Duration::from_millis(self.notify_poll_ms)
    }

    pub fn stop_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.stop_poll_ms), self.stop_poll_attempts)
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.reconnect_interval_ms),
            self.reconnect_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_device_setup() {
        let config = ScdConfig::default();
        assert_eq!(config.relay.port, 8088);
        assert_eq!(config.relay.packet_max, 1024);
        assert_eq!(config.relay.error_threshold, 8);
        assert_eq!(config.relay.keep_time(), Duration::from_secs(86_400));
        assert_eq!(config.relay.bdt_run_delay(), Duration::from_secs(10));
        assert_eq!(config.experiment.run_time(), Duration::from_secs(3));
        assert_eq!(
            config.experiment.mode_config().unwrap(),
            ModeConfig::default()
        );
    }

    #[test]
    fn test_partial_toml() {
        let config: ScdConfig = toml::from_str(
            r#"
            [relay]
            host = "10.0.0.5"

            [experiment]
            accel_odr_hz = 3200
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.address(), "10.0.0.5:8088");
        assert_eq!(
            config.experiment.mode_config().unwrap().accel_odr,
            AccelOdr::Hz3200
        );
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn test_bad_odr_rejected() {
        let experiment = ExperimentConfig {
            accel_odr_hz: 1000,
            ..ExperimentConfig::default()
        };
        assert!(experiment.mode_config().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("scd-config-{}.toml", std::process::id()));
        let mut config = ScdConfig::default();
        config.relay.port = 9000;
        config.timing = TimingConfig::immediate();
        config.save_to_file(&path).unwrap();

        let loaded = ScdConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
