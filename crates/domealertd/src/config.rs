//! TOML config file loading and validation for the daemon and its sensors.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::digital::CHANNELS as DIGITAL_CHANNELS;
use crate::onewire::DEFAULT_ROOT;
use crate::switches::CHANNELS as SWITCH_CHANNELS;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Seconds between one-wire / switch poll cycles.
    pub sensor_poll_rate: f64,
    /// Seconds before a reading is reported invalid.
    pub sensor_timeout: f64,
    /// Median filter window; 0 disables smoothing.
    pub sensor_median_samples: u32,
    #[serde(default = "default_onewire_root")]
    pub onewire_root: PathBuf,
    pub serial: Option<SerialConfig>,
    #[serde(default)]
    pub digital: Vec<DigitalSensor>,
    #[serde(default)]
    pub onewire: Vec<OneWireSensor>,
    #[serde(default)]
    pub switches: Vec<SwitchSensor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Read timeout in seconds; 0 blocks until a full line arrives.
    pub timeout: f64,
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementType {
    Temperature,
    Humidity,
}

impl MeasurementType {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    /// Temperature from the kernel hwmon interface.
    T,
    /// Temperature register of a temperature/humidity probe.
    Tht,
    /// Humidity derived from the probe's voltage ratio.
    Thh,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DigitalSensor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MeasurementType,
    pub channel: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OneWireSensor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    /// Device directory name under the one-wire root, e.g. `26-0000017a2b3c`.
    pub device: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchSensor {
    pub id: String,
    pub channel: u8,
    pub label: String,
    /// Display labels for the `[false, true]` states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

fn default_onewire_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

const POLL_RATE_RANGE: (f64, f64) = (1.0, 120.0);
const TIMEOUT_RANGE: (f64, f64) = (1.0, 120.0);
const MAX_MEDIAN_SAMPLES: u32 = 120;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_daemon(&mut errors);
        self.validate_serial(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sensor_poll_rate)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.sensor_timeout)
    }

    pub fn median_window(&self) -> usize {
        self.sensor_median_samples as usize
    }

    fn validate_daemon(&self, errors: &mut Vec<String>) {
        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }
        if self.ip.trim().is_empty() {
            errors.push("ip is empty".to_string());
        }

        let (lo, hi) = POLL_RATE_RANGE;
        if !(lo..=hi).contains(&self.sensor_poll_rate) {
            errors.push(format!(
                "sensor_poll_rate {} out of range [{lo}, {hi}]",
                self.sensor_poll_rate
            ));
        }
        let (lo, hi) = TIMEOUT_RANGE;
        if !(lo..=hi).contains(&self.sensor_timeout) {
            errors.push(format!(
                "sensor_timeout {} out of range [{lo}, {hi}]",
                self.sensor_timeout
            ));
        }
        if self.sensor_median_samples > MAX_MEDIAN_SAMPLES {
            errors.push(format!(
                "sensor_median_samples {} out of range [0, {MAX_MEDIAN_SAMPLES}]",
                self.sensor_median_samples
            ));
        }
    }

    fn validate_serial(&self, errors: &mut Vec<String>) {
        match &self.serial {
            Some(s) => {
                if s.port.trim().is_empty() {
                    errors.push("serial: port is empty".to_string());
                }
                if s.baud == 0 {
                    errors.push("serial: baud must be positive".to_string());
                }
                let hi = TIMEOUT_RANGE.1;
                if !(0.0..=hi).contains(&s.timeout) {
                    errors.push(format!(
                        "serial: timeout {} out of range [0, {hi}]",
                        s.timeout
                    ));
                }
            }
            None if !self.digital.is_empty() => {
                errors.push("digital sensors are configured but [serial] is missing".to_string());
            }
            None => {}
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        // Ids share one export namespace, so they must be unique across families.
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.digital.iter().enumerate() {
            let ctx = sensor_ctx("digital", i, &s.id);
            check_id(&ctx, &s.id, &mut seen_ids, errors);
            if usize::from(s.channel) >= DIGITAL_CHANNELS {
                errors.push(format!(
                    "{ctx}: channel {} out of range [0, {}]",
                    s.channel,
                    DIGITAL_CHANNELS - 1
                ));
            }
        }

        for (i, s) in self.onewire.iter().enumerate() {
            let ctx = sensor_ctx("onewire", i, &s.id);
            check_id(&ctx, &s.id, &mut seen_ids, errors);
            if s.device.trim().is_empty() {
                errors.push(format!("{ctx}: device is empty"));
            } else if s.device.contains('/') || s.device == "." || s.device == ".." {
                errors.push(format!(
                    "{ctx}: device '{}' must be a single directory name",
                    s.device
                ));
            }
            if s.label.trim().is_empty() {
                errors.push(format!("{ctx}: label is empty"));
            }
        }

        for (i, s) in self.switches.iter().enumerate() {
            let ctx = sensor_ctx("switches", i, &s.id);
            check_id(&ctx, &s.id, &mut seen_ids, errors);
            if usize::from(s.channel) >= SWITCH_CHANNELS {
                errors.push(format!(
                    "{ctx}: channel {} out of range [0, {}]",
                    s.channel,
                    SWITCH_CHANNELS - 1
                ));
            }
            if s.label.trim().is_empty() {
                errors.push(format!("{ctx}: label is empty"));
            }
            if let Some(values) = &s.values {
                if values.len() != 2 {
                    errors.push(format!(
                        "{ctx}: values must have exactly 2 entries, got {}",
                        values.len()
                    ));
                }
            }
        }
    }
}

fn check_id<'a>(ctx: &str, id: &'a str, seen: &mut HashSet<&'a str>, errors: &mut Vec<String>) {
    if id.trim().is_empty() {
        errors.push(format!("{ctx}: id is empty"));
    } else if id.ends_with("_valid") {
        errors.push(format!("{ctx}: id must not end in '_valid'"));
    }
    if !id.is_empty() && !seen.insert(id) {
        errors.push(format!("{ctx}: duplicate id"));
    }
}

fn sensor_ctx(family: &str, index: usize, id: &str) -> String {
    if id.is_empty() {
        format!("{family}[{index}]")
    } else {
        format!("{family} sensor '{id}'")
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        name = %config.name,
        digital = config.digital.len(),
        onewire = config.onewire.len(),
        switches = config.switches.len(),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
