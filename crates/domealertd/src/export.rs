//! Flat `id -> value` / `id_valid -> bool` snapshot across every watcher.

use crate::digital::DigitalWatcher;
use crate::onewire::OneWireWatcher;
use crate::state::Export;
use crate::switches::SwitchWatcher;

#[derive(Clone)]
pub struct Exporter {
    digital: DigitalWatcher,
    onewire: OneWireWatcher,
    switches: Option<SwitchWatcher>,
}

impl Exporter {
    pub fn new(
        digital: DigitalWatcher,
        onewire: OneWireWatcher,
        switches: Option<SwitchWatcher>,
    ) -> Self {
        Self {
            digital,
            onewire,
            switches,
        }
    }

    /// Two entries per configured sensor. Each family is copied under its own
    /// lock, so the result never contains a half-applied poll.
    pub async fn export(&self) -> Export {
        let mut out = Export::new();
        self.digital.export_measurements(&mut out).await;
        self.onewire.export_measurements(&mut out).await;
        if let Some(switches) = &self.switches {
            switches.export_measurements(&mut out).await;
        }
        out
    }

    pub fn switches(&self) -> Option<&SwitchWatcher> {
        self.switches.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DigitalSensor, MeasurementType, OneWireSensor, ProbeType, SwitchSensor};
    use crate::error::Result;
    use crate::state::Measurement;
    use crate::switches::{InputBank, Level, RelayOutput, CHANNELS};
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct NullRelay;

    impl RelayOutput for NullRelay {
        fn set(&mut self, _enabled: bool) -> Result<()> {
            Ok(())
        }
    }

    struct FirstClosed;

    impl InputBank for FirstClosed {
        fn read_levels(&mut self) -> Result<[Level; CHANNELS]> {
            let mut levels = [Level::High; CHANNELS];
            levels[0] = Level::Low;
            Ok(levels)
        }
    }

    fn digital() -> DigitalWatcher {
        DigitalWatcher::new(
            &[DigitalSensor {
                id: "t1".into(),
                kind: MeasurementType::Temperature,
                channel: 1,
                label: None,
                units: None,
            }],
            3,
            TIMEOUT,
        )
    }

    fn onewire() -> OneWireWatcher {
        OneWireWatcher::new(
            Path::new("/nonexistent/w1"),
            &[OneWireSensor {
                id: "roof".into(),
                kind: ProbeType::T,
                device: "28-000000000000".into(),
                label: "Roof".into(),
                units: None,
            }],
            3,
            TIMEOUT,
        )
    }

    fn switches() -> SwitchWatcher {
        let sensor = |id: &str, channel| SwitchSensor {
            id: id.into(),
            channel,
            label: id.into(),
            values: None,
        };
        SwitchWatcher::new(&[sensor("door", 0), sensor("rain", 1)], NullRelay, TIMEOUT)
    }

    #[tokio::test]
    async fn every_sensor_contributes_two_keys() {
        let exporter = Exporter::new(digital(), onewire(), Some(switches()));
        let out = exporter.export().await;

        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [
                "door",
                "door_valid",
                "rain",
                "rain_valid",
                "roof",
                "roof_valid",
                "t1",
                "t1_valid"
            ]
        );
    }

    #[tokio::test]
    async fn never_polled_sensors_default_to_zero_and_invalid() {
        let exporter = Exporter::new(digital(), onewire(), None);
        let out = exporter.export().await;

        assert_eq!(out["t1"], Measurement::Value(0.0));
        assert_eq!(out["t1_valid"], Measurement::Flag(false));
        assert_eq!(out["roof"], Measurement::Value(0.0));
        assert_eq!(out["roof_valid"], Measurement::Flag(false));
    }

    #[tokio::test]
    async fn reflects_latest_watcher_state() {
        let digital = digital();
        let switches = switches();
        let exporter = Exporter::new(digital.clone(), onewire(), Some(switches.clone()));

        assert!(digital.ingest("1:T;18.256\r\n", Instant::now()).await);
        switches.poll_once(&mut FirstClosed).await;

        let out = exporter.export().await;
        assert_eq!(out["t1"], Measurement::Value(18.26));
        assert_eq!(out["door"], Measurement::Flag(true));
        assert_eq!(out["door_valid"], Measurement::Flag(true));
        assert_eq!(out["rain"], Measurement::Flag(false));
        assert_eq!(out["rain_valid"], Measurement::Flag(true));
    }

    #[tokio::test]
    async fn switches_are_optional() {
        let exporter = Exporter::new(digital(), onewire(), None);
        assert!(exporter.switches().is_none());
        assert!(!exporter.export().await.contains_key("door"));
    }
}
