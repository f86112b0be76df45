//! One-wire probes read through the kernel's w1 sysfs tree.
//!
//! Each configured probe gets its own fixed-rate polling loop, so a slow or
//! missing device never delays the others.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::{OneWireSensor, ProbeType};
use crate::error::{Error, Result};
use crate::link::{Link, Transition};
use crate::state::{insert_value, ChannelState, Export};
use crate::supervisor;

/// Where the w1 bus driver exposes its devices.
pub const DEFAULT_ROOT: &str = "/sys/bus/w1/devices";

/// Attribute reads occasionally fail while the bus master is busy.
const READ_RETRIES: usize = 5;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Derived humidity above this is a torn read, not weather.
const MAX_HUMIDITY: f64 = 100.0;

// ---------------------------------------------------------------------------
// Probe reads
// ---------------------------------------------------------------------------

/// Outcome of a single poll that did not hit an I/O error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Poll {
    /// Accepted reading.
    Sample(f64),
    /// Device answered but the derived value is physically impossible.
    Rejected,
    /// Device (or one of its attributes) is not present yet.
    NotReady,
}

#[derive(Debug, Clone)]
pub struct Probe {
    kind: ProbeType,
    device: PathBuf,
}

impl Probe {
    pub fn new(root: &Path, sensor: &OneWireSensor) -> Self {
        Self {
            kind: sensor.kind,
            device: root.join(&sensor.device),
        }
    }

    pub async fn read(&self) -> Result<Poll> {
        if !exists(&self.device).await {
            return Ok(Poll::NotReady);
        }

        match self.kind {
            ProbeType::T => {
                let Some(input) = find_hwmon_input(&self.device).await? else {
                    return Ok(Poll::NotReady);
                };
                let millidegrees: i64 = read_attribute(&input).await?;
                Ok(Poll::Sample(millidegrees as f64 / 1000.0))
            }
            ProbeType::Tht => {
                let raw: i64 = read_attribute(&self.device.join("temperature")).await?;
                Ok(Poll::Sample(decode_temperature(raw)))
            }
            ProbeType::Thh => {
                let raw: i64 = read_attribute(&self.device.join("temperature")).await?;
                let temperature = decode_temperature(raw);

                let vad_path = self.device.join("vad");
                let vdd_path = self.device.join("vdd");
                if !exists(&vad_path).await || !exists(&vdd_path).await {
                    return Ok(Poll::NotReady);
                }
                let vad: f64 = read_attribute(&vad_path).await?;
                let vdd: f64 = read_attribute(&vdd_path).await?;
                if !vad.is_finite() {
                    return Err(Error::Implausible { path: vad_path, value: vad });
                }
                if !vdd.is_finite() || vdd == 0.0 {
                    return Err(Error::Implausible { path: vdd_path, value: vdd });
                }

                Ok(screen_humidity(relative_humidity(vad, vdd, temperature)))
            }
        }
    }
}

/// Temperature register: 13-bit value in the top bits, 1/32 °C per LSB.
pub fn decode_temperature(raw: i64) -> f64 {
    (raw >> 3) as f64 * 0.03125
}

/// Voltage-ratio humidity with temperature compensation.
pub fn relative_humidity(vad: f64, vdd: f64, temperature: f64) -> f64 {
    let sensor_rh = (vad / vdd - 0.16) / 0.0062;
    sensor_rh / (1.0546 - 0.00216 * temperature)
}

/// The three attributes are read independently, so a conversion landing in
/// between can yield > 100 %. NaN fails the comparison and is rejected too.
fn screen_humidity(rh: f64) -> Poll {
    if rh <= MAX_HUMIDITY {
        Poll::Sample(rh)
    } else {
        Poll::Rejected
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// The hwmon index is assigned at bind time, so search
/// `hwmon/hwmon*/temp*_input` rather than hard-coding it.
async fn find_hwmon_input(device: &Path) -> Result<Option<PathBuf>> {
    let Some(monitors) = sorted_entries(&device.join("hwmon"), |n| n.starts_with("hwmon")).await?
    else {
        return Ok(None);
    };

    for monitor in monitors {
        let inputs = sorted_entries(&monitor, |n| n.starts_with("temp") && n.ends_with("_input"))
            .await?
            .unwrap_or_default();
        if let Some(first) = inputs.into_iter().next() {
            return Ok(Some(first));
        }
    }
    Ok(None)
}

/// Entries of `dir` whose names pass `keep`, sorted. `None` if `dir` is absent.
async fn sorted_entries(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Option<Vec<PathBuf>>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Attribute {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_str().is_some_and(&keep) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(Some(paths))
}

async fn read_attribute<T: FromStr>(path: &Path) -> Result<T> {
    let mut attempt = 0;
    let raw = loop {
        match fs::read_to_string(path).await {
            Ok(raw) => break raw,
            Err(_) if attempt < READ_RETRIES => {
                attempt += 1;
                sleep(READ_RETRY_DELAY).await;
            }
            Err(source) => {
                return Err(Error::Attribute {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    };

    let raw = raw.trim();
    raw.parse().map_err(|_| Error::Parse {
        path: path.to_path_buf(),
        raw: raw.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

struct ProbeState {
    channel: ChannelState,
    link: Link,
}

/// One configured probe and the state its polling loop maintains.
#[derive(Clone)]
pub struct ProbeWatcher {
    id: Arc<str>,
    probe: Probe,
    state: Arc<RwLock<ProbeState>>,
}

impl ProbeWatcher {
    fn new(root: &Path, sensor: &OneWireSensor, window: usize) -> Self {
        Self {
            id: sensor.id.as_str().into(),
            probe: Probe::new(root, sensor),
            state: Arc::new(RwLock::new(ProbeState {
                channel: ChannelState::new(window),
                link: Link::default(),
            })),
        }
    }

    /// Run one poll cycle. Returns the availability transition, if any.
    pub async fn poll_once(&self) -> Option<Transition> {
        let was_available = self.state.read().await.link.is_available();

        let (available, sample) = match self.probe.read().await {
            Ok(Poll::Sample(v)) => (true, Some(v)),
            Ok(Poll::Rejected) => (true, None),
            Ok(Poll::NotReady) => (false, None),
            Err(e) => {
                if was_available {
                    warn!(sensor = %self.id, "poll failed: {e}");
                }
                (false, None)
            }
        };

        let change = {
            let mut state = self.state.write().await;
            if let Some(v) = sample {
                state.channel.record(v, Instant::now());
            }
            state.link.update(available)
        };

        match change {
            Some(Transition::Connected) => info!(sensor = %self.id, "sensor connected"),
            Some(Transition::Disconnected) => warn!(sensor = %self.id, "sensor disconnected"),
            None => {}
        }
        change
    }

    /// Poll forever at a fixed rate.
    pub async fn run(self, interval: Duration) {
        loop {
            self.poll_once().await;
            sleep(interval).await;
        }
    }

    async fn export_measurement(&self, out: &mut Export, now: Instant, timeout: Duration) {
        let state = self.state.read().await;
        let valid = state.link.is_available() && state.channel.is_fresh(now, timeout);
        insert_value(out, &self.id, state.channel.value(), valid);
    }
}

#[derive(Clone)]
pub struct OneWireWatcher {
    probes: Arc<[ProbeWatcher]>,
    timeout: Duration,
}

impl OneWireWatcher {
    pub fn new(root: &Path, sensors: &[OneWireSensor], window: usize, timeout: Duration) -> Self {
        Self {
            probes: sensors
                .iter()
                .map(|s| ProbeWatcher::new(root, s, window))
                .collect(),
            timeout,
        }
    }

    /// Start one supervised polling loop per probe.
    pub fn spawn(&self, interval: Duration) {
        for probe in self.probes.iter() {
            let probe = probe.clone();
            supervisor::spawn(format!("onewire/{}", probe.id), move || {
                probe.clone().run(interval)
            });
        }
    }

    pub async fn export_measurements(&self, out: &mut Export) {
        let now = Instant::now();
        for probe in self.probes.iter() {
            probe.export_measurement(out, now, self.timeout).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Measurement;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Throwaway w1 device tree under the system temp dir.
    struct DeviceTree {
        root: PathBuf,
    }

    impl DeviceTree {
        fn new(name: &str) -> Self {
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            let root = std::env::temp_dir().join(format!(
                "domealertd-w1-{}-{}-{name}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        fn write(&self, rel: &str, contents: &str) {
            let path = self.root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }

        fn remove(&self, rel: &str) {
            std::fs::remove_dir_all(self.root.join(rel)).unwrap();
        }
    }

    impl Drop for DeviceTree {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn sensor(id: &str, kind: ProbeType, device: &str) -> OneWireSensor {
        OneWireSensor {
            id: id.into(),
            kind,
            device: device.into(),
            label: id.into(),
            units: None,
        }
    }

    async fn export(w: &OneWireWatcher) -> Export {
        let mut out = Export::new();
        w.export_measurements(&mut out).await;
        out
    }

    // -- Conversions --------------------------------------------------------

    #[test]
    fn temperature_register_decoding() {
        // 21.5 °C = 688 * 0.03125, stored shifted left by 3.
        assert_eq!(decode_temperature(688 << 3), 21.5);
        // Low three bits are status, not data.
        assert_eq!(decode_temperature((688 << 3) | 0b111), 21.5);
        assert_eq!(decode_temperature(-(80 << 3)), -2.5);
    }

    #[test]
    fn humidity_formula_uses_literal_constants() {
        let rh = relative_humidity(2.0, 5.0, 25.0);
        let expected = ((2.0 / 5.0 - 0.16) / 0.0062) / (1.0546 - 0.00216 * 25.0);
        assert!((rh - expected).abs() < 1e-12);
        assert!((rh - 38.7097 / 1.0006).abs() < 1e-3);
    }

    // -- Probe reads --------------------------------------------------------

    #[tokio::test]
    async fn missing_device_is_not_ready() {
        let tree = DeviceTree::new("missing");
        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Tht, "26-absent"));
        assert_eq!(probe.read().await.unwrap(), Poll::NotReady);
    }

    #[tokio::test]
    async fn t_probe_finds_dynamic_hwmon_index() {
        let tree = DeviceTree::new("hwmon");
        tree.write("28-01/hwmon/hwmon3/temp1_input", "21375\n");
        tree.write("28-01/hwmon/hwmon3/name", "w1_slave_temp\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::T, "28-01"));
        assert_eq!(probe.read().await.unwrap(), Poll::Sample(21.375));
    }

    #[tokio::test]
    async fn t_probe_without_hwmon_is_not_ready() {
        let tree = DeviceTree::new("nohwmon");
        tree.write("28-02/name", "28-02\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::T, "28-02"));
        assert_eq!(probe.read().await.unwrap(), Poll::NotReady);
    }

    #[tokio::test]
    async fn tht_probe_reports_temperature() {
        let tree = DeviceTree::new("tht");
        tree.write("26-01/temperature", &format!("{}\n", 688 << 3));

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Tht, "26-01"));
        assert_eq!(probe.read().await.unwrap(), Poll::Sample(21.5));
    }

    #[tokio::test]
    async fn thh_probe_reports_humidity() {
        let tree = DeviceTree::new("thh");
        tree.write("26-02/temperature", &format!("{}\n", 800 << 3)); // 25 °C
        tree.write("26-02/vad", "2.0\n");
        tree.write("26-02/vdd", "5.0\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Thh, "26-02"));
        let Poll::Sample(rh) = probe.read().await.unwrap() else {
            panic!("expected a sample");
        };
        assert!((rh - relative_humidity(2.0, 5.0, 25.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn thh_probe_without_voltages_is_not_ready() {
        let tree = DeviceTree::new("thh-novad");
        tree.write("26-03/temperature", &format!("{}\n", 800 << 3));
        tree.write("26-03/vdd", "5.0\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Thh, "26-03"));
        assert_eq!(probe.read().await.unwrap(), Poll::NotReady);
    }

    #[tokio::test]
    async fn thh_probe_rejects_impossible_humidity() {
        let tree = DeviceTree::new("thh-high");
        tree.write("26-04/temperature", &format!("{}\n", 800 << 3));
        tree.write("26-04/vad", "4.9\n");
        tree.write("26-04/vdd", "5.0\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Thh, "26-04"));
        assert_eq!(probe.read().await.unwrap(), Poll::Rejected);
    }

    #[test]
    fn nan_humidity_is_rejected() {
        assert_eq!(screen_humidity(f64::NAN), Poll::Rejected);
        assert_eq!(screen_humidity(100.0), Poll::Sample(100.0));
        assert_eq!(screen_humidity(100.01), Poll::Rejected);
    }

    #[tokio::test]
    async fn thh_probe_with_zero_supply_is_an_error() {
        let tree = DeviceTree::new("thh-vdd0");
        tree.write("26-07/temperature", &format!("{}\n", 800 << 3));
        tree.write("26-07/vad", "0\n");
        tree.write("26-07/vdd", "0\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Thh, "26-07"));
        let err = probe.read().await.unwrap_err();
        assert!(matches!(err, Error::Implausible { value, .. } if value == 0.0));
    }

    #[tokio::test]
    async fn thh_probe_with_nan_voltage_is_an_error() {
        let tree = DeviceTree::new("thh-nan");
        tree.write("26-08/temperature", &format!("{}\n", 800 << 3));
        tree.write("26-08/vad", "nan\n");
        tree.write("26-08/vdd", "5.0\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Thh, "26-08"));
        assert!(matches!(probe.read().await, Err(Error::Implausible { .. })));
    }

    #[tokio::test]
    async fn garbage_attribute_is_an_error() {
        let tree = DeviceTree::new("garbage");
        tree.write("26-05/temperature", "not a number\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Tht, "26-05"));
        let err = probe.read().await.unwrap_err();
        assert!(matches!(err, Error::Parse { ref raw, .. } if raw == "not a number"));
    }

    #[tokio::test]
    async fn unreadable_attribute_is_an_error_after_retries() {
        let tree = DeviceTree::new("unreadable");
        tree.write("26-06/name", "26-06\n");

        let probe = Probe::new(&tree.root, &sensor("x", ProbeType::Tht, "26-06"));
        assert!(matches!(probe.read().await, Err(Error::Attribute { .. })));
    }

    // -- Watcher --------------------------------------------------------------

    #[tokio::test]
    async fn successful_poll_connects_and_exports() {
        let tree = DeviceTree::new("watch");
        tree.write("26-01/temperature", &format!("{}\n", 688 << 3));

        let w = OneWireWatcher::new(&tree.root, &[sensor("ext", ProbeType::Tht, "26-01")], 5, TIMEOUT);
        assert_eq!(w.probes[0].poll_once().await, Some(Transition::Connected));
        assert_eq!(w.probes[0].poll_once().await, None);

        let out = export(&w).await;
        assert_eq!(out["ext"], Measurement::Value(21.5));
        assert_eq!(out["ext_valid"], Measurement::Flag(true));
    }

    #[tokio::test]
    async fn rejected_humidity_keeps_previous_value_and_timestamp() {
        let tree = DeviceTree::new("watch-thh");
        tree.write("26-02/temperature", &format!("{}\n", 800 << 3));
        tree.write("26-02/vad", "2.0\n");
        tree.write("26-02/vdd", "5.0\n");

        let w = OneWireWatcher::new(&tree.root, &[sensor("rh", ProbeType::Thh, "26-02")], 5, TIMEOUT);
        let probe = &w.probes[0];
        probe.poll_once().await;
        let (value, updated) = {
            let st = probe.state.read().await;
            (st.channel.value(), st.channel.updated())
        };

        tree.write("26-02/vad", "4.9\n");
        assert_eq!(probe.poll_once().await, None);

        let st = probe.state.read().await;
        assert_eq!(st.channel.value(), value);
        assert_eq!(st.channel.updated(), updated);
        assert!(st.link.is_available());
    }

    #[tokio::test]
    async fn zero_supply_never_exports_a_valid_reading() {
        let tree = DeviceTree::new("watch-vdd0");
        tree.write("26-03/temperature", &format!("{}\n", 800 << 3));
        tree.write("26-03/vad", "0\n");
        tree.write("26-03/vdd", "0\n");

        let w = OneWireWatcher::new(&tree.root, &[sensor("rh", ProbeType::Thh, "26-03")], 5, TIMEOUT);
        assert_eq!(w.probes[0].poll_once().await, None);

        let out = export(&w).await;
        assert_eq!(out["rh"], Measurement::Value(0.0));
        assert_eq!(out["rh_valid"], Measurement::Flag(false));
    }

    #[tokio::test]
    async fn vanished_device_disconnects_once_and_keeps_value() {
        let tree = DeviceTree::new("watch-gone");
        tree.write("26-01/temperature", &format!("{}\n", 688 << 3));

        let w = OneWireWatcher::new(&tree.root, &[sensor("ext", ProbeType::Tht, "26-01")], 5, TIMEOUT);
        let probe = &w.probes[0];
        probe.poll_once().await;

        tree.remove("26-01");
        assert_eq!(probe.poll_once().await, Some(Transition::Disconnected));
        assert_eq!(probe.poll_once().await, None);
        assert_eq!(probe.poll_once().await, None);

        let out = export(&w).await;
        assert_eq!(out["ext"], Measurement::Value(21.5));
        assert_eq!(out["ext_valid"], Measurement::Flag(false));
    }

    #[tokio::test]
    async fn never_seen_probe_exports_default() {
        let tree = DeviceTree::new("watch-never");
        let w = OneWireWatcher::new(&tree.root, &[sensor("ext", ProbeType::T, "28-99")], 5, TIMEOUT);
        w.probes[0].poll_once().await;

        let out = export(&w).await;
        assert_eq!(out["ext"], Measurement::Value(0.0));
        assert_eq!(out["ext_valid"], Measurement::Flag(false));
    }
}
