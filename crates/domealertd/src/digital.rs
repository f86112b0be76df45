//! Serial-attached digital temperature/humidity probes.
//!
//! A microcontroller multiplexes up to four probes onto one serial line,
//! emitting one text line per probe reading:
//!
//! ```text
//! <channel>:TH;<temperature>;<humidity>\r\n
//! <channel>:T;<temperature>\r\n
//! ```
//!
//! Numbers are `<digits>.<digits>` with an optional leading `-` for sub-zero
//! ambient readings. A bare `\n` terminator is accepted as well as `\r\n`;
//! a line missing its terminator is a fragment and is dropped.
//!
//! ## Connection state machine
//!
//! ```text
//! Disconnected ──open──▶ Connected ──read error / EOF──▶ Disconnected
//!      ▲                                                     │
//!      └──────────────────── 10 s backoff ◀──────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{info, trace, warn};

use crate::config::{DigitalSensor, MeasurementType, SerialConfig};
use crate::error::{Error, Result};
use crate::link::{Link, Streak, Transition};
use crate::state::{insert_value, ChannelState, Export};
use crate::supervisor;

/// Number of probe channels multiplexed on the serial line.
pub const CHANNELS: usize = 4;

/// Delay between reconnection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Line protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub channel: usize,
    pub temperature: f64,
    pub humidity: Option<f64>,
}

/// Parse one line from the probe board. Returns `None` for anything that
/// does not match either line format exactly, including fragments.
pub fn parse_line(line: &str) -> Option<Frame> {
    let body = line.strip_suffix('\n')?;
    let body = body.strip_suffix('\r').unwrap_or(body);

    let (channel, payload) = body.split_once(':')?;
    let channel = match channel.as_bytes() {
        [c @ b'0'..=b'3'] => usize::from(c - b'0'),
        _ => return None,
    };

    // Longest format first.
    if let Some(fields) = payload.strip_prefix("TH;") {
        let (temperature, humidity) = fields.split_once(';')?;
        return Some(Frame {
            channel,
            temperature: parse_decimal(temperature)?,
            humidity: Some(parse_decimal(humidity)?),
        });
    }

    let temperature = payload.strip_prefix("T;")?;
    Some(Frame {
        channel,
        temperature: parse_decimal(temperature)?,
        humidity: None,
    })
}

/// `[-]<digits>.<digits>`; anything else (exponents, `inf`, stray bytes) is
/// rejected before it can reach `f64::from_str`.
fn parse_decimal(s: &str) -> Option<f64> {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = unsigned.split_once('.')?;
    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int) || !all_digits(frac) {
        return None;
    }
    s.parse().ok()
}

// ---------------------------------------------------------------------------
// Serial connection
// ---------------------------------------------------------------------------

/// Opens the byte stream carrying probe lines.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + Unpin + Send + 'static;

    fn describe(&self) -> &str;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// Real serial port, 8N1 at the configured baud rate.
pub struct SerialConnector {
    path: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(cfg: &SerialConfig) -> Self {
        Self {
            path: cfg.port.clone(),
            baud: cfg.baud,
        }
    }
}

impl Connector for SerialConnector {
    type Stream = SerialStream;

    fn describe(&self) -> &str {
        &self.path
    }

    fn connect(&self) -> impl Future<Output = Result<SerialStream>> + Send {
        let builder = tokio_serial::new(&self.path, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One);
        async move { Ok(builder.open_native_async()?) }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

struct Readings {
    /// Indexed by channel, then measurement type. Only configured pairs
    /// get a slot; fields without a consumer are dropped on arrival.
    slots: [[Option<ChannelState>; MeasurementType::COUNT]; CHANNELS],
    link: Link,
}

#[derive(Clone)]
pub struct DigitalWatcher {
    sensors: Arc<[DigitalSensor]>,
    readings: Arc<RwLock<Readings>>,
    timeout: Duration,
}

impl DigitalWatcher {
    pub fn new(sensors: &[DigitalSensor], window: usize, timeout: Duration) -> Self {
        let mut slots: [[Option<ChannelState>; MeasurementType::COUNT]; CHANNELS] =
            std::array::from_fn(|_| std::array::from_fn(|_| None));
        for sensor in sensors {
            if let Some(channel) = slots.get_mut(usize::from(sensor.channel)) {
                channel[sensor.kind.index()].get_or_insert_with(|| ChannelState::new(window));
            }
        }

        Self {
            sensors: sensors.into(),
            readings: Arc::new(RwLock::new(Readings {
                slots,
                link: Link::default(),
            })),
            timeout,
        }
    }

    /// Start the supervised connection loop. Without a call to this the
    /// watcher stays inert and every digital sensor reports invalid.
    pub fn spawn<C: Connector>(&self, connector: C, read_timeout: Duration) {
        let connector = Arc::new(connector);
        let watcher = self.clone();
        supervisor::spawn("digital", move || {
            watcher.clone().run(Arc::clone(&connector), read_timeout)
        });
    }

    /// Connect, read until the stream fails, back off, repeat. Never returns.
    pub async fn run<C: Connector>(self, connector: Arc<C>, read_timeout: Duration) {
        let mut streak = Streak::default();
        loop {
            self.cycle(&*connector, read_timeout, &mut streak).await;
            sleep(RETRY_DELAY).await;
        }
    }

    /// One connection attempt and, if it opens, the session that follows.
    /// Returns whether the error that ended it was logged, which happens only
    /// for the first error of a failing streak.
    async fn cycle<C: Connector>(
        &self,
        connector: &C,
        read_timeout: Duration,
        streak: &mut Streak,
    ) -> bool {
        let port = connector.describe();
        let result = match connector.connect().await {
            Ok(stream) => {
                info!(port = %port, "connected to digital sensor board");
                streak.reset();
                self.set_connected(true).await;
                self.session(stream, read_timeout).await
            }
            Err(e) => Err(e),
        };

        let Err(e) = result else {
            return false;
        };
        self.set_connected(false).await;
        let first = streak.fail();
        if first {
            warn!(port = %port, "digital sensors: {e}; will retry in {}s", RETRY_DELAY.as_secs());
        }
        first
    }

    /// Read and ingest lines until the stream reports an error.
    async fn session<R: AsyncRead + Unpin>(&self, stream: R, read_timeout: Duration) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        // The first line may have been only partially received.
        read_line(&mut reader, &mut buf, read_timeout).await?;

        loop {
            if let Some(line) = read_line(&mut reader, &mut buf, read_timeout).await? {
                self.ingest(&line, Instant::now()).await;
            }
        }
    }

    async fn set_connected(&self, connected: bool) -> Option<Transition> {
        self.readings.write().await.link.update(connected)
    }

    /// Apply one protocol line. Returns whether the line was recognised.
    pub async fn ingest(&self, line: &str, now: Instant) -> bool {
        let Some(frame) = parse_line(line) else {
            trace!(line = ?line, "discarding unrecognised serial line");
            return false;
        };

        let mut readings = self.readings.write().await;
        let slots = &mut readings.slots[frame.channel];
        if let Some(slot) = &mut slots[MeasurementType::Temperature.index()] {
            slot.record(frame.temperature, now);
        }
        if let (Some(humidity), Some(slot)) =
            (frame.humidity, &mut slots[MeasurementType::Humidity.index()])
        {
            slot.record(humidity, now);
        }
        true
    }

    pub async fn export_measurements(&self, out: &mut Export) {
        let readings = self.readings.read().await;
        let now = Instant::now();
        let connected = readings.link.is_available();

        for sensor in self.sensors.iter() {
            let slot = readings
                .slots
                .get(usize::from(sensor.channel))
                .and_then(|channel| channel[sensor.kind.index()].as_ref());
            let (value, valid) = match slot {
                Some(s) => (s.value(), connected && s.is_fresh(now, self.timeout)),
                None => (0.0, false),
            };
            insert_value(out, &sensor.id, value, valid);
        }
    }
}

/// Read one `\n`-terminated line. A read timeout is not an error: whatever
/// partial data arrived is dropped and `None` returned, so the caller simply
/// tries again. A timeout of zero waits indefinitely.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    read_timeout: Duration,
) -> Result<Option<String>> {
    buf.clear();
    let read = if read_timeout.is_zero() {
        reader.read_until(b'\n', buf).await
    } else {
        match tokio::time::timeout(read_timeout, reader.read_until(b'\n', buf)).await {
            Ok(read) => read,
            Err(_) => return Ok(None),
        }
    };

    match read? {
        0 => Err(Error::StreamClosed),
        _ => Ok(Some(String::from_utf8_lossy(buf).into_owned())),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
