//! Switch inputs and relay output via GPIO. The `gpio` feature gates the real
//! rppal driver; without it, a mock implementation logs relay changes and
//! reports every input as open.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::SwitchSensor;
use crate::error::Result;
use crate::link::{Link, Transition};
use crate::state::{insert_flag, is_fresh, Export};
use crate::supervisor;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

/// Number of switch inputs on the bank.
pub const CHANNELS: usize = 8;

/// BCM pin for each input channel 0-7.
pub const CHANNEL_PINS: [u8; CHANNELS] = [0, 5, 6, 13, 19, 2, 21, 26];

/// BCM pin driving the relay.
pub const RELAY_PIN: u8 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// The eight input pins, read as one batch.
pub trait InputBank: Send + 'static {
    fn read_levels(&mut self) -> Result<[Level; CHANNELS]>;
}

/// The relay output pin. Active-high: `true` energises the relay.
pub trait RelayOutput: Send + 'static {
    fn set(&mut self, enabled: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Real GPIO (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct GpioInputs {
    pins: Vec<InputPin>, // channel index -> pin
}

#[cfg(feature = "gpio")]
pub(crate) struct GpioRelay {
    pin: OutputPin,
}

/// Claim the input pins and the relay pin. rppal restores the original pin
/// modes when the returned handles are dropped.
#[cfg(feature = "gpio")]
pub(crate) fn open() -> Result<(GpioInputs, GpioRelay)> {
    let gpio = Gpio::new()?;

    let mut pins = Vec::with_capacity(CHANNELS);
    for pin_num in CHANNEL_PINS {
        pins.push(gpio.get(pin_num)?.into_input());
    }

    let mut relay = gpio.get(RELAY_PIN)?.into_output();
    // Fail-safe: relay off at startup
    relay.set_low();

    info!(inputs = ?CHANNEL_PINS, relay = RELAY_PIN, "gpio switch bank initialised");
    Ok((GpioInputs { pins }, GpioRelay { pin: relay }))
}

#[cfg(feature = "gpio")]
impl InputBank for GpioInputs {
    fn read_levels(&mut self) -> Result<[Level; CHANNELS]> {
        let mut levels = [Level::High; CHANNELS];
        for (level, pin) in levels.iter_mut().zip(&self.pins) {
            *level = match pin.read() {
                rppal::gpio::Level::Low => Level::Low,
                rppal::gpio::Level::High => Level::High,
            };
        }
        Ok(levels)
    }
}

#[cfg(feature = "gpio")]
impl RelayOutput for GpioRelay {
    fn set(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        info!(relay = RELAY_PIN, "relay set {}", if enabled { "ON" } else { "OFF" });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock GPIO (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct MockInputs;

#[cfg(not(feature = "gpio"))]
pub(crate) struct MockRelay {
    pub(super) enabled: bool,
}

#[cfg(not(feature = "gpio"))]
pub(crate) fn open() -> Result<(MockInputs, MockRelay)> {
    for (channel, pin_num) in CHANNEL_PINS.iter().enumerate() {
        info!("[mock-gpio] registered switch channel={channel} (gpio {pin_num}, not wired)");
    }
    info!("[mock-gpio] switch bank initialised, relay on gpio {RELAY_PIN} (no hardware)");
    Ok((MockInputs, MockRelay { enabled: false }))
}

#[cfg(not(feature = "gpio"))]
impl InputBank for MockInputs {
    fn read_levels(&mut self) -> Result<[Level; CHANNELS]> {
        // Pulled-up inputs with nothing attached read high: every switch open.
        Ok([Level::High; CHANNELS])
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayOutput for MockRelay {
    fn set(&mut self, enabled: bool) -> Result<()> {
        let was = std::mem::replace(&mut self.enabled, enabled);
        let label = |on: bool| if on { "ON" } else { "OFF" };
        info!("[mock-gpio] relay set {} (was {})", label(enabled), label(was));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// One physical read batch: all channels share a timestamp.
struct Bank {
    closed: [bool; CHANNELS],
    updated: Option<Instant>,
    link: Link,
}

#[derive(Clone)]
pub struct SwitchWatcher {
    sensors: Arc<[SwitchSensor]>,
    bank: Arc<RwLock<Bank>>,
    relay: Arc<Mutex<Box<dyn RelayOutput>>>,
    timeout: Duration,
}

impl SwitchWatcher {
    pub fn new(sensors: &[SwitchSensor], relay: impl RelayOutput, timeout: Duration) -> Self {
        Self {
            sensors: sensors.into(),
            bank: Arc::new(RwLock::new(Bank {
                closed: [false; CHANNELS],
                updated: None,
                link: Link::default(),
            })),
            relay: Arc::new(Mutex::new(Box::new(relay))),
            timeout,
        }
    }

    /// Drive the relay immediately; independent of the polling loop.
    pub async fn set_relay(&self, enabled: bool) -> Result<()> {
        self.relay.lock().await.set(enabled)
    }

    /// Start the supervised polling loop. The input handle is shared so a
    /// restarted loop picks up the same pins.
    pub fn spawn<I: InputBank>(&self, inputs: I, interval: Duration) {
        let inputs = Arc::new(Mutex::new(inputs));
        let watcher = self.clone();
        supervisor::spawn("switches", move || {
            let watcher = watcher.clone();
            let inputs = Arc::clone(&inputs);
            async move {
                loop {
                    watcher.poll_once(&mut *inputs.lock().await).await;
                    sleep(interval).await;
                }
            }
        });
    }

    /// Read the whole bank once. Returns the availability transition, if any.
    pub async fn poll_once<I: InputBank + ?Sized>(&self, inputs: &mut I) -> Option<Transition> {
        let read = inputs.read_levels();

        let change = {
            let mut bank = self.bank.write().await;
            if let Err(e) = &read {
                if bank.link.is_available() {
                    warn!("switch poll failed: {e}");
                }
            }
            if let Ok(levels) = &read {
                // Active-low: a closed switch pulls its input to ground.
                bank.closed = levels.map(|l| l == Level::Low);
                bank.updated = Some(Instant::now());
            }
            bank.link.update(read.is_ok())
        };

        match change {
            Some(Transition::Connected) => info!("switches connected"),
            Some(Transition::Disconnected) => warn!("switches disconnected"),
            None => {}
        }
        change
    }

    pub async fn export_measurements(&self, out: &mut Export) {
        let bank = self.bank.read().await;
        let valid = is_fresh(bank.updated, Instant::now(), self.timeout);
        for sensor in self.sensors.iter() {
            let closed = bank
                .closed
                .get(usize::from(sensor.channel))
                .copied()
                .unwrap_or(false);
            insert_flag(out, &sensor.id, closed, valid);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
