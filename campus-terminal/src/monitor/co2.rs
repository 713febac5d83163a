//! CO2 sensing
//!
//! eCO2 sensors of the SGP30 class, read through the kernel IIO interface
//! (`in_concentration_co2_input`) or any file holding a ppm value. Readings
//! outside the plausible range count as failures; a sensor that keeps failing
//! for three read intervals, or cannot be reopened, is switched off.

use crate::config::MonitorConfig;
use anyhow::{anyhow, Context, Result};
use campus_protocol::Co2Status;
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Plausible eCO2 range in ppm
pub const VALID_PPM: RangeInclusive<u32> = 400..=10_000;

/// Level changes larger than this are logged
const CHANGE_LOG_PPM: u32 = 100;

const FAILING_INTERVALS: u32 = 3;

pub trait Co2Sensor: Send + Sync {
    /// Current eCO2 in ppm
    fn read_ppm(&self) -> Result<u32>;

    /// Reopen the device after a failed read
    fn reset(&self) -> Result<()> {
        Ok(())
    }
}

/// Sensor exposed as a text file holding the ppm value
pub struct FileCo2Sensor {
    path: PathBuf,
}

impl FileCo2Sensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Co2Sensor for FileCo2Sensor {
    fn read_ppm(&self) -> Result<u32> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let value: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("Not a ppm value: {:?}", raw.trim()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow!("Not a ppm value: {value}"));
        }
        Ok(value.round() as u32)
    }

    fn reset(&self) -> Result<()> {
        std::fs::metadata(&self.path)
            .map(|_| ())
            .with_context(|| format!("CO2 sensor {} is gone", self.path.display()))
    }
}

#[derive(Debug)]
struct Co2State {
    enabled: bool,
    level: Option<u32>,
    status: Co2Status,
    last_read: Option<Instant>,
    last_ok: Option<Instant>,
}

pub struct Co2Monitor {
    sensor: Option<Arc<dyn Co2Sensor>>,
    read_every: Duration,
    state: Mutex<Co2State>,
}

impl Co2Monitor {
    pub fn new(sensor: Option<Arc<dyn Co2Sensor>>, read_every: Duration) -> Self {
        let enabled = sensor.is_some();
        Self {
            sensor,
            read_every,
            state: Mutex::new(Co2State {
                enabled,
                level: None,
                status: if enabled { Co2Status::Normal } else { Co2Status::Disconnected },
                last_read: None,
                last_ok: None,
            }),
        }
    }

    /// File sensor from `co2_sensor_path`, if enabled and configured
    pub fn from_config(settings: &MonitorConfig) -> Self {
        let sensor = settings
            .co2_sensor_path
            .as_ref()
            .filter(|_| settings.co2_enabled)
            .map(|path| Arc::new(FileCo2Sensor::new(path)) as Arc<dyn Co2Sensor>);
        if sensor.is_some() {
            info!("CO2 sensor configured");
        }
        Self::new(sensor, Duration::from_secs(settings.co2_read_interval.max(1)))
    }

    pub fn level(&self) -> Option<u32> {
        self.state.lock().level
    }

    pub fn status(&self) -> Co2Status {
        self.state.lock().status
    }

    pub fn poll(&self) -> bool {
        self.poll_at(Instant::now())
    }

    /// Read the sensor if a read is due at `now`. Returns whether it was read.
    pub fn poll_at(&self, now: Instant) -> bool {
        let Some(sensor) = &self.sensor else {
            return false;
        };
        let mut state = self.state.lock();
        if !state.enabled {
            return false;
        }
        if state
            .last_read
            .is_some_and(|at| now.saturating_duration_since(at) < self.read_every)
        {
            return false;
        }
        let first_read = state.last_read.is_none();
        state.last_read = Some(now);
        if first_read {
            state.last_ok = Some(now);
        }

        let reading = sensor
            .read_ppm()
            .and_then(|ppm| {
                if VALID_PPM.contains(&ppm) {
                    Ok(ppm)
                } else {
                    Err(anyhow!("implausible reading of {ppm} ppm"))
                }
            });

        match reading {
            Ok(ppm) => {
                if state.level.is_some_and(|prev| prev.abs_diff(ppm) > CHANGE_LOG_PPM) {
                    info!(co2_ppm = ppm, "CO2 level changed");
                } else {
                    debug!(co2_ppm = ppm, "CO2 reading");
                }
                state.level = Some(ppm);
                state.status = Co2Status::Normal;
                state.last_ok = Some(now);
            }
            Err(e) => {
                warn!(error = %e, "CO2 read failed");
                state.status = Co2Status::Fault;
                let failing_for = state.last_ok.map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if let Err(e) = sensor.reset() {
                    error!(error = %e, "CO2 sensor could not be reopened, disabling it");
                    state.enabled = false;
                    state.status = Co2Status::Disconnected;
                } else if failing_for > self.read_every * FAILING_INTERVALS {
                    warn!(failing_secs = failing_for.as_secs(), "CO2 sensor keeps failing, disabling it");
                    state.enabled = false;
                    state.status = Co2Status::Disconnected;
                }
            }
        }
        true
    }
}
