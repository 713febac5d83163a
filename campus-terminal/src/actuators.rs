//! Local actuators: the alarm buzzer on a GPIO line

use crate::config::BuzzerConfig;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REPEAT_GAP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerPattern {
    Single,
    Double,
    Long,
    Sos,
    Alarm,
}

impl BuzzerPattern {
    /// `(on, off)` durations in milliseconds for one repetition
    pub fn steps(self) -> Vec<(u64, u64)> {
        match self {
            BuzzerPattern::Single => vec![(200, 100)],
            BuzzerPattern::Double => vec![(150, 100), (150, 500)],
            BuzzerPattern::Long => vec![(1000, 500)],
            BuzzerPattern::Sos => [[(200, 200); 3], [(600, 200); 3], [(200, 200); 3]].concat(),
            BuzzerPattern::Alarm => vec![(200, 200); 5],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuzzerPattern::Single => "single",
            BuzzerPattern::Double => "double",
            BuzzerPattern::Long => "long",
            BuzzerPattern::Sos => "sos",
            BuzzerPattern::Alarm => "alarm",
        }
    }
}

impl FromStr for BuzzerPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(BuzzerPattern::Single),
            "double" => Ok(BuzzerPattern::Double),
            "long" => Ok(BuzzerPattern::Long),
            "sos" => Ok(BuzzerPattern::Sos),
            "alarm" => Ok(BuzzerPattern::Alarm),
            other => Err(anyhow!("unknown buzzer pattern: {other}")),
        }
    }
}

/// Buzzer driven through a sysfs GPIO `value` file. A new pattern replaces
/// the one playing.
pub struct Buzzer {
    gpio: Option<PathBuf>,
    playing: Mutex<Option<CancellationToken>>,
}

impl Buzzer {
    pub fn new(config: &BuzzerConfig) -> Self {
        Self {
            gpio: config.gpio_value_path.clone(),
            playing: Mutex::new(None),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn play(&self, pattern: BuzzerPattern, repeat: u32) -> Result<()> {
        if let Some(path) = &self.gpio {
            if !path.exists() {
                return Err(anyhow!("buzzer GPIO {} not found", path.display()));
            }
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.playing.lock().replace(token.clone()) {
            previous.cancel();
        }

        let gpio = self.gpio.clone();
        let repeat = repeat.max(1);
        info!(pattern = pattern.as_str(), repeat, "Buzzer started");

        tokio::spawn(async move {
            if let Err(e) = run_pattern(gpio.as_ref(), pattern, repeat, &token).await {
                warn!(error = %e, "Buzzer pattern aborted");
            }
            if let Some(path) = &gpio {
                let _ = tokio::fs::write(path, "0").await;
            }
            token.cancel();
        });
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(token) = self.playing.lock().take() {
            token.cancel();
        }
    }
}

async fn run_pattern(
    gpio: Option<&PathBuf>,
    pattern: BuzzerPattern,
    repeat: u32,
    token: &CancellationToken,
) -> Result<()> {
    for round in 0..repeat {
        for (on, off) in pattern.steps() {
            set_line(gpio, true).await?;
            if pause(token, Duration::from_millis(on)).await {
                return Ok(());
            }
            set_line(gpio, false).await?;
            if pause(token, Duration::from_millis(off)).await {
                return Ok(());
            }
        }
        if round + 1 < repeat && pause(token, REPEAT_GAP).await {
            return Ok(());
        }
    }
    Ok(())
}

async fn set_line(gpio: Option<&PathBuf>, on: bool) -> Result<()> {
    match gpio {
        Some(path) => tokio::fs::write(path, if on { "1" } else { "0" })
            .await
            .with_context(|| format!("Failed to drive {}", path.display())),
        None => {
            debug!(on, "Buzzer (no GPIO configured)");
            Ok(())
        }
    }
}

/// Sleep unless cancelled; returns `true` when cancelled
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}
