use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound accepted for the moving window knob.
pub const MAX_MOVING_WINDOW_SIZE: usize = 16;
/// Default batch cadence, one 30 fps frame.
pub const DEFAULT_DURATION: Duration = Duration::from_micros(33_333);

/// Validated coordinator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CoordinatorConfigFile", into = "CoordinatorConfigFile")]
pub struct CoordinatorConfig {
    depth: usize,
    moving_window_size: usize,
    duration: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            moving_window_size: 1,
            duration: DEFAULT_DURATION,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(
        depth: usize,
        moving_window_size: usize,
        duration: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            depth,
            moving_window_size,
            duration,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cadence of `depth` frames at `fps_num / fps_den`.
    pub fn for_frame_rate(
        depth: usize,
        moving_window_size: usize,
        fps_num: u32,
        fps_den: u32,
    ) -> Result<Self, ConfigError> {
        if fps_num == 0 || fps_den == 0 {
            return Err(ConfigError::InvalidFrameRate { fps_num, fps_den });
        }
        let frame_ns = 1_000_000_000u128 * u128::from(fps_den) / u128::from(fps_num);
        let total_ns = frame_ns.saturating_mul(depth as u128);
        let duration = Duration::from_nanos(total_ns.min(u128::from(u64::MAX)) as u64);
        Self::new(depth, moving_window_size, duration)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Parse)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        validate_moving_window(self.moving_window_size, self.depth)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn moving_window_size(&self) -> usize {
        self.moving_window_size
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn with_moving_window_size(mut self, size: usize) -> Result<Self, ConfigError> {
        validate_moving_window(size, self.depth)?;
        self.moving_window_size = size;
        Ok(self)
    }

    /// Knobs whose values differ between `self` and `other`.
    pub fn changed_knobs(&self, other: &CoordinatorConfig) -> Vec<ConfigKnob> {
        let mut knobs = Vec::new();
        if self.depth != other.depth {
            knobs.push(ConfigKnob::Depth);
        }
        if self.moving_window_size != other.moving_window_size {
            knobs.push(ConfigKnob::MovingWindowSize);
        }
        if self.duration != other.duration {
            knobs.push(ConfigKnob::Duration);
        }
        knobs
    }
}

fn validate_moving_window(size: usize, depth: usize) -> Result<(), ConfigError> {
    if size == 0 || size > MAX_MOVING_WINDOW_SIZE {
        return Err(ConfigError::MovingWindowOutOfRange(size));
    }
    if size > depth {
        return Err(ConfigError::MovingWindowExceedsDepth {
            moving_window_size: size,
            depth,
        });
    }
    Ok(())
}

/// On-disk shape of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CoordinatorConfigFile {
    depth: usize,
    moving_window_size: usize,
    duration_us: u64,
}

impl TryFrom<CoordinatorConfigFile> for CoordinatorConfig {
    type Error = ConfigError;

    fn try_from(file: CoordinatorConfigFile) -> Result<Self, Self::Error> {
        CoordinatorConfig::new(
            file.depth,
            file.moving_window_size,
            Duration::from_micros(file.duration_us),
        )
    }
}

impl From<CoordinatorConfig> for CoordinatorConfigFile {
    fn from(config: CoordinatorConfig) -> Self {
        Self {
            depth: config.depth,
            moving_window_size: config.moving_window_size,
            duration_us: config.duration.as_micros().min(u128::from(u64::MAX)) as u64,
        }
    }
}

/// Named options exposed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKnob {
    Depth,
    MovingWindowSize,
    Duration,
}

impl ConfigKnob {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKnob::Depth => "depth",
            ConfigKnob::MovingWindowSize => "moving_window_size",
            ConfigKnob::Duration => "duration",
        }
    }

    pub fn class(self) -> ConfigKnobClass {
        match self {
            ConfigKnob::MovingWindowSize => ConfigKnobClass::Hot,
            ConfigKnob::Depth | ConfigKnob::Duration => ConfigKnobClass::Restart,
        }
    }
}

impl fmt::Display for ConfigKnob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a knob may change while the coordinator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigKnobClass {
    Hot,
    Restart,
}

/// Errors surfaced while building or changing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("depth must be at least 1")]
    ZeroDepth,
    #[error("duration must be greater than zero")]
    ZeroDuration,
    #[error("moving window size {0} outside 1..=16")]
    MovingWindowOutOfRange(usize),
    #[error("moving window size {moving_window_size} cannot be larger than depth {depth}")]
    MovingWindowExceedsDepth {
        moving_window_size: usize,
        depth: usize,
    },
    #[error("invalid frame rate {fps_num}/{fps_den}")]
    InvalidFrameRate { fps_num: u32, fps_den: u32 },
    #[error("knob `{knob}` cannot change while the coordinator is running")]
    RequiresRestart { knob: ConfigKnob },
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Parse(#[source] serde_json::Error),
}
