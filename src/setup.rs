//! The installation's configuration, read from a [ron] file. Every field
//! has a default, so a file only needs to name what it changes:
//!
//! ```text
//! (
//!     sounds: ["loops/a.wav", "loops/b.wav"],
//!     coordinates: [(0.0, 2.0), (2.0, 0.0)],
//!     swipe_up: Throw,
//! )
//! ```

use crate::allocator::PickPolicy;
use crate::ambisonics::AmbisonicOrder;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path};

/// What an upward swipe does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwipeUpMode {
    /// Trade sound identities with another player in the hall.
    #[default]
    Swap,
    /// Trigger a one-shot on the player the device points at.
    Throw,
}

/// Installation-wide settings shared by the server and every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationSetup {
    /// WAV files, one per sound identity.
    pub sounds: Vec<String>,
    /// Fixed player positions in meters, indexed by client handle.
    pub coordinates: Vec<(f64, f64)>,
    /// Loop lengths are rounded to multiples of this many seconds. 0 disables.
    pub quantization: f64,
    /// Ambisonic order, 1 to 3.
    pub ambisonic_order: u8,
    /// HOA to binaural impulse responses. Virtual microphones if absent.
    pub decoder_filters: Option<String>,
    /// Gain after binaural decoding.
    pub output_gain: f32,
    /// How identities are picked on join and swap.
    pub pick_policy: PickPolicy,
    /// What an upward swipe does.
    pub swipe_up: SwipeUpMode,
    /// Seconds between clock messages on the bridge.
    pub clock_relay_interval: f64,
    /// Seconds of events scheduled ahead of the audio.
    pub lookahead: f64,
    /// Seconds a remote track survives without keep-alives.
    pub idle_timeout: f64,
    /// Fade of spatial sources, in seconds.
    pub source_fade: f64,
    /// Audio sample rate.
    pub sample_rate: u32,
    /// Seeds every random choice, for reproducible sessions.
    pub seed: Option<u64>,
}

impl Default for InstallationSetup {
    fn default() -> Self {
        Self {
            sounds: Vec::new(),
            coordinates: Vec::new(),
            quantization: 0.0,
            ambisonic_order: 3,
            decoder_filters: None,
            output_gain: 1.0,
            pick_policy: PickPolicy::Random,
            swipe_up: SwipeUpMode::Swap,
            clock_relay_interval: 0.01,
            lookahead: 0.1,
            idle_timeout: 6.0,
            source_fade: 1.0,
            sample_rate: 44100,
            seed: None,
        }
    }
}

/// Errors reading or checking a setup file.
#[derive(Debug)]
pub enum SetupError {
    /// Returned when the file cannot be read.
    Io(std::io::Error),
    /// Returned when the file is not valid RON for a setup.
    Ron(ron::error::SpannedError),
    /// Returned when the ambisonic order is out of range.
    Order(u8),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SetupError::Io(error) => Cow::from(format!("io error: {}", error)),
            SetupError::Ron(error) => Cow::from(format!("ron error: {}", error)),
            SetupError::Order(order) => {
                Cow::from(format!("ambisonic order {} is not in 1..=3", order))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for SetupError {}

impl From<std::io::Error> for SetupError {
    fn from(value: std::io::Error) -> Self {
        SetupError::Io(value)
    }
}

impl From<ron::error::SpannedError> for SetupError {
    fn from(value: ron::error::SpannedError) -> Self {
        SetupError::Ron(value)
    }
}

impl InstallationSetup {
    /// Reads a setup file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    /// The configured ambisonic order.
    pub fn order(&self) -> Result<AmbisonicOrder, SetupError> {
        AmbisonicOrder::from_u8(self.ambisonic_order).ok_or(SetupError::Order(self.ambisonic_order))
    }

    /// Number of sound identities, one per sound file. A setup without
    /// sound files gets one identity per player position.
    pub fn identity_count(&self) -> u32 {
        if self.sounds.is_empty() {
            self.coordinates.len() as u32
        } else {
            self.sounds.len() as u32
        }
    }
}

impl std::str::FromStr for InstallationSetup {
    type Err = SetupError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let setup: InstallationSetup = ron::de::from_str(s)?;
        setup.order()?;
        Ok(setup)
    }
}
