//! Activity labels reported by inertial-sensor agents

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Shortest reported activity duration, in seconds
pub const MIN_DURATION_SECS: u64 = 10;
/// Longest reported activity duration (8 hours), in seconds
pub const MAX_DURATION_SECS: u64 = 8 * 60 * 60;

/// Closed set of activity labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Other,
    Standing,
    Sitting,
    #[serde(rename = "lying down")]
    LyingDown,
    Walking,
    Jogging,
    Running,
    Sprinting,
}

impl Activity {
    pub const ALL: [Activity; 8] = [
        Self::Other,
        Self::Standing,
        Self::Sitting,
        Self::LyingDown,
        Self::Walking,
        Self::Jogging,
        Self::Running,
        Self::Sprinting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::Standing => "standing",
            Self::Sitting => "sitting",
            Self::LyingDown => "lying down",
            Self::Walking => "walking",
            Self::Jogging => "jogging",
            Self::Running => "running",
            Self::Sprinting => "sprinting",
        }
    }

    /// Uniformly random label
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        *Self::ALL.choose(rng).unwrap_or(&Self::Other)
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown activity label: {}", s))
    }
}

/// Uniformly random duration between 10 seconds and 8 hours, inclusive
pub fn random_duration<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.gen_range(MIN_DURATION_SECS..=MAX_DURATION_SECS)
}
