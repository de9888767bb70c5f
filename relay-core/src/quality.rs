use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown quality profile: {0}")]
pub struct UnknownQuality(String);

/// Encoding tier for a stream. The registry stores the label; anything it
/// does not recognize degrades to 720p rather than failing a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Quality {
    Q240,
    Q360,
    Q480,
    #[default]
    Q720,
    Q1080,
}

/// Resolution, video bitrate and frame rate bundled per tier. Audio is
/// fixed across tiers (128 kbps, 44.1 kHz, stereo).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub resolution: &'static str,
    pub video_bitrate_k: u32,
    pub fps: u32,
}

impl Quality {
    pub const ALL: [Quality; 5] = [
        Quality::Q240,
        Quality::Q360,
        Quality::Q480,
        Quality::Q720,
        Quality::Q1080,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Q240 => "240p",
            Quality::Q360 => "360p",
            Quality::Q480 => "480p",
            Quality::Q720 => "720p",
            Quality::Q1080 => "1080p",
        }
    }

    pub fn profile(&self) -> QualityProfile {
        match self {
            Quality::Q240 => QualityProfile {
                resolution: "426x240",
                video_bitrate_k: 400,
                fps: 24,
            },
            Quality::Q360 => QualityProfile {
                resolution: "640x360",
                video_bitrate_k: 800,
                fps: 24,
            },
            Quality::Q480 => QualityProfile {
                resolution: "854x480",
                video_bitrate_k: 1200,
                fps: 30,
            },
            Quality::Q720 => QualityProfile {
                resolution: "1280x720",
                video_bitrate_k: 2500,
                fps: 30,
            },
            Quality::Q1080 => QualityProfile {
                resolution: "1920x1080",
                video_bitrate_k: 4500,
                fps: 30,
            },
        }
    }
}

impl QualityProfile {
    /// Rate-control buffer, twice the nominal video bitrate.
    pub fn bufsize_k(&self) -> u32 {
        self.video_bitrate_k * 2
    }

    /// Constant keyframe interval, two seconds of frames.
    pub fn gop(&self) -> u32 {
        self.fps * 2
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Quality {
    type Err = UnknownQuality;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "240p" => Ok(Quality::Q240),
            "360p" => Ok(Quality::Q360),
            "480p" => Ok(Quality::Q480),
            "720p" => Ok(Quality::Q720),
            "1080p" => Ok(Quality::Q1080),
            other => Err(UnknownQuality(other.to_string())),
        }
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for quality in Quality::ALL {
            assert_eq!(quality.as_str().parse::<Quality>().unwrap(), quality);
        }
        assert!("4k".parse::<Quality>().is_err());
    }

    #[test]
    fn profile_table_matches_tiers() {
        assert_eq!(Quality::Q240.profile().resolution, "426x240");
        assert_eq!(Quality::Q240.profile().fps, 24);
        assert_eq!(Quality::Q720.profile().video_bitrate_k, 2500);
        assert_eq!(Quality::Q1080.profile().resolution, "1920x1080");
    }

    #[test]
    fn derived_encoder_values() {
        let profile = Quality::Q360.profile();
        assert_eq!(profile.bufsize_k(), 1600);
        assert_eq!(profile.gop(), 48);
        assert_eq!(Quality::Q480.profile().gop(), 60);
    }

    #[test]
    fn unknown_label_degrades_to_720p_on_load() {
        let parsed: Quality = serde_json::from_str("\"potato\"").unwrap();
        assert_eq!(parsed, Quality::Q720);
        let parsed: Quality = serde_json::from_str("\"1080p\"").unwrap();
        assert_eq!(parsed, Quality::Q1080);
    }
}
