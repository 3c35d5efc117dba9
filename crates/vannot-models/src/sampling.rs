//! Frame sampling policies.
//!
//! A policy decides, from the zero-based index of a decoded frame, whether
//! that frame is sent to the detector. The policy is fixed for a job.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which decoded frames are sampled for detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Every decoded frame.
    #[default]
    All,
    /// The n-th, 2n-th, 3n-th ... frame (counting from 1).
    EveryNth { every: u32 },
}

impl SamplingPolicy {
    /// Sample every `n`-th frame. `n <= 1` samples every frame.
    pub fn every_nth(n: u32) -> Self {
        if n <= 1 {
            SamplingPolicy::All
        } else {
            SamplingPolicy::EveryNth { every: n }
        }
    }

    /// Sampling stride (1 for `All`).
    pub fn stride(&self) -> u64 {
        match self {
            SamplingPolicy::All => 1,
            SamplingPolicy::EveryNth { every } => u64::from((*every).max(1)),
        }
    }

    /// Whether the frame at zero-based `index` is sampled.
    pub fn includes(&self, index: u64) -> bool {
        (index + 1) % self.stride() == 0
    }

    /// Number of sampled frames in a video of `total_frames` frames.
    pub fn sampled_count(&self, total_frames: u64) -> u64 {
        total_frames / self.stride()
    }
}

impl fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingPolicy::All => write!(f, "all"),
            SamplingPolicy::EveryNth { every } => write!(f, "every:{}", every),
        }
    }
}

impl FromStr for SamplingPolicy {
    type Err = SamplingPolicyParseError;

    /// Accepts `all`, `every:N`, `every-N` or a bare `N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        if normalized == "all" {
            return Ok(SamplingPolicy::All);
        }

        let digits = normalized
            .strip_prefix("every:")
            .or_else(|| normalized.strip_prefix("every-"))
            .unwrap_or(&normalized);

        match digits.parse::<u32>() {
            Ok(n) if n >= 1 => Ok(SamplingPolicy::every_nth(n)),
            _ => Err(SamplingPolicyParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown sampling policy: {0}")]
pub struct SamplingPolicyParseError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_fifth_of_121_frames() {
        let policy = SamplingPolicy::every_nth(5);
        let sampled: Vec<u64> = (0..121).filter(|i| policy.includes(*i)).collect();
        assert_eq!(sampled.len(), 24);
        assert_eq!(sampled[0], 4);
        assert_eq!(sampled[23], 119);
        assert_eq!(policy.sampled_count(121), 24);
    }

    #[test]
    fn test_all_includes_everything() {
        let policy = SamplingPolicy::All;
        assert!((0..10).all(|i| policy.includes(i)));
        assert_eq!(policy.sampled_count(10), 10);
        assert_eq!(SamplingPolicy::every_nth(1), SamplingPolicy::All);
        assert_eq!(SamplingPolicy::every_nth(0), SamplingPolicy::All);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("all".parse::<SamplingPolicy>().unwrap(), SamplingPolicy::All);
        assert_eq!(
            "every:5".parse::<SamplingPolicy>().unwrap(),
            SamplingPolicy::EveryNth { every: 5 }
        );
        assert_eq!(
            "every-3".parse::<SamplingPolicy>().unwrap(),
            SamplingPolicy::EveryNth { every: 3 }
        );
        assert_eq!("7".parse::<SamplingPolicy>().unwrap().stride(), 7);
        assert!("every:0".parse::<SamplingPolicy>().is_err());
        assert!("sometimes".parse::<SamplingPolicy>().is_err());
    }

    #[test]
    fn test_policy_display_roundtrip() {
        let policy = SamplingPolicy::every_nth(4);
        assert_eq!(policy.to_string().parse::<SamplingPolicy>().unwrap(), policy);
    }
}
