//! Timestamp jitter correction
//!
//! Encoders produce timestamps that jump backwards, stall or leap ahead
//! after a reconnect. Each consumer runs its own corrector so that what a
//! player sees is monotonic and starts near zero.

use std::str::FromStr;

use crate::protocol::message::SharedMessage;

/// Largest delta between consecutive packets taken at face value
pub const MAX_JITTER_MS: i64 = 250;

/// Delta substituted for an out-of-range jump
pub const DEFAULT_FRAME_TIME_MS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterAlgorithm {
    /// Rebuild a monotonic clock, clamping jumps
    #[default]
    Full,
    /// Only shift so the first packet starts at zero
    Zero,
    /// Pass timestamps through untouched
    Off,
}

impl FromStr for JitterAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(JitterAlgorithm::Full),
            "zero" => Ok(JitterAlgorithm::Zero),
            "off" => Ok(JitterAlgorithm::Off),
            other => Err(format!("unknown jitter algorithm: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Jitter {
    last_pkt_time: i64,
    /// -1 until the first packet
    last_pkt_correct_time: i64,
}

impl Jitter {
    pub fn new() -> Self {
        Self {
            last_pkt_time: 0,
            last_pkt_correct_time: -1,
        }
    }

    /// Rewrite `msg.timestamp` in place
    pub fn correct(&mut self, msg: &mut SharedMessage, algorithm: JitterAlgorithm) {
        match algorithm {
            JitterAlgorithm::Off => {}
            JitterAlgorithm::Zero => {
                if self.last_pkt_correct_time == -1 {
                    self.last_pkt_correct_time = i64::from(msg.timestamp);
                }
                msg.timestamp = clamp_u32(i64::from(msg.timestamp) - self.last_pkt_correct_time);
            }
            JitterAlgorithm::Full => {
                if !msg.is_av() {
                    msg.timestamp = 0;
                    return;
                }

                let time = i64::from(msg.timestamp);
                let mut delta = time - self.last_pkt_time;
                if !(-MAX_JITTER_MS..=MAX_JITTER_MS).contains(&delta) {
                    delta = DEFAULT_FRAME_TIME_MS;
                }

                self.last_pkt_correct_time = (self.last_pkt_correct_time + delta).max(0);
                msg.timestamp = clamp_u32(self.last_pkt_correct_time);
                self.last_pkt_time = time;
            }
        }
    }

    /// Last corrected timestamp, 0 before any packet
    pub fn time(&self) -> u32 {
        clamp_u32(self.last_pkt_correct_time)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}
