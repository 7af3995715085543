//! Binary decoders for Muse S sensor notifications.
//!
//! All decoders are pure: they read a borrowed payload, never mutate it, and
//! take the arrival timestamp from the caller.  Each sensor notification is a
//! fixed 20-byte frame whose first two bytes are a big-endian packet counter.
//!
//! | Function | Sensor | Format |
//! |---|---|---|
//! | [`decode_eeg`] | EEG | 12 × 12-bit BE packed, (raw − 2048) × 1000/2048 µV |
//! | [`decode_imu`] | Accel / Gyro | 3 × XYZ i16 BE, scaled per channel |
//! | [`decode_telemetry`] | Battery | u16 BE ÷ 100 → %, opaque tail |

use crate::error::{MuseError, Result};
use crate::protocol::{
    Channel, Electrode, ACCELEROMETER_SCALE, EEG_OFFSET, EEG_SAMPLES_PER_READING, EEG_SCALE,
    GYROSCOPE_SCALE, IMU_SAMPLES_PER_READING, NOTIFICATION_LEN,
};
use crate::types::{SampleBatch, TelemetryData, XyzSample};

fn check_len(data: &[u8], channel: Channel) -> Result<()> {
    if data.len() != NOTIFICATION_LEN {
        return Err(MuseError::MalformedPacket {
            channel,
            reason: format!("expected {NOTIFICATION_LEN} bytes, got {}", data.len()),
        });
    }
    Ok(())
}

fn read_counter(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Unpack the twelve 12-bit raw values from a 20-byte EEG payload.
///
/// Sample `i` starts at `byte_idx = 2 + i*3/2`:
/// ```text
/// even i : (b[idx] << 4) | (b[idx+1] >> 4)
/// odd  i : ((b[idx] & 0x0F) << 8) | b[idx+1]
/// ```
pub fn unpack_eeg_raw(data: &[u8]) -> Result<(u16, [u16; EEG_SAMPLES_PER_READING])> {
    check_len(data, Channel::Eeg(Electrode::Tp9))?;
    let mut raw = [0u16; EEG_SAMPLES_PER_READING];
    for (i, slot) in raw.iter_mut().enumerate() {
        let idx = 2 + (i * 3) / 2;
        let (hi, lo) = (data[idx] as u16, data[idx + 1] as u16);
        *slot = if i % 2 == 0 {
            (hi << 4) | (lo >> 4)
        } else {
            ((hi & 0x0F) << 8) | lo
        };
    }
    Ok((read_counter(data), raw))
}

/// Convert one 12-bit EEG value to µV.
pub fn eeg_microvolts(raw: u16) -> f64 {
    (raw as f64 - EEG_OFFSET) * EEG_SCALE
}

/// Decode an EEG notification into a batch of 12 µV samples.
pub fn decode_eeg(data: &[u8], channel: Channel, timestamp: f64) -> Result<SampleBatch<f64>> {
    if !matches!(channel, Channel::Eeg(_)) {
        return Err(MuseError::MalformedPacket {
            channel,
            reason: "EEG decoder applied to a non-EEG channel".into(),
        });
    }
    check_len(data, channel)?;
    let (counter, raw) = unpack_eeg_raw(data)?;
    Ok(SampleBatch {
        channel,
        counter,
        timestamp,
        samples: raw.iter().map(|&r| eeg_microvolts(r)).collect(),
    })
}

// ── IMU ───────────────────────────────────────────────────────────────────────

/// Raw signed XYZ triples from an accelerometer or gyroscope payload, laid out
/// at byte offsets 2, 8 and 14.
pub fn unpack_imu_raw(data: &[u8]) -> Result<(u16, [[i16; 3]; IMU_SAMPLES_PER_READING])> {
    check_len(data, Channel::Accelerometer)?;
    let read = |off: usize| i16::from_be_bytes([data[off], data[off + 1]]);
    let mut out = [[0i16; 3]; IMU_SAMPLES_PER_READING];
    for (s, xyz) in out.iter_mut().enumerate() {
        let off = 2 + s * 6;
        *xyz = [read(off), read(off + 2), read(off + 4)];
    }
    Ok((read_counter(data), out))
}

/// Decode an IMU notification, scaling to g (accelerometer) or °/s (gyroscope)
/// according to `channel`.
pub fn decode_imu(
    data: &[u8],
    channel: Channel,
    timestamp: f64,
) -> Result<SampleBatch<XyzSample>> {
    let scale = match channel {
        Channel::Accelerometer => ACCELEROMETER_SCALE,
        Channel::Gyroscope => GYROSCOPE_SCALE,
        other => {
            return Err(MuseError::MalformedPacket {
                channel: other,
                reason: "IMU decoder applied to a non-IMU channel".into(),
            })
        }
    };
    check_len(data, channel)?;
    let (counter, raw) = unpack_imu_raw(data)?;
    Ok(SampleBatch {
        channel,
        counter,
        timestamp,
        samples: raw
            .iter()
            .map(|[x, y, z]| XyzSample {
                x: *x as f64 * scale,
                y: *y as f64 * scale,
                z: *z as f64 * scale,
            })
            .collect(),
    })
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// Decode a telemetry notification.
///
/// | Bytes | Field |
/// |---|---|
/// | 0–1 | counter (not sequence-checked) |
/// | 2–3 | battery, u16 BE ÷ 100 → % |
/// | 4.. | opaque, preserved in `raw_tail` |
pub fn decode_telemetry(data: &[u8], timestamp: f64) -> Result<SampleBatch<TelemetryData>> {
    if data.len() < 4 {
        return Err(MuseError::MalformedPacket {
            channel: Channel::Telemetry,
            reason: format!("expected at least 4 bytes, got {}", data.len()),
        });
    }
    Ok(SampleBatch {
        channel: Channel::Telemetry,
        counter: read_counter(data),
        timestamp,
        samples: vec![TelemetryData {
            battery_percent: u16::from_be_bytes([data[2], data[3]]) as f64 / 100.0,
            raw_tail: data[4..].to_vec(),
        }],
    })
}

// ── Packet counter continuity ─────────────────────────────────────────────────

/// A backward step of at most this many packets is treated as late delivery.
pub const LATE_TOLERANCE: u16 = 16;

/// Forward wrapping distance at or beyond which a counter is a discontinuity
/// rather than a gap or a 16-bit rollover.
const WRAP_WINDOW: u16 = 0x1000;

/// How a packet counter relates to the previous one on the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    First,
    Contiguous,
    Duplicate,
    Gap { missed: u16 },
    /// Counter rolled over 0xFFFF → 0; `missed` packets were skipped across it.
    Wrapped { missed: u16 },
    Late { behind: u16 },
    Discontinuity { from: u16, to: u16 },
}

/// Per-channel packet counter tracker.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, counter: u16) -> Continuity {
        let Some(last) = self.last else {
            self.last = Some(counter);
            return Continuity::First;
        };
        let forward = counter.wrapping_sub(last);
        let behind = last.wrapping_sub(counter);
        if forward == 0 {
            return Continuity::Duplicate;
        }
        if behind <= LATE_TOLERANCE {
            // Anchor stays put so later packets are compared against the newest.
            return Continuity::Late { behind };
        }
        if forward >= WRAP_WINDOW {
            self.last = Some(counter);
            return Continuity::Discontinuity {
                from: last,
                to: counter,
            };
        }
        self.last = Some(counter);
        if counter < last {
            Continuity::Wrapped { missed: forward - 1 }
        } else if forward == 1 {
            Continuity::Contiguous
        } else {
            Continuity::Gap { missed: forward - 1 }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
