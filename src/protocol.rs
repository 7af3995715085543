//! GATT UUIDs, logical channels, sampling constants and the control-command
//! codec for the Muse S.
//!
//! All characteristic UUIDs belong to the Muse vendor namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358`.

use std::fmt;

use uuid::Uuid;

use crate::error::{MuseError, Result};

// ── Characteristics ───────────────────────────────────────────────────────────

const fn muse_uuid(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_4c4d_454d_96be_f03bac821358)
}

/// Bidirectional control channel.
///
/// The host writes length-prefixed ASCII commands (see [`encode_command`]) and
/// receives JSON status fragments back as 20-byte notifications.
pub const CONTROL_CHARACTERISTIC: Uuid = muse_uuid(0x273e0001);

pub const GYROSCOPE_CHARACTERISTIC: Uuid = muse_uuid(0x273e0009);
pub const ACCELEROMETER_CHARACTERISTIC: Uuid = muse_uuid(0x273e000a);

/// Battery / housekeeping telemetry, roughly once per second.
pub const TELEMETRY_CHARACTERISTIC: Uuid = muse_uuid(0x273e000b);

// ── Sampling constants ────────────────────────────────────────────────────────

/// Every sensor and control notification is exactly this long.
pub const NOTIFICATION_LEN: usize = 20;

pub const EEG_FREQUENCY: f64 = 256.0;

/// 12 samples per notification, ≈ 46.9 ms of signal at 256 Hz.
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// µV per LSB of the 12-bit EEG ADC (1000 µV over 2048 steps).
pub const EEG_SCALE: f64 = 1000.0 / 2048.0;

/// Mid-scale offset of the 12-bit EEG ADC.
pub const EEG_OFFSET: f64 = 2048.0;

pub const IMU_FREQUENCY: f64 = 52.0;
pub const IMU_SAMPLES_PER_READING: usize = 3;

/// g per LSB (±2 G over a signed 16-bit range).
pub const ACCELEROMETER_SCALE: f64 = 6.10352e-05;

/// °/s per LSB (±245 dps over a signed 16-bit range).
pub const GYROSCOPE_SCALE: f64 = 0.0074768;

// ── Logical channels ──────────────────────────────────────────────────────────

/// EEG electrodes exposed as separate characteristics once phase two has
/// unlocked the full GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Electrode {
    AuxLeft,
    Tp9,
    Af7,
    Af8,
    Tp10,
    AuxRight,
    /// Reference / driven-right-leg electrode.
    Reference,
}

impl Electrode {
    /// Electrodes that must be present for a session to stream.
    pub const PRIMARY: [Electrode; 4] = [Electrode::Tp9, Electrode::Af7, Electrode::Af8, Electrode::Tp10];

    /// Electrodes subscribed only when the caller enables auxiliary inputs.
    pub const AUXILIARY: [Electrode; 3] =
        [Electrode::AuxLeft, Electrode::AuxRight, Electrode::Reference];

    pub fn uuid(self) -> Uuid {
        match self {
            Electrode::AuxLeft => muse_uuid(0x273e0002),
            Electrode::Tp9 => muse_uuid(0x273e0003),
            Electrode::Af7 => muse_uuid(0x273e0004),
            Electrode::Af8 => muse_uuid(0x273e0005),
            Electrode::Tp10 => muse_uuid(0x273e0006),
            Electrode::AuxRight => muse_uuid(0x273e0007),
            Electrode::Reference => muse_uuid(0x273e0008),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Electrode::AuxLeft => "AUX_L",
            Electrode::Tp9 => "TP9",
            Electrode::Af7 => "AF7",
            Electrode::Af8 => "AF8",
            Electrode::Tp10 => "TP10",
            Electrode::AuxRight => "AUX_R",
            Electrode::Reference => "REF",
        }
    }
}

/// Logical tag for a notification source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Control,
    Eeg(Electrode),
    Accelerometer,
    Gyroscope,
    Telemetry,
}

impl Channel {
    /// The channel set phase two must expose before streaming can start.
    pub const REQUIRED: [Channel; 8] = [
        Channel::Control,
        Channel::Eeg(Electrode::Tp9),
        Channel::Eeg(Electrode::Af7),
        Channel::Eeg(Electrode::Af8),
        Channel::Eeg(Electrode::Tp10),
        Channel::Accelerometer,
        Channel::Gyroscope,
        Channel::Telemetry,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Channel::Control => CONTROL_CHARACTERISTIC,
            Channel::Eeg(e) => e.uuid(),
            Channel::Accelerometer => ACCELEROMETER_CHARACTERISTIC,
            Channel::Gyroscope => GYROSCOPE_CHARACTERISTIC,
            Channel::Telemetry => TELEMETRY_CHARACTERISTIC,
        }
    }

    /// Map a characteristic UUID back to its channel, `None` for anything
    /// this client does not decode (PPG, thermistor, Athena universal, …).
    pub fn from_uuid(uuid: Uuid) -> Option<Channel> {
        if uuid == CONTROL_CHARACTERISTIC {
            return Some(Channel::Control);
        }
        if uuid == ACCELEROMETER_CHARACTERISTIC {
            return Some(Channel::Accelerometer);
        }
        if uuid == GYROSCOPE_CHARACTERISTIC {
            return Some(Channel::Gyroscope);
        }
        if uuid == TELEMETRY_CHARACTERISTIC {
            return Some(Channel::Telemetry);
        }
        Electrode::PRIMARY
            .iter()
            .chain(Electrode::AUXILIARY.iter())
            .find(|e| e.uuid() == uuid)
            .map(|&e| Channel::Eeg(e))
    }

    /// `true` for channels whose packet counter is tracked for continuity.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Channel::Eeg(_) | Channel::Accelerometer | Channel::Gyroscope
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => write!(f, "CTRL"),
            Channel::Eeg(e) => write!(f, "{}", e.name()),
            Channel::Accelerometer => write!(f, "ACCEL"),
            Channel::Gyroscope => write!(f, "GYRO"),
            Channel::Telemetry => write!(f, "TELEM"),
        }
    }
}

// ── Control commands ──────────────────────────────────────────────────────────

/// Stop streaming.  Sent on every connect because the headset may still be
/// streaming for a previous host.
pub const CMD_HALT: &str = "h";
/// Resume streaming with the active preset.
pub const CMD_RESUME: &str = "d";
/// Status request; answered with `{"hn":…,"bp":…,"ts":…,"ps":…,"rc":0}`.
pub const CMD_STATUS: &str = "s";
/// Version request; answered with `{"ap":"headset","fw":…,"hw":…,"bl":…}`.
pub const CMD_VERSION: &str = "v6";
/// EEG (4 channels) + IMU + telemetry.
pub const PRESET_DEFAULT: &str = "p21";
/// EEG with the auxiliary inputs enabled.
pub const PRESET_AUX: &str = "p20";
/// EEG + PPG.
pub const PRESET_PPG: &str = "p50";

/// Largest value the device accepts in the frame length byte.
pub const MAX_DEVICE_FRAME_LEN: usize = 20;

/// One encoded control command, ready to be written to the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub token: String,
    pub bytes: Vec<u8>,
}

impl ControlFrame {
    /// `true` when the length byte is within what the headset accepts in a
    /// single write.
    pub fn fits_single_write(&self) -> bool {
        usize::from(self.bytes[0]) <= MAX_DEVICE_FRAME_LEN
    }
}

/// Encode a text command for the control characteristic.
///
/// ```text
/// byte 0     : command.len() + 1   (the +1 counts the trailing '\n')
/// bytes 1..N : ASCII command
/// byte N+1   : 0x0A
/// ```
///
/// ```
/// # use muse_s_link::protocol::encode_command;
/// let frame = encode_command("h").unwrap();
/// assert_eq!(frame.bytes, [0x02, b'h', b'\n']);
/// ```
pub fn encode_command(token: &str) -> Result<ControlFrame> {
    let invalid = |reason| MuseError::InvalidCommand {
        token: token.to_owned(),
        reason,
    };
    if token.is_empty() {
        return Err(invalid("empty token"));
    }
    if !token.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(invalid("non-printable or non-ASCII character"));
    }
    let len = u8::try_from(token.len() + 1).map_err(|_| invalid("longer than the length byte allows"))?;

    let mut bytes = Vec::with_capacity(token.len() + 2);
    bytes.push(len);
    bytes.extend_from_slice(token.as_bytes());
    bytes.push(b'\n');
    Ok(ControlFrame {
        token: token.to_owned(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_prefixed_frames() {
        assert_eq!(encode_command("s").unwrap().bytes, [0x02, b's', 0x0a]);
        assert_eq!(
            encode_command("p21").unwrap().bytes,
            [0x04, b'p', b'2', b'1', 0x0a]
        );
        assert_eq!(
            encode_command("v6").unwrap().bytes,
            [0x03, b'v', b'6', 0x0a]
        );
    }

    #[test]
    fn rejects_bad_tokens() {
        assert!(matches!(
            encode_command(""),
            Err(MuseError::InvalidCommand { .. })
        ));
        assert!(matches!(
            encode_command("p2\n"),
            Err(MuseError::InvalidCommand { .. })
        ));
        assert!(matches!(
            encode_command("µ"),
            Err(MuseError::InvalidCommand { .. })
        ));
        let too_long = "x".repeat(255);
        assert!(matches!(
            encode_command(&too_long),
            Err(MuseError::InvalidCommand { .. })
        ));
        // 254 + 1 = 255 still fits in the length byte.
        let longest = "x".repeat(254);
        let frame = encode_command(&longest).unwrap();
        assert_eq!(frame.bytes[0], 255);
        assert!(!frame.fits_single_write());
    }

    #[test]
    fn channel_uuid_mapping_is_bijective() {
        for ch in Channel::REQUIRED {
            assert_eq!(Channel::from_uuid(ch.uuid()), Some(ch));
        }
        for e in Electrode::AUXILIARY {
            assert_eq!(Channel::from_uuid(e.uuid()), Some(Channel::Eeg(e)));
        }
        assert_eq!(
            CONTROL_CHARACTERISTIC.to_string(),
            "273e0001-4c4d-454d-96be-f03bac821358"
        );
        assert_eq!(
            Electrode::Reference.uuid().to_string(),
            "273e0008-4c4d-454d-96be-f03bac821358"
        );
        // PPG characteristic is not decoded by this client.
        assert_eq!(Channel::from_uuid(muse_uuid(0x273e000f)), None);
    }
}
