//! # muse-s-link
//!
//! Async Rust client for the [Interaxon Muse S](https://choosemuse.com/)
//! headband over Bluetooth Low Energy: the two-phase connection handshake,
//! control-command framing, JSON response reassembly and decoding of the EEG,
//! IMU and telemetry notification streams.
//!
//! ## Why two phases
//!
//! On the first connection after power-on a Muse S only exposes its control
//! characteristic.  The sensor characteristics appear after the host has sent
//! a halt, disconnected and reconnected.  [`session::Session::connect`] runs
//! both phases and only reports success once every required channel is
//! subscribed and the startup commands have been sent.
//!
//! ## Quick start
//!
//! ```no_run
//! use muse_s_link::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default();
//!     let transport = BleTransport::new(&config.name_prefix, config.connect_timeout).await?;
//!     let mut session = Session::new(transport, config);
//!
//!     let address = session.discover().await?.into_iter().next()
//!         .ok_or_else(|| anyhow::anyhow!("no headset found"))?;
//!     let events = session.consumer();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             if let StreamEvent::Eeg(batch) = event {
//!                 println!("{} #{}: {:?}", batch.channel, batch.counter, batch.samples);
//!             }
//!         }
//!     });
//!
//!     session.connect(&address).await?;
//!     session.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | Connection state machine, handshake, streaming loop and [`session::SessionHandle`] |
//! | [`transport`] | [`transport::Transport`] / [`transport::Link`] seam and the btleplug implementation |
//! | [`mock`] | Scripted in-memory transport for tests |
//! | [`pipeline`] | Non-blocking fan-out of decoded events to bounded consumer queues |
//! | [`protocol`] | GATT UUIDs, channel map, scaling constants and command framing |
//! | [`response`] | Reassembly of fragmented control responses |
//! | [`parse`] | Byte-to-sample decoders and packet counter tracking |
//! | [`types`] | Event and data types produced by the session |
//! | [`error`] | [`error::MuseError`] |

pub mod error;
pub mod mock;
pub mod parse;
pub mod pipeline;
pub mod protocol;
pub mod response;
pub mod session;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::error::{MuseError, Result};
    pub use crate::session::{
        ReconnectPolicy, Session, SessionConfig, SessionEnd, SessionHandle, SessionStats,
    };
    pub use crate::transport::{BleTransport, Link, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::pipeline::{Consumer, Pipeline};
    pub use crate::types::{
        ConnectionState, ControlResponse, DeviceIdentity, DeviceStatus, SampleBatch,
        StreamEvent, TelemetryData, XyzSample,
    };

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        Channel, Electrode, EEG_FREQUENCY, EEG_SAMPLES_PER_READING, IMU_FREQUENCY,
        IMU_SAMPLES_PER_READING,
    };
}
