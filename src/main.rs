use std::io::{self, BufRead};

use anyhow::{anyhow, Result};
use log::{error, info, warn};

use muse_s_link::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=muse_s_link=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    // Usage: muse-s-link [ADDRESS] [--aux]
    let mut address = None;
    let mut config = SessionConfig::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--aux" => config = config.with_aux(),
            other => address = Some(other.to_owned()),
        }
    }

    // ── Connect ───────────────────────────────────────────────────────────────
    let transport = BleTransport::new(&config.name_prefix, config.connect_timeout).await?;
    let mut session = Session::new(transport, config);
    let handle = session.handle();

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    // Must be installed before discovery starts.
    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping.");
            ctrl_c.stop();
        }
    });

    let address = match address {
        Some(a) => a,
        None => {
            info!("Scanning for Muse headsets …");
            let found = match session.discover().await {
                Ok(found) => found,
                Err(MuseError::Stopped) => {
                    info!("Scan interrupted.");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            found
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no Muse headset found; is it switched on?"))?
        }
    };

    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  p  – pause streaming");
    info!("  r  – resume streaming");
    info!("  i  – request device version");
    info!("  s  – request device status");
    info!("  <any other string> – send as raw command\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread and relayed to an async task so
    // no StdinLock is held across an await.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let commands = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let result = match line.as_str() {
                "" => continue,
                "q" => {
                    info!("Quit requested.");
                    commands.stop();
                    break;
                }
                "p" => commands.pause().await,
                "r" => commands.resume().await,
                "i" => commands.request_version().await,
                "s" => commands.request_status().await,
                cmd => {
                    info!("Sending command: '{cmd}'");
                    commands.send_command(cmd).await
                }
            };
            if let Err(e) = result {
                error!("Command error: {e}");
            }
        }
    });

    // ── Event printer ─────────────────────────────────────────────────────────
    let events = session.consumer();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
        if events.dropped() > 0 {
            warn!("printer fell behind and skipped {} event(s)", events.dropped());
        }
    });

    // ── Stream ────────────────────────────────────────────────────────────────
    let outcome = session.run_with_reconnect(&address).await;

    let stats = session.stats().clone();
    let identity = session.identity().cloned();
    drop(session);
    printer.await.ok();

    if let Some(id) = identity {
        info!(
            "Device: fw={} hw={} serial={}",
            id.firmware_version.as_deref().unwrap_or("?"),
            id.hardware_revision.as_deref().unwrap_or("?"),
            id.serial.as_deref().unwrap_or("?")
        );
    }
    info!(
        "Packets: {} sensor, {} control response(s); {} missed, {} late, {} malformed",
        stats.sensor_packets(),
        stats.control_responses,
        stats.missed_packets,
        stats.late_packets,
        stats.malformed_packets
    );

    match outcome {
        Ok(end) => {
            info!("Session ended: {end:?}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_event(event: &StreamEvent) {
    match event {
        // ── EEG ──────────────────────────────────────────────────────────────
        StreamEvent::Eeg(batch) => {
            let first = batch.samples.first().copied().unwrap_or(f64::NAN);
            println!(
                "[EEG] ch={:5} idx={:5}  ts={:.0} ms  sample[0]={first:+8.3} µV",
                batch.channel.to_string(),
                batch.counter,
                batch.timestamp
            );
        }

        // ── Telemetry ────────────────────────────────────────────────────────
        StreamEvent::Telemetry(batch) => {
            if let Some(t) = batch.samples.first() {
                println!(
                    "[TELEMETRY] seq={:5}  battery={:.1}%",
                    batch.counter, t.battery_percent
                );
            }
        }

        // ── IMU ──────────────────────────────────────────────────────────────
        StreamEvent::Accelerometer(batch) => {
            if let Some(s) = batch.samples.first() {
                println!(
                    "[ACCEL] seq={:5}  x={:+.5}g  y={:+.5}g  z={:+.5}g",
                    batch.counter, s.x, s.y, s.z
                );
            }
        }
        StreamEvent::Gyroscope(batch) => {
            if let Some(s) = batch.samples.first() {
                println!(
                    "[GYRO]  seq={:5}  x={:+.5}°/s  y={:+.5}°/s  z={:+.5}°/s",
                    batch.counter, s.x, s.y, s.z
                );
            }
        }

        // ── Control / session ────────────────────────────────────────────────
        StreamEvent::Control(resp) => {
            if resp.is_version() {
                println!("[DEVICE INFO] {}", resp.raw);
            } else {
                println!("[CONTROL] {}", resp.raw);
            }
        }
        StreamEvent::State(state) => info!("State: {state:?}"),
        StreamEvent::EndOfStream(ch) => info!("End of stream on {ch}"),
    }
}
