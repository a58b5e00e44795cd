use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::Result;
use log::{error, info};

use melomind_rs::config::CoreConfig;
use melomind_rs::melomind_client::{MelomindClient, MelomindClientConfig};
use melomind_rs::recording::JsonFileSink;
use melomind_rs::types::{AcquisitionEvent, ConnectionEvent, HeadsetEvent, OadEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=melomind_rs=debug cargo run -- config.json
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    // Usage: melomind [config.json] [firmware-dir]
    let mut args = std::env::args().skip(1);
    let core = match args.next() {
        Some(path) => CoreConfig::load(&path)?,
        None => CoreConfig::default(),
    };
    let config = MelomindClientConfig {
        core,
        firmware_dir: args.next().map(PathBuf::from),
        ..MelomindClientConfig::default()
    };

    let (mut rx, handle) = MelomindClient::new(config).start().await?;
    handle.connect(None).await?;

    info!("Commands (type + Enter):");
    info!("  c [name] – connect (to any melomind when no name is given)");
    info!("  d        – disconnect");
    info!("  s / sq   – start streaming (sq: with quality checking)");
    info!("  x        – stop streaming");
    info!("  b        – read battery");
    info!("  a / A    – start / stop accelerometer");
    info!("  r / R    – start / stop recording");
    info!("  e [dir]  – export the recording as JSON");
    info!("  u        – install the newest firmware");
    info!("  q        – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on an OS thread so the StdinLock is never held across an
    // await point.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
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

    let handle_cmd = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let mut words = line.split_whitespace();
            let Some(cmd) = words.next() else { continue };
            let arg = words.next();
            let result = match cmd {
                "q" => {
                    info!("Quit requested.");
                    handle_cmd.shutdown();
                    break;
                }
                "c" => handle_cmd.connect(arg).await,
                "d" => handle_cmd.disconnect().await,
                "s" => handle_cmd.start_stream(false).await,
                "sq" => handle_cmd.start_stream(true).await,
                "x" => handle_cmd.stop_stream().await,
                "b" => handle_cmd.read_battery().await,
                "a" => handle_cmd.start_accelerometer().await,
                "A" => handle_cmd.stop_accelerometer().await,
                "r" => handle_cmd.start_recording().await,
                "R" => handle_cmd.stop_recording().await,
                "e" => {
                    let sink = JsonFileSink::new(arg.unwrap_or("sessions"));
                    handle_cmd.export_recording(sink).await.map(|record| {
                        info!("Recording saved to {}", record.0);
                    })
                }
                "u" => handle_cmd.start_firmware_update().await,
                other => {
                    error!("Unknown command '{other}'");
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!("{cmd}: {e}");
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = rx.recv().await {
        match event {
            HeadsetEvent::Connection(event) => match event {
                ConnectionEvent::StateChanged(state) => info!("State: {state:?}"),
                ConnectionEvent::Established(identity) => {
                    info!(
                        "✅  Connected: {} serial={} hw={} fw={}",
                        identity.product_name.as_deref().unwrap_or("?"),
                        identity.serial_number.as_deref().unwrap_or("?"),
                        identity.hardware_version.as_deref().unwrap_or("?"),
                        identity.firmware_version.as_deref().unwrap_or("?"),
                    );
                }
                ConnectionEvent::Failed(e) => error!("Connection failed: {e} (code {})", e.code()),
                ConnectionEvent::Lost(e) => error!("❌  Connection lost: {e} (code {})", e.code()),
                ConnectionEvent::BatteryLevel(level) => println!("[BATTERY] {level:.1}%"),
                ConnectionEvent::UpdateAvailable(version) => info!("Firmware {version} available, type 'u' to install"),
                ConnectionEvent::AudioConnected(name) => info!("Audio connected: {name}"),
                ConnectionEvent::AudioDisconnected => info!("Audio disconnected"),
                ConnectionEvent::AudioFailed(e) => error!("Audio failed: {e}"),
            },

            // ── Firmware update ───────────────────────────────────────────────
            HeadsetEvent::Oad(event) => match event {
                OadEvent::Progress(p) => println!("[OAD] {:5.1}%", p * 100.0),
                OadEvent::ReadyToUpdate => info!("Headset ready, sending firmware"),
                OadEvent::Completed => info!("Transfer complete, waiting for the headset to reboot"),
                OadEvent::RebootRequired => {
                    info!("Switch Bluetooth off and on again to finish the update")
                }
                OadEvent::RadioRestarted => info!("Bluetooth restarted, reconnecting"),
                OadEvent::Failed(e) => error!("Firmware update failed: {e} (code {})", e.code()),
            },

            // ── EEG ──────────────────────────────────────────────────────────
            HeadsetEvent::Acquisition(AcquisitionEvent::Packet(packet)) => {
                let firsts: Vec<String> = packet
                    .electrodes
                    .iter()
                    .zip(&packet.channels)
                    .map(|(e, ch)| format!("{}={:+.2}µV", e.label(), ch.first().copied().unwrap_or(f32::NAN) * 1e6))
                    .collect();
                println!(
                    "[EEG] seq={:5}  ts={} ms  lost={}  {}",
                    packet.sequence,
                    packet.timestamp_ms,
                    packet.nan_count(),
                    firsts.join("  ")
                );
                if let Some(q) = &packet.qualities {
                    println!("[QUALITY] {q:?}");
                }
            }
            HeadsetEvent::Acquisition(AcquisitionEvent::Saturation(code)) => println!("[SATURATION] {code}"),
            HeadsetEvent::Acquisition(AcquisitionEvent::Accelerometer(samples)) => {
                if let Some(s) = samples.first() {
                    println!("[ACCEL] n={}  x={:+.3}  y={:+.3}  z={:+.3}", samples.len(), s.x, s.y, s.z);
                }
            }
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
