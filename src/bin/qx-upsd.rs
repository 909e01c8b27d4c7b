//! Standalone polling daemon.
//!
//! Usage: `qx-upsd <port> [name=value|flag]...`, e.g.
//!
//! ```text
//! qx-upsd /dev/ttyUSB0 pollfreq=30 runtimecal=660,100,3600,20
//! RUST_LOG=qx_ups=debug qx-upsd /dev/ttyUSB1 subdriver=session chardelay=50
//! ```
//!
//! Claims the device, dumps everything discovered at Init, then polls
//! forever, reopening the port when the link drops.

use std::process::ExitCode;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use qx_ups::engine::PollEngine;
use qx_ups::serial::{self, SerialLink};
use qx_ups::settings::{DriverSettings, Settings};
use qx_ups::sink::MemorySink;
use qx_ups::subdriver::claim_subdriver;
use qx_ups::transport::Transport;

const DEFAULT_BAUD: u32 = 2400;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);
const TICK: Duration = Duration::from_secs(2);
const REOPEN_BACKOFF: Duration = Duration::from_secs(5);

fn open_link(path: &str, cfg: &DriverSettings) -> Result<Transport<SerialLink>, serialport::Error> {
    let baud = cfg.get_parsed("baudrate").unwrap_or(DEFAULT_BAUD);
    let link = serial::open(path, baud, EXCHANGE_TIMEOUT)?;
    Ok(match cfg.get_parsed::<u64>("chardelay") {
        Some(ms) => link.with_char_delay(Duration::from_millis(ms)),
        None => link,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: qx-upsd <port> [name=value|flag]...");
        return ExitCode::from(2);
    };
    let cfg = DriverSettings::from_args(args);

    let mut link = match open_link(&path, &cfg) {
        Ok(link) => link,
        Err(e) => {
            tracing::error!(path = %path, error = %e, "cannot open port");
            return ExitCode::FAILURE;
        }
    };

    let sub = match claim_subdriver(&mut link, qx_ups::registry(), cfg.get_value("subdriver")) {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!(error = %e, "no protocol matched");
            return ExitCode::FAILURE;
        }
    };

    let mut engine = PollEngine::new(link, sub, &cfg);
    let mut sink = MemorySink::new();
    if let Err(e) = engine.init_info(&mut sink) {
        tracing::error!(error = %e, "device discovery failed");
        return ExitCode::FAILURE;
    }

    for (name, value) in sink.variables() {
        println!("{name}: {value}");
    }
    for command in sink.commands() {
        println!("command: {command}");
    }

    loop {
        std::thread::sleep(TICK);
        if !engine.has_link() {
            match open_link(&path, &cfg) {
                Ok(link) => engine.attach(link),
                Err(e) => {
                    tracing::debug!(error = %e, "reopen failed, backing off");
                    std::thread::sleep(REOPEN_BACKOFF);
                    continue;
                }
            }
        }
        if let Err(e) = engine.update_info(&mut sink) {
            tracing::warn!(error = %e, "poll cycle failed");
        }
    }
}
