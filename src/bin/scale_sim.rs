//! Scale simulator.
//!
//! Writes STX/ETX weight frames to a serial port at a fixed interval, for
//! exercising the service without a real indicator. Pair it with a virtual
//! null-modem (e.g. `socat -d -d pty,raw,echo=0 pty,raw,echo=0`).
//!
//! ```bash
//! cargo run --bin scale-sim -- --port /dev/pts/3 --interval-ms 3000
//! ```

use std::io::Write;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use rand::Rng;
use weighlink_lib::decoder::{encode_frame, WEIGHT_FIELD_LEN};

#[derive(Parser, Debug)]
#[command(name = "scale-sim")]
#[command(about = "Emit simulated scale frames on a serial port", long_about = None)]
struct Args {
    /// Serial port to write to
    #[arg(short, long, default_value = "/dev/ttyUSB1")]
    port: String,

    #[arg(short, long, default_value_t = 9600)]
    baud: u32,

    /// Delay between frames
    #[arg(short, long, default_value_t = 3000)]
    interval_ms: u64,

    /// Decimal indicator digit (0-7) appended to every frame
    #[arg(long, default_value_t = 3)]
    indicator: u8,

    /// Stop after this many frames (runs forever when omitted)
    #[arg(short, long)]
    count: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = simulate(Args::parse()) {
        error!("{err:#}");
        process::exit(1);
    }
}

fn simulate(args: Args) -> Result<()> {
    if args.indicator > 7 {
        bail!("indicator must be between 0 and 7, got {}", args.indicator);
    }

    let mut port = serialport::new(&args.port, args.baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_secs(1))
        .open()
        .with_context(|| format!("failed to open {}", args.port))?;

    info!(
        "writing a frame every {}ms to {} @ {} baud",
        args.interval_ms, args.port, args.baud
    );

    let mut rng = rand::thread_rng();
    let max_field = 10u32.pow(WEIGHT_FIELD_LEN as u32);
    let mut sent = 0u64;
    while args.count.map_or(true, |count| sent < count) {
        let field = format!(
            "{:0width$}",
            rng.gen_range(0..max_field),
            width = WEIGHT_FIELD_LEN
        );
        let frame = encode_frame(&field, args.indicator);
        port.write_all(&frame)
            .and_then(|_| port.flush())
            .with_context(|| format!("failed to write to {}", args.port))?;
        info!("sent {field} (indicator {})", args.indicator);

        sent += 1;
        thread::sleep(Duration::from_millis(args.interval_ms));
    }

    Ok(())
}
