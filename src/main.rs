use std::error::Error;
use std::num::NonZeroU16;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};

use nrf_legacy_dfu::config::suggested_prn;
use nrf_legacy_dfu::{
    scan_for_devices, BtleplugTransport, Callbacks, CancelSignal, DfuError, DfuOptions, DfuSession, Target,
};

/// Update application firmware on nRF Legacy DFU targets over BLE
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Firmware update package path
    pkg: PathBuf,

    /// BLE address; skips the device picker
    #[arg(short, long)]
    addr: Option<String>,

    /// Device picker scan time in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Packets between receipt notifications (platform default when omitted)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    prn: Option<u16>,

    /// More output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

async fn pick_device(transport: &BtleplugTransport, scan_time: Duration) -> Result<Target, Box<dyn Error>> {
    println!("Scanning for BLE devices ({}s)...", scan_time.as_secs());
    let devices = scan_for_devices(transport, scan_time).await?;
    if devices.is_empty() {
        return Err("no named BLE devices found".into());
    }
    for (i, d) in devices.iter().enumerate() {
        println!("  [{}] {} ({})", i + 1, d.display_name(), d.address);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("Select device [1-{}]:", devices.len());
        let line = lines.next_line().await?.ok_or("no device selected")?;
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=devices.len()).contains(&n) => return Ok(Target::Identity(devices[n - 1].clone())),
            _ => println!("Invalid selection: {}", line.trim()),
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let transport = BtleplugTransport::new().await?;
    let target = match args.addr {
        Some(addr) => Target::Address(addr),
        None => pick_device(&transport, Duration::from_secs(args.timeout)).await?,
    };
    let prn = args.prn.and_then(NonZeroU16::new).unwrap_or_else(suggested_prn);

    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}%")?);
    let (on_progress, on_log) = (bar.clone(), bar.clone());
    let callbacks = Callbacks::default()
        .on_progress(move |pct| on_progress.set_position(pct.round() as u64))
        .on_log(move |msg| on_log.println(msg));

    let cancel = CancelSignal::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let result = DfuSession::new(&transport, DfuOptions::with_prn(prn))
        .callbacks(callbacks)
        .cancel_signal(cancel)
        .run(&args.pkg, target)
        .await;
    bar.finish_and_clear();
    Ok(result?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args).await {
        Ok(()) => {
            println!("Firmware update complete.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("DFU failed: {e}");
            if e.downcast_ref::<DfuError>().is_some_and(DfuError::is_connectivity) {
                eprintln!("Check that the device is powered and in range, then retry.");
            }
            ExitCode::FAILURE
        }
    }
}
