use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use stepper_probe_rs::{
    logging, BleConnector, CaptureSignalFetcher, FetchStep, Probe,
};

/// Upper bound on transport operations per capture fetch cycle, so a
/// misbehaving device cannot spin the loop forever.
const MAX_FETCH_STEPS: usize = 1000;

const STATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "stepper-probe",
    about = "Connect to a Stepper Probe and monitor it"
)]
struct Args {
    /// Device name (STP-XXXXXXXXXXXX), nickname, or MAC address
    device: Option<String>,
    /// Scan for advertising probes and exit
    #[arg(long)]
    scan: bool,
    /// Number of state reports to stream
    #[arg(long, default_value_t = 10)]
    states: usize,
    /// Also read the current/time/distance histograms
    #[arg(long)]
    histograms: bool,
    /// Also fetch one capture signal
    #[arg(long)]
    capture: bool,
    /// Full steps per user unit for the histogram speed axis
    #[arg(long, default_value_t = 1.0)]
    steps_per_unit: f64,
    /// Print records as JSON lines instead of text
    #[arg(long)]
    json: bool,
}

fn main() {
    logging::init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let connector = BleConnector::default();

    if args.scan {
        println!("Scanning for probes...");
        let probes = connector.scan().context("scan failed")?;
        for probe in &probes {
            if probe.nickname.is_empty() {
                println!("{}  {}", probe.address, probe.name);
            } else {
                println!("{}  {}  ({})", probe.address, probe.name, probe.nickname);
            }
        }
        println!("{} probe(s) found.", probes.len());
        return Ok(());
    }

    let target = args
        .device
        .as_deref()
        .context("device name required unless --scan is given")?;
    let mut probe = Probe::connect(&connector, target)
        .with_context(|| format!("failed to connect to {target}"))?;

    println!("{}", probe.info());

    if args.states > 0 {
        probe.subscribe_states()?;
        for _ in 0..args.states {
            let state = probe.next_state(STATE_TIMEOUT)?;
            if args.json {
                println!("{}", serde_json::to_string(&state)?);
            } else {
                println!("{state}");
            }
        }
    }

    if args.histograms {
        let current = probe.read_current_histogram(args.steps_per_unit)?;
        let time = probe.read_time_histogram(args.steps_per_unit)?;
        let distance = probe.read_distance_histogram(args.steps_per_unit)?;
        for histogram in [&current, &time, &distance] {
            if args.json {
                println!("{}", serde_json::to_string(histogram)?);
            } else {
                println!(
                    "{:?} histogram (bucket width {}): {:?}",
                    histogram.kind, histogram.bucket_width, histogram.heights
                );
            }
        }
    }

    if args.capture {
        let mut fetcher = CaptureSignalFetcher::new(probe.info().clone());
        let mut signal = None;
        for _ in 0..MAX_FETCH_STEPS {
            match fetcher.step(&mut probe)? {
                FetchStep::Pending => continue,
                FetchStep::Ready(s) => {
                    signal = Some(s);
                    break;
                }
            }
        }
        let signal = signal.context("capture fetch did not complete")?;
        if args.json {
            println!("{}", serde_json::to_string(&signal)?);
        } else {
            println!(
                "Capture signal: {} samples over {:.4}s",
                signal.len(),
                signal.times_sec.last().copied().unwrap_or(0.0)
            );
        }
    }

    probe.disconnect();
    Ok(())
}
