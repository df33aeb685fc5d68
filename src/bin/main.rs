use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rdmaprobe::{
    cli::{Cli, parse_args},
    config::load_config,
    error::ProbeError,
    probe::Probe,
    report::ProbeReport,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ProbeError::Interrupted) => {
            info!("Interrupted; all processes stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            if let Some(output) = err.captured_output()
                && !output.is_empty()
            {
                eprintln!("--- captured output ---\n{output}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(args: &Cli) -> Result<(), ProbeError> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    let interrupted = register_signal_handler()?;
    let report = Probe::new(config, interrupted).run()?;
    print_report(&report, args.json)
}

/// Ctrl-C only raises a flag; the probe polls it and unwinds its scopes,
/// which stops every child in reverse start order.
fn register_signal_handler() -> Result<Arc<AtomicBool>, ProbeError> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(interrupted)
}

fn print_report(report: &ProbeReport, json: bool) -> Result<(), ProbeError> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}
