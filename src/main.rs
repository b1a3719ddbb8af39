mod config;
mod console;
mod credential;
mod elevation;
mod lock;
mod sampler;
mod session;
mod signals;
mod status;
#[cfg(test)]
mod testutil;
mod watchdog;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Samples GPU power with `powermetrics` under sudo every 2 seconds and keeps
/// the latest reading in /tmp/gpu_power.txt until stopped.
#[derive(Parser, Debug)]
#[command(name = "gpu-probe", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "gpu-probe.toml")]
    config: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the status snapshot of a running probe and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (every cycle, elevation details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "gpu_probe=debug"
    } else if cli.quiet {
        "gpu_probe=warn"
    } else {
        "gpu_probe=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    // Exit explicitly: a pending stdin read would otherwise hold the runtime open.
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    let settings = session::SessionSettings::from_config(&config);

    if cli.status {
        return print_status(settings.status_file.as_deref());
    }

    if cli.dry_run {
        println!("gpu-probe v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file:      {}", cli.config.display());
        println!(
            "Elevation:        {} {}",
            config.elevation.program,
            config.elevation.args.join(" ")
        );
        println!(
            "Sampling command: {} {}",
            sampler::SAMPLE_PROGRAM,
            sampler::SAMPLE_ARGS.join(" ")
        );
        println!("Output file:      {}", settings.output_file.display());
        println!("Interval:         {}s", settings.interval.as_secs());
        match settings.sample_timeout {
            Some(t) => println!("Sample timeout:   {}s", t.as_secs()),
            None => println!("Sample timeout:   none"),
        }
        println!(
            "Give up after:    {}",
            match settings.max_consecutive_failures {
                0 => "never".to_string(),
                n => format!("{n} failed cycles in a row"),
            }
        );
        match &settings.status_file {
            Some(p) => println!("Status file:      {}", p.display()),
            None => println!("Status file:      disabled"),
        }
        println!("Dry run mode, not sampling.");
        return 0;
    }

    let lock = match lock::OutputLock::acquire(&settings.output_file) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    tracing::debug!(lock = %lock.path().display(), "holding output lock");

    let elevation = elevation::Elevation::from_config(&config.elevation);
    let mut session = session::SamplerSession::new(elevation, settings);

    let signals = match signals::SignalHandler::install(session.stop_handle()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to install signal handlers: {e}");
            return 1;
        }
    };

    let mut console = console::Console::new(
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        true,
    );
    let result = console.run(&mut session, &signals).await;
    session.clear_status_file();

    match result {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!(error = %e, "console I/O failed");
            1
        }
    }
}

fn print_status(path: Option<&std::path::Path>) -> i32 {
    let Some(path) = path else {
        eprintln!("error: the status file is disabled in the config");
        return 1;
    };
    match status::read_status(path) {
        Ok(data) => {
            println!("Status:       {} (pid {})", data.status, data.pid);
            println!("Output file:  {}", data.output_file);
            println!(
                "Samples:      {} ok, {} failed ({} failed in a row)",
                data.cycles_ok, data.cycles_failed, data.consecutive_failures
            );
            if let Some(start) = data.session_start {
                println!("Started:      {}", start.to_rfc3339());
            }
            match data.last_sample {
                Some(at) => println!("Last sample:  {}", at.to_rfc3339()),
                None => println!("Last sample:  none"),
            }
            println!("Updated:      {}", data.last_update.to_rfc3339());
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}
