use std::io::Write;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capguard::{Config, Session};

fn print_help() {
    println!(
        "\
capguard v{}

Runs a generated guest program in a capability-checked sandbox.

USAGE:
    capguard [OPTIONS] <SCRIPT> [CONFIG_PATH]

ARGUMENTS:
    SCRIPT         Program to execute (passed to the configured interpreter)
    CONFIG_PATH    Path to TOML configuration file [default: config/capguard.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, capguard=debug,warn)

EXIT STATUS:
    The guest program's exit code, or 137 when it was killed for a
    timeout or a resource limit.

EXAMPLES:
    capguard job.py                             # uses config/capguard.toml
    capguard job.py /etc/capguard/prod.toml     # custom config path
    RUST_LOG=debug capguard job.py              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("capguard v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capguard=info")),
        )
        .init();

    let mut positional = positional.into_iter();
    let script_path = positional
        .next()
        .ok_or_else(|| anyhow!("Missing SCRIPT argument (see --help)"))?;
    let config_path = positional
        .next()
        .unwrap_or_else(|| "config/capguard.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;
    let code = std::fs::read_to_string(&script_path)
        .map_err(|e| anyhow!("Cannot read {script_path}: {e}"))?;

    let session = Session::from_config(&config)?;
    info!("Session: {}", session.id());
    info!(
        "Interpreter: {} (wall time {}s, memory {} MB, network {})",
        config.sandbox.interpreter,
        config.sandbox.max_wall_time_seconds,
        config.sandbox.max_memory_mb,
        if config.sandbox.allow_network { "allowed" } else { "denied" }
    );

    let result = tokio::select! {
        result = session.execute(&code) => result?,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the execution future kills the guest process group.
            info!("Shutdown signal received, exiting");
            return Ok(());
        }
    };

    std::io::stdout().write_all(&result.stdout)?;
    std::io::stderr().write_all(&result.stderr)?;
    if result.stdout_truncated || result.stderr_truncated {
        warn!(
            "Output truncated at {} bytes",
            config.sandbox.max_output_bytes
        );
    }
    if let Some(error) = &result.error {
        warn!("Guest program failed: {error}");
    }

    let denials = session.audit().denial_count();
    info!(
        "Finished in {:.3}s, exit code {}, peak memory {} KB, {} denial(s)",
        result.execution_time.as_secs_f64(),
        result.exit_code,
        result.memory_usage / 1024,
        denials
    );

    std::process::exit(result.exit_code.clamp(0, 255));
}
