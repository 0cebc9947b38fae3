mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use cirrus_core::{install_signal_handler, shutdown_requested, Engine, EngineSettings};
use cirrus_provider::select_adapters;
use cirrus_store::StateLayout;
use commands::{EXIT_STATE_ERROR, EXIT_VALIDATION_ERROR};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "cirrus",
    version,
    about = "Declarative, deterministic infrastructure provisioning"
)]
struct Cli {
    /// Path to the Cirrus state directory.
    #[arg(long, default_value = "~/.local/share/cirrus", global = true)]
    state: String,

    /// Engine settings file (defaults to ~/.config/cirrus/engine.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider adapters to apply with: 'local' or 'mock'.
    #[arg(long, default_value = "local", global = true)]
    provider: String,

    /// Maximum adapter operations in flight within a level.
    #[arg(long, global = true)]
    max_in_flight: Option<usize>,

    /// Stop after the first level that has a failed step.
    #[arg(long, default_value_t = false, global = true)]
    halt_on_failure: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check a desired spec without reading or touching state.
    Validate {
        /// Path to the desired spec TOML file.
        #[arg(default_value = "cirrus.toml")]
        spec: PathBuf,
    },
    /// Show the changes an apply would make (dry run).
    Plan {
        /// Path to the desired spec TOML file.
        #[arg(default_value = "cirrus.toml")]
        spec: PathBuf,
        /// Plan the removal of everything in state instead.
        #[arg(long, default_value_t = false)]
        destroy: bool,
    },
    /// Converge real infrastructure to a desired spec.
    Apply {
        /// Path to the desired spec TOML file.
        #[arg(default_value = "cirrus.toml")]
        spec: PathBuf,
    },
    /// Remove every resource and binding recorded in state.
    Destroy,
    /// Show the last committed snapshot.
    State,
    /// Verify snapshot checksum, references and journal.
    VerifyState,
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CIRRUS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let state_path = expand_tilde(&cli.state);
    let json_output = cli.json;

    let result = match &cli.command {
        Commands::Validate { spec } => commands::validate::run(spec, json_output),
        Commands::Plan { spec, destroy } => make_engine(&cli, &state_path)
            .and_then(|engine| commands::plan::run(&engine, spec, *destroy, json_output)),
        Commands::Apply { spec } => make_engine(&cli, &state_path)
            .and_then(|engine| commands::apply::run(&engine, spec, json_output)),
        Commands::Destroy => make_engine(&cli, &state_path)
            .and_then(|engine| commands::destroy::run(&engine, json_output)),
        Commands::State => make_engine(&cli, &state_path)
            .and_then(|engine| commands::state::run(&engine, json_output)),
        Commands::VerifyState => make_engine(&cli, &state_path)
            .and_then(|engine| commands::verify_state::run(&engine, json_output)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(*shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:")
                || msg.starts_with("validation error:")
                || msg.starts_with("settings error:")
                || msg.starts_with("provider error:")
            {
                EXIT_VALIDATION_ERROR
            } else {
                EXIT_STATE_ERROR
            };
            ExitCode::from(code)
        }
    }
}

fn make_engine(cli: &Cli, state_path: &Path) -> Result<Engine, String> {
    let mut settings = EngineSettings::load(cli.config.as_deref()).map_err(|e| e.to_string())?;
    if let Some(n) = cli.max_in_flight {
        settings.max_in_flight = n;
    }
    if cli.halt_on_failure {
        settings.halt_on_failure = true;
    }
    settings.validate().map_err(|e| e.to_string())?;
    debug!("engine settings: {settings:?}");

    let layout = StateLayout::new(state_path);
    let adapters = select_adapters(&cli.provider, &layout.local_provider_dir())
        .map_err(|e| e.to_string())?;
    Ok(Engine::new(state_path, adapters, settings).with_stop_signal(shutdown_requested))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
