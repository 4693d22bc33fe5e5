//! wlbroker CLI - desktop session broker daemon and client.
//!
//! This is the main binary entry point. See the `wlbroker` library for the
//! core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use wlbroker::outputs::{self, OutputChange};
use wlbroker::server::{Service, Services, SocketClient, SocketServer};
use wlbroker::stream::write_json_line;
use wlbroker::Config;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

fn shutting_down() -> bool {
    SHUTDOWN_FLAG.load(Ordering::Relaxed)
}

/// Run the broker until a signal arrives or the compositor connection dies.
fn run_daemon() -> Result<()> {
    register_signals()?;

    let config = Config::load()?;
    let settings = config.manager_settings();
    let manager = Arc::new(
        outputs::start(config.wayland_display.as_deref(), &settings).context("Failed to start output manager")?,
    );
    let fatal = manager.fatal_error();

    let service: Arc<dyn Service> = manager.clone();
    let mut services = Services::new();
    services.insert("outputs".into(), service);
    let server = SocketServer::start(config.socket_path()?, services)?;

    log::info!("wlbroker v{} ready on {}", env!("CARGO_PKG_VERSION"), server.socket_path().display());

    let mut result = Ok(());
    while !shutting_down() {
        if let Ok(err) = fatal.recv_timeout(Duration::from_millis(100)) {
            log::error!("Output manager stopped: {err}");
            result = Err(anyhow::Error::new(err).context("Compositor connection lost"));
            break;
        }
    }

    log::info!("Shutting down...");
    server.shutdown();
    manager.shutdown();
    result
}

/// Print output state straight from the compositor.
fn run_outputs(watch: bool) -> Result<()> {
    let config = Config::load()?;
    let settings = config.manager_settings();
    let manager = outputs::start(config.wayland_display.as_deref(), &settings)?;
    let mut stdout = std::io::stdout();

    if !watch {
        write_json_line(&mut stdout, &manager.get_state())?;
        return Ok(());
    }

    register_signals()?;
    let subscription = manager.subscribe("cli");
    write_json_line(&mut stdout, &manager.get_state())?;
    while !shutting_down() {
        match subscription.recv_timeout(Duration::from_millis(200)) {
            Ok(state) => write_json_line(&mut stdout, &state)?,
            Err(e) if e.is_timeout() => {
                if let Ok(err) = manager.fatal_error().try_recv() {
                    return Err(anyhow::Error::new(err).context("Compositor connection lost"));
                }
            }
            Err(_) => break,
        }
    }
    manager.shutdown();
    Ok(())
}

/// Apply a JSON list of output changes.
fn run_apply(changes: &str, test_only: bool) -> Result<()> {
    let changes: Vec<OutputChange> = serde_json::from_str(changes).context("Invalid change list")?;
    let config = Config::load()?;
    let manager = outputs::start(config.wayland_display.as_deref(), &config.manager_settings())?;
    manager.apply(changes, test_only)?;
    println!("{}", if test_only { "Configuration is valid" } else { "Configuration applied" });
    Ok(())
}

/// Show or change persisted configuration.
fn run_config(key: Option<String>, value: Option<String>) -> Result<()> {
    let config = Config::load()?;
    match (key, value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&config)?),
        (Some(key), None) => match config.get(&key)? {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("Config key '{key}' is not set"),
        },
        (Some(key), Some(value)) => {
            // Environment overrides are not persisted.
            let mut stored = Config::load_from(&Config::config_dir()?)?;
            stored.set(&key, &value)?;
            stored.save()?;
            println!("Set {key} = {value}");
        }
    }
    Ok(())
}

/// Send one request to a running daemon and print the replies.
fn run_request(method: &str, params: Option<&str>) -> Result<()> {
    let params = params
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("Params must be JSON")?;
    let config = Config::load()?;
    let mut client = SocketClient::connect(&config.socket_path()?)?;
    client.send(method, params)?;

    let streaming = method.ends_with(".subscribe");
    if streaming {
        register_signals()?;
        client.set_read_timeout(Some(Duration::from_millis(200)))?;
    }
    let mut stdout = std::io::stdout();
    loop {
        match client.recv() {
            Ok(Some(reply)) => {
                write_json_line(&mut stdout, &reply)?;
                if !streaming {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) if is_timeout(&e) => {
                if shutting_down() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut))
}

// CLI
#[derive(Parser)]
#[command(name = "wlbroker")]
#[command(version)]
#[command(about = "Desktop session broker for Wayland compositors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker daemon
    Serve,
    /// Print output state from the compositor
    Outputs {
        /// Keep printing every change
        #[arg(long)]
        watch: bool,
    },
    /// Apply output changes given as a JSON array
    Apply {
        /// e.g. '[{"name":"DP-1","mode":{"width":1920,"height":1080}}]'
        changes: String,
        /// Ask the compositor to validate without applying
        #[arg(long)]
        test: bool,
    },
    /// Show the configuration, one key, or set a key
    Config {
        key: Option<String>,
        value: Option<String>,
    },
    /// Send a request to a running daemon (e.g. "outputs.getState")
    Request {
        /// Method name
        method: String,
        /// Request params as JSON
        #[arg(long)]
        params: Option<String>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("WLBROKER_LOG_FILE") {
        let log_file = std::fs::File::create(&path).with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => run_daemon(),
        Commands::Outputs { watch } => run_outputs(watch),
        Commands::Apply { changes, test } => run_apply(&changes, test),
        Commands::Config { key, value } => run_config(key, value),
        Commands::Request { method, params } => run_request(&method, params.as_deref()),
    }
}
