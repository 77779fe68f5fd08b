mod logging;
mod transport;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tracing::{info, warn};

use spyglass_config::{ConfigLoadError, ScriptDetails, SpyglassConfig};
use spyglass_events::{LoggingNotifier, NotificationDispatcher};
use spyglass_scripting_host::{
    create_manager_from_config, run_auto_start_scripts, setup_reload_signal, ScriptArgs,
    ScriptManager, ScriptScanner, ScriptValue,
};

use crate::transport::LoggingTransport;

#[derive(Parser)]
#[command(version = env!("VERSION_STRING"), about, long_about = None)]
struct Cli {
    /// Enables debug mode (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// Also log to a file in the data directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single script and wait for it to end
    Run {
        file: PathBuf,

        /// Run on a worker with liveness monitoring
        #[arg(long = "async")]
        asynchronous: bool,

        /// Re-run each time the script finishes (asynchronous runs only)
        #[arg(long)]
        repeat: bool,

        /// Liveness timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Argument bound into `args`, as key=value (value parsed as JSON if possible)
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<(String, ScriptValue)>,
    },

    /// Register configured scripts, start auto-start ones and keep running
    Daemon {
        /// Script directory, overriding the config
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Include subdirectories of the script directory
        #[arg(long)]
        recursive: bool,
    },

    /// List the scripts the daemon would register
    List {
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long)]
        recursive: bool,
    },
}

fn parse_arg(raw: &str) -> Result<(String, ScriptValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| ScriptValue::String(value.into()));
    Ok((key.to_string(), value))
}

fn create_example_config(path: &PathBuf) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let example_config = r#"# Spyglass configuration

[scripting]
enabled = true
recursive = false
watchdog_interval_ms = 1000
hot_reload = true

# [[scripting.scripts]]
# file = "/path/to/publish_time.rhai"
# repeat = true
# auto_start = true
# timeout_ms = 5000

[scripting.parameters]
"#;

    fs::write(path, example_config)?;
    info!("Created example config at {}", path.display());
    eprintln!("Config file created at: {}", path.display());
    eprintln!("Edit it to configure scripts, then run spyglass again.");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Option<SpyglassConfig>> {
    let path = path.cloned().unwrap_or_else(SpyglassConfig::config_path);
    match SpyglassConfig::load_from(&path) {
        Ok(config) => Ok(Some(config)),
        Err(ConfigLoadError::NotFound) => {
            info!("No config found, creating example config");
            create_example_config(&path)?;
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Cannot load {}", path.display())),
    }
}

fn logging_dispatcher() -> NotificationDispatcher {
    let (dispatcher, _task) =
        NotificationDispatcher::spawn(&Handle::current(), Arc::new(LoggingNotifier));
    dispatcher
}

async fn wait_for_run(manager: &ScriptManager, id: &str) {
    let Some(script) = manager.get_script(id) else {
        return;
    };
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping {}", script.name());
                manager.stop_script(&script);
            }
            _ = ticker.tick() => {}
        }
        if !script.is_active() {
            break;
        }
    }
}

async fn run_command(
    file: PathBuf,
    asynchronous: bool,
    repeat: bool,
    timeout_ms: Option<u64>,
    args: Vec<(String, ScriptValue)>,
) -> anyhow::Result<()> {
    let manager = Arc::new(ScriptManager::new(
        Handle::current(),
        logging_dispatcher(),
        Arc::new(LoggingTransport::default()),
    ));

    let mut details = ScriptDetails::new(&file).with_repeat(repeat);
    if let Some(timeout_ms) = timeout_ms {
        details = details.with_timeout_ms(timeout_ms);
    }
    let script = manager
        .add_script(&details)
        .with_context(|| format!("Cannot register {}", file.display()))?;
    let args: ScriptArgs = args.into_iter().collect();

    if asynchronous {
        manager.run_script(&script, true, Some(&args));
        wait_for_run(&manager, script.id()).await;
    } else {
        let runner = manager.clone();
        let run_script = script.clone();
        tokio::task::spawn_blocking(move || runner.run_script(&run_script, false, Some(&args)))
            .await?;
    }

    println!("{}: {}", script.name(), script.status());
    if let Some(error) = script.last_error() {
        bail!("{} failed: {}", script.name(), error);
    }
    Ok(())
}

async fn daemon_command(
    config: SpyglassConfig,
    dir: Option<PathBuf>,
    recursive: bool,
) -> anyhow::Result<()> {
    let mut scripting = config.scripting;
    if let Some(dir) = dir {
        scripting.script_dir = Some(dir);
    }
    scripting.recursive |= recursive;
    if !scripting.enabled {
        warn!("Scripting is disabled in the config");
        return Ok(());
    }

    let manager = create_manager_from_config(
        Handle::current(),
        logging_dispatcher(),
        Arc::new(LoggingTransport::default()),
        &scripting,
    );
    let started = run_auto_start_scripts(&manager);
    info!(
        "Registered {} script(s), started {}",
        manager.scripts().len(),
        started
    );

    let script_dir = scripting.script_dir();
    let mut scanner = ScriptScanner::with_interval(
        script_dir.clone(),
        scripting.recursive,
        scripting.hot_reload_interval(),
    );
    let mut reload = setup_reload_signal();
    let mut reload_open = true;
    let mut ticker =
        tokio::time::interval(scripting.hot_reload_interval().max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            changed = reload.changed(), if reload_open => {
                if changed.is_err() {
                    warn!("Reload signal unavailable");
                    reload_open = false;
                    continue;
                }
                if reload.borrow_and_update().is_some() {
                    let scan = scanner.scan_changes();
                    manager.refresh_from_directory(&script_dir, &scan);
                }
            }
            _ = ticker.tick(), if scripting.hot_reload => {
                if scanner.should_scan() {
                    let scan = scanner.scan_changes();
                    if scan.has_changes() {
                        manager.refresh_from_directory(&script_dir, &scan);
                    }
                }
            }
        }
    }

    manager.shutdown();
    Ok(())
}

fn list_command(config: SpyglassConfig, dir: Option<PathBuf>, recursive: bool) {
    let mut scripting = config.scripting;
    if let Some(dir) = dir {
        scripting.script_dir = Some(dir);
    }
    scripting.recursive |= recursive;

    let manager = ScriptManager::new(
        Handle::current(),
        NotificationDispatcher::disabled(),
        Arc::new(LoggingTransport::default()),
    );
    manager.populate_scripts(&scripting.scripts);
    manager.populate_from_directory(&scripting.script_dir(), scripting.recursive);

    for script in manager.scripts() {
        println!(
            "{:<32} repeat={:<5} auto_start={:<5} timeout={}ms",
            script.name_with_subdirectory(),
            script.is_repeat(),
            script.is_auto_start(),
            script.timeout().as_millis()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(cli.debug, cli.log_file)?;

    match cli.command {
        Command::Run {
            file,
            asynchronous,
            repeat,
            timeout_ms,
            args,
        } => run_command(file, asynchronous, repeat, timeout_ms, args).await,
        Command::Daemon { dir, recursive } => {
            let Some(config) = load_config(cli.config.as_ref())? else {
                return Ok(());
            };
            daemon_command(config, dir, recursive).await
        }
        Command::List { dir, recursive } => {
            let config = load_config(cli.config.as_ref())?.unwrap_or_default();
            list_command(config, dir, recursive);
            Ok(())
        }
    }
}
