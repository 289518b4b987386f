// src/main.rs
//
// =============================================================================
// BBSYNCER: ENTRY POINT
// =============================================================================
//
// Two modes, one binary:
//   sync (default): one-shot flash sync, fired by udev when an FC enumerates
//   --web:          the read-only session browser for the field hotspot
//
// Exit code 0 for SUCCESS / ALREADY_EMPTY / DRY_RUN, 1 for errors or when
// no serial port can be found.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use bbsyncer::config::Config;
use bbsyncer::led::{backend_from_config, LedController};
use bbsyncer::sync::{auto_detect_port, StatusHandle, SyncOrchestrator};
use bbsyncer::web::WebServer;

// How long the final LED pattern may play out before we stop the worker.
const LED_LINGER: Duration = Duration::from_secs(6);

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "bbsyncer", about = "Betaflight Blackbox Field Syncer")]
struct Cli {
    /// Serial port (e.g. /dev/ttyACM0). Empty = auto-detect.
    #[arg(long, short = 'p', default_value = "")]
    port: String,

    /// Path to bbsyncer.toml config file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Copy flash but skip the erase step.
    #[arg(long)]
    dry_run: bool,

    /// Run the web server instead of a sync.
    #[arg(long)]
    web: bool,

    /// Enable debug logging.
    #[arg(long, short = 'v')]
    verbose: bool,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let cfg = Config::load(cli.config.as_deref());

    if cli.web {
        return run_web(&cfg);
    }
    run_sync(&cfg, &cli)
}

// ============================================================================
// 3. SYNC MODE
// ============================================================================

fn run_sync(cfg: &Config, cli: &Cli) -> ExitCode {
    let port = if !cli.port.is_empty() {
        Some(cli.port.clone())
    } else if !cfg.serial_port.is_empty() {
        Some(cfg.serial_port.clone())
    } else {
        auto_detect_port()
    };
    let Some(port) = port else {
        log::error!(
            "No serial port specified and no /dev/ttyACM* found. \
             Use --port /dev/ttyACM0 or connect the FC."
        );
        return ExitCode::from(1);
    };

    log::info!("🚀 Starting sync on port {} (dry_run={})", port, cli.dry_run);

    let mut led = LedController::start(backend_from_config(&cfg.led_backend, cfg.led_gpio_pin));
    let status = StatusHandle::new();

    let orchestrator = SyncOrchestrator::new(cfg, &led, status, cli.dry_run);
    let result = orchestrator.run(&port);

    // Let the final SUCCESS/ERROR pattern play out before the LED goes dark.
    led.wait_until_idle(LED_LINGER);
    led.stop();

    let code = result.exit_code();
    log::info!("👋 Sync result: {:?} (exit {})", result, code);
    ExitCode::from(code as u8)
}

// ============================================================================
// 4. WEB MODE
// ============================================================================

fn run_web(cfg: &Config) -> ExitCode {
    // A separate process from the sync one-shot: it only ever reads the
    // session tree, so the status it reports is simply "idle".
    let status = StatusHandle::new();
    let addr = format!("0.0.0.0:{}", cfg.web_port);
    match WebServer::bind(&addr, cfg.storage_path.clone(), status) {
        Ok(server) => {
            server.serve();
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Web server failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
