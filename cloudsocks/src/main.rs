//! Console front end for the cloudsocks session controller

mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use cloudsocks_core::{
    ChannelNotifier, CloudSocksRepository, ConfigLoader, Credential, LogEntry, Notifier,
    SessionController, Tun2SocksBridge,
};
use commands::{Command, HELP};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(Parser, Debug)]
#[command(
    name = "cloudsocks",
    about = "Route traffic through a remote SOCKS5 proxy, optionally via a VPN device",
    version
)]
struct Args {
    /// Config file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Access code to pre-fill (socks5://[user:password@]host[:port])
    #[arg(long, short = 'a', env = "CLOUDSOCKS_ACCESS_CODE")]
    access_code: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

/// Last access code the user entered
type EnteredCode = Arc<Mutex<Option<Credential>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        ConfigLoader::load_or_default(args.config.clone()).context("Failed to load configuration")?;

    init_logging(args.verbose || config.common.verbose);

    let repository = CloudSocksRepository::new(config.repository.clone(), &config.proxy)
        .context("Invalid repository configuration")?;
    let bridge = Tun2SocksBridge::new(config.vpn.clone());
    let (notifier, mut entries) = ChannelNotifier::new();

    let controller = SessionController::new(
        Arc::new(repository),
        Arc::new(bridge),
        Arc::new(notifier.clone()),
    );

    let printer = tokio::spawn(async move {
        while let Some(entry) = entries.recv().await {
            print_entry(&entry);
        }
    });

    let entered: EnteredCode = Arc::new(Mutex::new(None));
    if let Some(code) = args.access_code {
        enter_code(&entered, &notifier, code);
    }

    info!("Type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("Failed to read from stdin")?,
        };

        // EOF
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                notifier.on_log(&e.to_string());
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }

        // Commands run concurrently, like button presses
        tokio::spawn(run_command(
            command,
            controller.clone(),
            notifier.clone(),
            entered.clone(),
        ));
    }

    controller.shutdown().await;

    // Printer ends once every sender is gone; in-flight commands may still hold one
    drop(controller);
    drop(notifier);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Log printer still busy at exit");
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("CLOUDSOCKS_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_entry(entry: &LogEntry) {
    let at = entry.at.with_timezone(&chrono::Local);
    println!("[{}] {}", at.format("%H:%M:%S"), entry.message);
}

fn enter_code(entered: &EnteredCode, notifier: &ChannelNotifier, code: String) {
    if let Ok(mut slot) = entered.lock() {
        *slot = Some(Credential::new(code));
    }
    notifier.on_log("Entered access code");
}

/// Failures reach the log through the controller, so results are dropped here
async fn run_command(
    command: Command,
    controller: SessionController,
    notifier: ChannelNotifier,
    entered: EnteredCode,
) {
    match command {
        Command::Add(code) => {
            if let Some(code) = code {
                enter_code(&entered, &notifier, code);
            }
            let credential = entered
                .lock()
                .ok()
                .and_then(|slot| slot.clone())
                .unwrap_or_else(|| Credential::new(""));
            let _ = controller.select_proxy(credential).await;
        }
        Command::Start => {
            let _ = controller.start_proxy().await;
        }
        Command::Stop => {
            let _ = controller.stop_proxy().await;
        }
        Command::VpnStart => {
            let _ = controller.start_vpn().await;
        }
        Command::VpnStop => {
            let _ = controller.stop_vpn().await;
        }
        Command::Status => {
            let state = controller.state();
            let status = match controller.endpoint().await {
                Some(endpoint) => format!("Status: {} on {}", state, endpoint),
                None => format!("Status: {}", state),
            };
            notifier.on_log(&status);
        }
        Command::Help => {
            for line in HELP {
                notifier.on_log(line);
            }
        }
        Command::Quit => {}
    }
}
