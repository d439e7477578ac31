use clap::Parser;
use log::{error, info, warn};
use std::path::Path;
use tokio::signal;

use amber::configuration::config::Config;
use amber::controller::Controller;

#[derive(Parser)]
#[command(name = "amber")]
#[command(version)]
#[command(about = "Web page capture to WARC with external archive replication")]
struct Args {
    config_file: String,
}

#[tokio::main]
async fn main() {
    // Respect RUST_LOG for the overall level; quiet the chattier deps
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sea_orm", log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .filter_module("sqlx::query", log::LevelFilter::Error)
        .filter_module("chromiumoxide", log::LevelFilter::Warn)
        .format_target(false)
        .init();

    println!(
        "
     █████╗ ███╗   ███╗██████╗ ███████╗██████╗
    ██╔══██╗████╗ ████║██╔══██╗██╔════╝██╔══██╗
    ███████║██╔████╔██║██████╔╝█████╗  ██████╔╝
    ██╔══██║██║╚██╔╝██║██╔══██╗██╔══╝  ██╔══██╗
    ██║  ██║██║ ╚═╝ ██║██████╔╝███████╗██║  ██║
    ╚═╝  ╚═╝╚═╝     ╚═╝╚═════╝ ╚══════╝╚═╝  ╚═╝
    ============================================
      Web capture & archive replication v{}
    ============================================
    ",
        env!("CARGO_PKG_VERSION")
    );

    info!("Amber starting up");

    let args = Args::parse();
    if args.config_file.is_empty() {
        error!("No configuration file specified");
        std::process::exit(1);
    }

    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Failed to load configuration from {}: {:?}",
                args.config_file, e
            );
            std::process::exit(1);
        }
    };

    let mut controller = match Controller::new(config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!("Failed to initialize controller: {:?}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(shutdown_rx).await {
            error!("Controller error: {:?}", e);
        }
    });

    info!("Amber is now operational");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    if let Err(e) = shutdown_tx.send(()) {
        error!("Failed to send shutdown signal: {:?}", e);
    }

    match tokio::time::timeout(tokio::time::Duration::from_secs(15), controller_handle).await {
        Ok(Ok(())) => {
            info!("Amber shutdown completed");
        }
        Ok(Err(e)) => {
            error!("Controller task failed during shutdown: {:?}", e);
        }
        Err(_) => {
            warn!("Controller shutdown timed out after 15 seconds");
        }
    }
}
