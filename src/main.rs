//! duocall - two-party audio/video calls over a signaling relay
//!
//! A terminal client around the call session core.

mod call;
mod config;
mod console;
mod demo;
mod error;
mod platform;
mod signaling;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::call::DeviceManager;
use crate::config::Config;
use crate::platform::synthetic::{SyntheticPlatform, SyntheticTransportFactory};
use crate::platform::MediaPlatform;
use crate::signaling::websocket::WsGateway;

#[derive(Parser)]
#[command(name = "duocall")]
#[command(about = "Two-party audio/video calls over a signaling relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a signaling server and take calls from the console
    Connect {
        /// Signaling server URL (ws:// or wss://)
        #[arg(short, long)]
        server: Option<String>,

        /// Display handle to register with
        #[arg(long)]
        handle: Option<String>,

        /// Save --server/--handle to the config file
        #[arg(long)]
        remember: bool,
    },

    /// Run two participants in-process and place a call between them
    Demo {
        /// Have both participants call each other at the same time
        #[arg(long)]
        glare: bool,
    },

    /// List capture devices
    Devices,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Connect {
            server,
            handle,
            remember,
        } => {
            if remember {
                let mut stored = Config::load()?;
                if let Some(ref s) = server {
                    config::parse_signaling_url(s)?;
                    stored.signaling_url = Some(s.clone());
                }
                if let Some(ref h) = handle {
                    stored.handle = Some(h.clone());
                }
                stored.save()?;
                tracing::info!("Saved to {}", Config::config_path()?.display());
            }

            let mut config = Config::load_with_env()?;
            if server.is_some() {
                config.signaling_url = server;
            }
            if handle.is_some() {
                config.handle = handle;
            }
            connect(config).await?;
        }
        Commands::Demo { glare } => {
            let config = Config::load_with_env()?;
            let result = demo::run(&config, glare).await?;
            if !result.connected {
                bail!("Demo call did not connect");
            }
        }
        Commands::Devices => {
            let config = Config::load_with_env()?;
            list_devices(&config).await?;
        }
        Commands::Config => {
            let config = Config::load_with_env()?;
            show_config(&config)?;
        }
    }

    Ok(())
}

/// Capture provider: host devices when built with both capture features,
/// virtual devices otherwise.
#[cfg(all(feature = "video-capture", feature = "audio"))]
fn capture_platform(_config: &Config) -> Arc<dyn MediaPlatform> {
    Arc::new(platform::native::NativePlatform::new())
}

#[cfg(not(all(feature = "video-capture", feature = "audio")))]
fn capture_platform(config: &Config) -> Arc<dyn MediaPlatform> {
    Arc::new(SyntheticPlatform::from_camera_labels(&config.synthetic_cameras))
}

async fn connect(config: Config) -> Result<()> {
    let url = config.signaling_url()?;
    let handle = config
        .handle
        .clone()
        .filter(|h| !h.trim().is_empty())
        .context("No handle configured (use --handle or DUOCALL_HANDLE)")?;

    println!("Connecting to {} as {}...", url, handle);
    let devices = Arc::new(DeviceManager::new(
        capture_platform(&config),
        config.preferred_camera.clone(),
        config.keep_preview_between_calls,
    ));
    let (gateway, gateway_events) = WsGateway::start(url, handle);
    let (call, events) = call::spawn(
        config.call_config(),
        devices,
        Arc::new(SyntheticTransportFactory::new()),
        Arc::new(gateway),
        gateway_events,
    );
    console::run(call, events).await
}

#[cfg_attr(all(feature = "video-capture", feature = "audio"), allow(unused_variables))]
async fn list_devices(config: &Config) -> Result<()> {
    #[cfg(all(feature = "video-capture", feature = "audio"))]
    let native = Arc::new(platform::native::NativePlatform::new());
    #[cfg(all(feature = "video-capture", feature = "audio"))]
    let devices = DeviceManager::new(native.clone(), None, false);
    #[cfg(not(all(feature = "video-capture", feature = "audio")))]
    let devices = DeviceManager::new(capture_platform(config), None, false);

    // Listing needs a granted capture first.
    let active = match devices.acquire(None).await {
        Ok(set) => set.video.device_id().to_string(),
        Err(e) => bail!("Capture unavailable: {}", e),
    };
    // Give capture threads a moment so a broken device shows up here.
    tokio::time::sleep(Duration::from_millis(300)).await;
    #[cfg(all(feature = "video-capture", feature = "audio"))]
    if native.frames_seen() == 0 {
        println!("warning: no frames captured in 300ms");
    }

    let cameras = devices.list_cameras().await?;
    let microphones = devices.list_microphones().await?;
    devices.teardown().await;

    println!("Cameras:");
    for cam in &cameras {
        let mark = if cam.id == active { "*" } else { " " };
        println!("{} {:<24} {}", mark, cam.id, cam.label);
    }
    println!("Microphones:");
    for mic in &microphones {
        println!("  {:<24} {}", mic.id, mic.label);
    }
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!("# {}", Config::config_path()?.display());
    let mut shown = config.clone();
    for server in &mut shown.ice_servers {
        if server.credential.is_some() {
            server.credential = Some("********".into());
        }
    }
    let text = toml::to_string_pretty(&shown).context("Failed to serialize config")?;
    println!("{}", text);
    if let Some(ref url) = config.signaling_url {
        if let Err(e) = config::parse_signaling_url(url) {
            println!("# warning: {:#}", e);
        }
    }
    Ok(())
}
