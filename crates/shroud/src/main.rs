//! Shroud: multi-hop VPN orchestration
//!
//! Command-line front end. The tunnel itself is simulated by a dry-run
//! driver; everything else (composition, validation, lifecycle, rotation,
//! posture) is the real library.

mod dry_run;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dry_run::{DryRunDriver, DryRunProber};
use shroud_core::{
    config, distance_km, AlertSeverity, ChainComposer, ChainMode, ClientSettings,
    ConnectionStateMachine, GeoPoint, KeyPair, RotationScheduler, SecurityPostureTracker,
    ServerCatalog,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "shroud", version, about = "Multi-hop VPN connection orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Client settings (.toml or .json)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a WireGuard config file, then print it normalised
    Check { path: PathBuf },
    /// Rank catalog servers by distance and load
    Servers,
    /// Compose a chain without connecting
    Compose { mode: ChainMode },
    /// Walk a chain through connect, rotation and disconnect (dry run)
    Connect {
        mode: ChainMode,
        /// Seconds to stay connected
        #[arg(long, default_value = "5")]
        hold: u64,
        /// Rotate once before disconnecting
        #[arg(long)]
        rotate: bool,
    },
    /// Generate a WireGuard key pair
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => ClientSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ClientSettings::default(),
    };

    match cli.command {
        Command::Check { path } => check(&path),
        Command::Servers => servers(&settings),
        Command::Compose { mode } => compose(&settings, mode),
        Command::Connect { mode, hold, rotate } => connect(settings, mode, hold, rotate).await,
        Command::Keygen => {
            let pair = KeyPair::generate();
            println!("PrivateKey = {}", pair.private.to_base64());
            println!("PublicKey = {}", pair.public.to_base64());
            Ok(())
        }
    }
}

fn user_location(settings: &ClientSettings) -> GeoPoint {
    settings.user_location.unwrap_or_else(|| {
        warn!("No user_location in settings, ranking from 0,0");
        GeoPoint::new(0.0, 0.0)
    })
}

fn check(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed = config::parse(&text).context("parsing config")?;
    config::validate(&parsed).context("validating config")?;

    info!("{} is valid (endpoint {})", path.display(), parsed.endpoint());
    print!("{}", config::render(&parsed));
    Ok(())
}

fn servers(settings: &ClientSettings) -> Result<()> {
    let user = user_location(settings);
    let catalog = settings.catalog();
    if catalog.servers.is_empty() {
        bail!("catalog has no servers");
    }

    for server in settings.selector().rank(&catalog.servers, user) {
        println!(
            "{:<12} {:<20} {:>8.0} km  load {:>3}%  {}",
            server.id,
            server.name,
            distance_km(user, server.location()),
            server.load,
            if server.is_directly_usable() { "ready" } else { "needs keys" },
        );
    }
    Ok(())
}

fn compose(settings: &ClientSettings, mode: ChainMode) -> Result<()> {
    let composer = ChainComposer::new(settings.selector());
    let chain = composer.compose(mode, &settings.catalog(), user_location(settings))?;

    println!("{} [{}]", chain.name, chain.id);
    println!("  route:    {}", chain.route_summary());
    println!("  rotation: every {:?} (auto: {})", chain.rotation_interval, chain.auto_rotate);
    for (key, value) in &chain.security_settings {
        println!("  {}: {}", key, value);
    }
    Ok(())
}

async fn connect(settings: ClientSettings, mode: ChainMode, hold: u64, rotate: bool) -> Result<()> {
    let user = user_location(&settings);
    let catalog: ServerCatalog = settings.catalog();

    let machine = Arc::new(
        ConnectionStateMachine::new(
            Arc::new(DryRunDriver::new()),
            catalog,
            user,
            settings.connection.clone(),
        )
        .with_selector(settings.selector())
        .with_protections(settings.protections),
    );
    machine.initialize().await?;
    let _monitor = machine.spawn_driver_monitor();

    let posture = Arc::new(SecurityPostureTracker::new(
        Arc::new(DryRunProber(settings.protections)),
        machine.alert_log(),
        settings.protections,
    ));
    let _follower = posture.spawn_status_follower(machine.subscribe());
    let _sync = machine.spawn_protection_sync(posture.watch_flags());

    let mut alerts = machine.alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            if alert.severity == AlertSeverity::Critical {
                eprintln!("!! {}: {}", alert.title, alert.message);
            }
        }
    });

    let scheduler = RotationScheduler::from_settings(&settings.rotation).spawn(Arc::clone(&machine));

    machine.connect_mode(mode).await?;
    let result = posture.run_test().await;
    info!("Posture score {:.2} (passed: {})", result.score, result.passed);

    if rotate {
        machine.rotate().await?;
    }

    tokio::time::sleep(Duration::from_secs(hold)).await;

    let status = machine.status();
    info!(
        "{} via {} ({})",
        status.vpn_status,
        status.active_chain.as_ref().map(|c| c.name.as_str()).unwrap_or("-"),
        status.traffic.format(),
    );

    scheduler.stop().await;
    machine.disconnect().await?;
    info!("Shroud finished");
    Ok(())
}
