//! Storage Controller
//!
//! Standalone entry point: wires the security engine, the in-memory entity
//! kernel, the device providers, and the reconcile loop together. The
//! network front ends and the relational persistence drivers live in their
//! own services and attach through the library API.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storcon::{
    default_providers, CoreRegistry, LvmConfig, MemoryDriver, OpenflexConfig, ReconcileDriver,
    Result, SatelliteSync, SecurityLevel, SecurityRegistry, TokioExtCmd,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Controller - cluster storage control plane core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Security level (NO_SECURITY, RBAC, MAC)
    #[arg(long, env = "SECURITY_LEVEL", default_value = "MAC")]
    security_level: String,

    /// Reconcile interval in seconds
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "60")]
    reconcile_interval_secs: u64,

    /// Openflex fabric API base URL
    #[arg(long, env = "OPENFLEX_API_HOST", default_value = "")]
    openflex_api_host: String,

    /// Openflex storage device id
    #[arg(long, env = "OPENFLEX_DEVICE", default_value = "")]
    openflex_device: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let security_level = SecurityLevel::from_str(&args.security_level)?;

    info!("Starting storage controller core");
    info!("  Version: {}", storcon::VERSION);
    info!("  Security level: {}", security_level);
    info!("  Reconcile interval: {}s", args.reconcile_interval_secs);

    let security = SecurityRegistry::new(security_level);
    let sys_ctx = security.system_context();
    let registry = CoreRegistry::new(&sys_ctx);
    let _driver = Arc::new(MemoryDriver::new());
    let _sync = SatelliteSync::new(registry.clone());
    info!("Entity registry initialized");

    let providers = default_providers(
        Arc::new(TokioExtCmd::new()),
        LvmConfig::default(),
        OpenflexConfig {
            api_host: args.openflex_api_host,
            device: args.openflex_device,
        },
    );
    info!("Device providers initialized: {}", providers.len());

    let reconciler = ReconcileDriver::new(
        registry,
        providers,
        sys_ctx,
        Duration::from_secs(args.reconcile_interval_secs),
    );
    reconciler.run().await;

    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
