//! eventbus-probe: Liveness probe for a named bus
//!
//! Joins the configured bus, pings it and reports whether enough peers
//! answered. Suitable as a container readiness check.
//!
//! ## Configuration
//! - EVENTBUS_CONFIG: Path to a YAML config file (optional)
//! - EVENTBUS__REDIS__URL: Redis URL (default: redis://localhost:6379)
//! - EVENTBUS__BUS__NAME / EVENTBUS__BUS__PREFIX: Bus to probe
//! - EVENTBUS__LIVENESS__TIMEOUT_MS / EVENTBUS__LIVENESS__MIN_RESPONSE_COUNT
//! - EVENTBUS_LOG: Log filter (default: info)
//!
//! An optional first argument names a config file.

use std::process::ExitCode;

use tracing::{error, info, warn};

use redis_eventbus::utils::bootstrap::init_tracing;
use redis_eventbus::{BusRegistry, Config, RedisBroker};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match probe(std::env::args().nth(1).as_deref()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "eventbus-probe failed");
            ExitCode::from(2)
        }
    }
}

async fn probe(config_path: Option<&str>) -> Result<bool, Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let options = config.liveness.ping_options();

    let registry = BusRegistry::new(RedisBroker::new());
    let bus = registry
        .create_with_prefix(&config.bus.name, &config.redis, &config.bus.prefix)
        .await?;

    info!(
        bus = %bus.name(),
        channel_prefix = %bus.channel_prefix(),
        timeout_ms = config.liveness.timeout_ms,
        min_response_count = options.min_response_count,
        "Pinging peers"
    );

    let ping = bus.ping_with(options).await;
    registry.shutdown().await?;
    let alive = ping?;

    if alive {
        info!(bus = %config.bus.name, "Enough peers answered");
    } else {
        warn!(bus = %config.bus.name, "Too few peers answered before timeout");
    }
    println!("{}", if alive { "alive" } else { "unreachable" });
    Ok(alive)
}
