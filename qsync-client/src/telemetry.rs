//! Tracing subscriber initialisation.

use crate::error::{ClientError, ClientResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "qsync=debug,info";

/// Install a global subscriber with a plain or JSON fmt layer. Fails instead
/// of panicking when a subscriber is already installed.
pub fn init_tracing(json: bool) -> ClientResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ClientError::Telemetry(e.to_string()))?;

    tracing::info!(json, "Tracing initialized");
    Ok(())
}
