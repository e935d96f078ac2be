use crate::{env_optional, Environment};
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Default directives when `RUST_LOG` is unset.
///
/// The AMQP client library logs every frame at debug/trace, so it is held at
/// warn unless asked for explicitly.
const PRODUCTION_FILTER: &str = "info,lapin=warn,amqp_worker=info";
const DEVELOPMENT_FILTER: &str = "debug,lapin=warn,amqp_worker=debug";

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() before any fallible operations. Safe to call
/// multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `LOG_FORMAT=json|pretty` overrides the environment default
    pub fn resolve(environment: &Environment) -> Self {
        match env_optional("LOG_FORMAT").as_deref() {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ if environment.is_production() => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize tracing with environment-aware configuration and error span capture.
///
/// - **Production** (`APP_ENV=production`): flattened JSON events for log
///   aggregation, module targets hidden.
/// - **Development** (default): pretty, human-readable output.
///
/// Both include `tracing_error::ErrorLayer` so `eyre` reports carry span
/// traces. `RUST_LOG` overrides the default filter.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(environment: &Environment) {
    let format = LogFormat::resolve(environment);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if environment.is_production() {
            PRODUCTION_FILTER
        } else {
            DEVELOPMENT_FILTER
        })
    });

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init(),
    };

    match result {
        Ok(_) => info!(?environment, ?format, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized, skipping re-initialization"),
    }
}
