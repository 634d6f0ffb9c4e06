use crate::config::{Environment, LogLevel};
use opentelemetry::global::BoxedTracer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Builds the filter: `RUST_LOG` wins, otherwise the configured level.
fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Initialize tracing subscriber with pretty formatting for development
/// and JSON formatting for production. Spans stay local.
pub fn setup_logging(level: LogLevel, environment: Environment) {
    init_subscriber(level, environment, None);
}

/// Installs the global subscriber, bridging spans to `tracer` when given.
pub(crate) fn init_subscriber(level: LogLevel, environment: Environment, tracer: Option<BoxedTracer>) {
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let registry = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(otel_layer);

    match environment {
        Environment::Production => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_level(true))
                .init();
        }
        Environment::Development => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(true),
                )
                .init();
        }
    }
}
