use std::env;

use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_JAEGER_ENDPOINT: &str = "http://jaeger:14268/api/traces";

/// Stdout logging plus a Jaeger trace pipeline. The collector endpoint comes
/// from `JAEGER_ENDPOINT` when set.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint =
        env::var("JAEGER_ENDPOINT").unwrap_or_else(|_| DEFAULT_JAEGER_ENDPOINT.to_owned());

    global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    let tracer = opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint(endpoint)
        .with_service_name("subq")
        .with_isahc()
        .with_timeout(std::time::Duration::from_secs(2))
        .install_batch(opentelemetry::runtime::Tokio)?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
