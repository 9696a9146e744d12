//! Logging and OpenTelemetry bootstrap for the adapter binary.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_SAMPLER: &str = "parentbased_always_on";

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub traces_sampler: String,
    /// `service.name`, `service.namespace` and `adapter.es.alias` plus
    /// anything from `OTEL_RESOURCE_ATTRIBUTES`
    pub resource_attributes: BTreeMap<String, String>,
    sampler: Sampler,
}

impl TelemetryConfig {
    /// Reads `OTEL_SERVICE_NAME`, `OTEL_TRACES_SAMPLER[_ARG]` and
    /// `OTEL_RESOURCE_ATTRIBUTES`.
    pub fn from_env(default_service_name: &str, alias: &str) -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_vars(default_service_name, alias, var)
    }

    fn from_vars(
        default_service_name: &str,
        alias: &str,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let service_name = var("OTEL_SERVICE_NAME")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| default_service_name.to_string());
        if service_name.is_empty() {
            return Err(Error::Config("OTEL_SERVICE_NAME cannot be empty".to_string()));
        }

        let traces_sampler = var("OTEL_TRACES_SAMPLER").unwrap_or_else(|| DEFAULT_SAMPLER.to_string());
        let sampler = sampler(&traces_sampler, var("OTEL_TRACES_SAMPLER_ARG").as_deref())?;

        let mut resource_attributes = match var("OTEL_RESOURCE_ATTRIBUTES") {
            Some(raw) => resource_attributes(&raw)?,
            None => BTreeMap::new(),
        };
        resource_attributes
            .entry("service.namespace".to_string())
            .or_insert_with(|| "prometheus-es-adapter".to_string());
        resource_attributes.insert("service.name".to_string(), service_name.clone());
        resource_attributes.insert("adapter.es.alias".to_string(), alias.to_string());

        Ok(Self {
            service_name,
            traces_sampler,
            resource_attributes,
            sampler,
        })
    }
}

/// Keeps the SDK providers alive for the process lifetime.
pub struct Telemetry {
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Install the JSON log subscriber and the global tracer/meter providers.
    pub fn init_for_component(
        default_service_name: &str,
        alias: &str,
        level: Level,
    ) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name, alias)?;

        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

        let attributes: Vec<KeyValue> = config
            .resource_attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect();
        let resource = Resource::default().merge(&Resource::new(attributes));

        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(config.sampler.clone())
                    .with_resource(resource.clone()),
            )
            .build();
        let _ = global::set_tracer_provider(tracer_provider.clone());

        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service_name = %config.service_name,
            traces_sampler = %config.traces_sampler,
            level = %level,
            "Telemetry initialized"
        );

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}

/// `--debug` selects debug, otherwise info.
pub fn log_level(debug: bool) -> Level {
    if debug {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

fn sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    let ratio = || -> Result<f64> {
        let ratio = arg
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|r| (0.0..=1.0).contains(r));
        ratio.ok_or_else(|| {
            Error::Config("OTEL_TRACES_SAMPLER_ARG must be a ratio in [0,1]".to_string())
        })
    };
    let sampler = match name.trim() {
        "always_on" => Sampler::AlwaysOn,
        "always_off" => Sampler::AlwaysOff,
        "traceidratio" => Sampler::TraceIdRatioBased(ratio()?),
        "parentbased_always_on" => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
        "parentbased_traceidratio" => {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio()?)))
        }
        other => {
            return Err(Error::Config(format!(
                "unsupported OTEL_TRACES_SAMPLER '{other}'"
            )))
        }
    };
    Ok(sampler)
}

/// Parse `key=value` pairs separated by commas.
fn resource_attributes(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is not key=value"
            ))),
        })
        .collect()
}
