//! Command line interface of the `fluid-webhook` binary.
//!
//! Every flag can also be set through the environment variable named after
//! it, for example `--webhook-namespace` through `WEBHOOK_NAMESPACE`.
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser};
use fluid_injector::cache::CacheConfig;

use crate::{
    constants::{DEFAULT_CERT_DIR, DEFAULT_HTTPS_PORT, DEFAULT_LISTEN_ADDRESS},
    handlers::AdmissionSettings,
    telemetry::TelemetryOptions,
};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(version, about)]
pub enum Command {
    /// Run the admission webhook.
    Run(RunArguments),

    /// Print the effective configuration and exit.
    PrintConfig(RunArguments),
}

impl Command {
    pub fn arguments(&self) -> &RunArguments {
        match self {
            Self::Run(arguments) | Self::PrintConfig(arguments) => arguments,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Name of the MutatingWebhookConfiguration the trust bundle is published to.
    #[arg(long, env, default_value = "fluid-pod-admission-webhook")]
    pub webhook_name: String,

    /// The namespace the webhook is running in.
    #[arg(long, env, default_value = "fluid-system")]
    pub webhook_namespace: String,

    /// The name of the service the webhook is reachable at.
    #[arg(long, env, default_value = "fluid-pod-admission-webhook")]
    pub webhook_service_name: String,

    /// Name of the Secret which stores the certificate bundle.
    #[arg(long, env, default_value = "fluid-webhook-certs")]
    pub cert_secret_name: String,

    /// Directory the PEM files of the serving certificate are written to.
    #[arg(long, env, value_name = "DIRECTORY", default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    #[arg(long, env, default_value_t = DEFAULT_HTTPS_PORT)]
    pub https_port: u16,

    #[arg(long, env, default_value_t = DEFAULT_LISTEN_ADDRESS)]
    pub bind_address: IpAddr,

    /// Deadline of a single certificate store operation.
    #[arg(long, env, value_parser = humantime::parse_duration, default_value = "10s")]
    pub store_timeout: Duration,

    /// Disables every mutation. All requests are allowed unchanged.
    #[arg(long, env = "DISABLE_INJECTION")]
    pub disable_injection: bool,

    /// Do not serve the node affinity handler.
    #[arg(long, env)]
    pub disable_node_affinity: bool,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub cache: CacheOptions,

    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

impl RunArguments {
    /// The DNS name the API server reaches the webhook at.
    pub fn dns_name(&self) -> String {
        format!(
            "{service}.{namespace}.svc",
            service = self.webhook_service_name,
            namespace = self.webhook_namespace
        )
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.https_port)
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            disable_injection: self.disable_injection,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Cache Options")]
pub struct CacheOptions {
    /// Cache the runtime of dataset-backed claims.
    #[arg(long, env)]
    pub runtime_info_cache_enabled: bool,

    #[arg(long, env, default_value_t = CacheConfig::DEFAULT_CAPACITY)]
    pub runtime_info_cache_capacity: usize,

    #[arg(long, env, value_parser = humantime::parse_duration, default_value = "30s")]
    pub runtime_info_cache_ttl: Duration,

    #[arg(long, env, default_value_t = CacheConfig::DEFAULT_CAPACITY)]
    pub fuse_template_cache_capacity: usize,

    #[arg(long, env, value_parser = humantime::parse_duration, default_value = "30s")]
    pub fuse_template_cache_ttl: Duration,
}

impl CacheOptions {
    /// Returns [`None`] if the runtime info cache is disabled.
    pub fn runtime_info_cache(&self) -> Option<CacheConfig> {
        self.runtime_info_cache_enabled.then_some(CacheConfig {
            capacity: self.runtime_info_cache_capacity,
            entry_time_to_live: self.runtime_info_cache_ttl,
        })
    }

    pub fn fuse_template_cache(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.fuse_template_cache_capacity,
            entry_time_to_live: self.fuse_template_cache_ttl,
        }
    }
}
