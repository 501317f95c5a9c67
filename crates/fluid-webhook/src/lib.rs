//! The Fluid admission webhook.
//!
//! The webhook serves HTTPS with a self-issued certificate which is kept in a
//! Kubernetes Secret, renewed in the background and swapped into the running
//! server without restarts. Its CA is published as trust bundle of the
//! MutatingWebhookConfiguration.
//!
//! Admission requests are dispatched by the [`Registry`](registry::Registry)
//! to the [handlers]: one injects the fuse sidecar of the dataset an object
//! mounts, the other adds node affinity preferences for datasets.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fluid_certs::CertGenerator;
//! use fluid_webhook::{WebhookServer, constants::DEFAULT_SOCKET_ADDRESS, tls::CertificateResolver};
//!
//! # async fn docs() {
//! let artifacts = CertGenerator::default().generate("webhook.default.svc").unwrap();
//! let resolver = Arc::new(CertificateResolver::new(&artifacts).unwrap());
//!
//! let server = WebhookServer::new(axum::Router::new(), DEFAULT_SOCKET_ADDRESS, resolver).unwrap();
//! server.run().await.unwrap();
//! # }
//! ```
use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use futures_util::{FutureExt as _, pin_mut, select};
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    constants::HEALTH_PATH,
    tls::{CertificateResolver, TlsServer},
};

pub mod cli;
pub mod cluster;
pub mod constants;
pub mod handlers;
pub mod registry;
pub mod renewal;
pub mod telemetry;
pub mod tls;
pub mod trust_bundle;

/// A result type alias with the [`WebhookError`] type as the default error type.
pub type Result<T, E = WebhookError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to create {signal} listener"))]
    CreateSignalListener {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// The HTTPS server of the admission handlers.
pub struct WebhookServer {
    tls_server: TlsServer,
}

impl WebhookServer {
    /// Creates a server which handles requests with `router` on `socket_addr`.
    ///
    /// Certificates are taken from `cert_resolver` for every handshake, so
    /// rotating its certificate takes effect for new connections only.
    pub fn new(
        router: Router,
        socket_addr: SocketAddr,
        cert_resolver: Arc<CertificateResolver>,
    ) -> Result<Self> {
        tracing::trace!("create new webhook server");

        let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());

        let router = router
            .layer(service_builder)
            // The health route is below the TraceLayer so as not to be instrumented
            .route(HEALTH_PATH, get(|| async { "ok" }));

        debug!("create TLS server");
        let tls_server =
            TlsServer::new(socket_addr, router, cert_resolver).context(CreateTlsServerSnafu)?;

        Ok(Self { tls_server })
    }

    /// Runs the server until SIGINT or SIGTERM is received.
    ///
    /// This does not implement graceful shutdown of the underlying server.
    pub async fn run(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .context(CreateSignalListenerSnafu { signal: "SIGINT" })?;
        let mut sigterm = signal(SignalKind::terminate())
            .context(CreateSignalListenerSnafu { signal: "SIGTERM" })?;
        debug!("created unix signal handlers");

        let future_server = self.tls_server.run().fuse();
        let future_signal = async {
            select! {
                signal = sigint.recv().fuse() => {
                    if signal.is_some() {
                        info!("received SIGINT, shutting down");
                    }
                },
                signal = sigterm.recv().fuse() => {
                    if signal.is_some() {
                        info!("received SIGTERM, shutting down");
                    }
                },
            }
        }
        .fuse();

        pin_mut!(future_server);
        pin_mut!(future_signal);

        select! {
            result = future_server => result.context(RunTlsServerSnafu),
            () = future_signal => Ok(()),
        }
    }
}
