use std::sync::Arc;

use clap::Parser;
use fluid_certs::{
    CertificateLifecycleManager, files::write_pem_files, manager::EnsureCertError,
    store::SecretCertStore,
};
use fluid_injector::{
    InjectionEngine,
    cache::{CachedDatasetResolver, DatasetResolver, FuseTemplateCache, RuntimeInfoCache},
};
use fluid_webhook::{
    WebhookError, WebhookServer,
    cli::{Command, RunArguments},
    cluster::{DaemonSetTemplateProvider, KubeDatasetResolver},
    constants::{FUSE_HANDLER_PATH, NODE_AFFINITY_HANDLER_PATH},
    handlers::{FuseInjectionHandler, NodeAffinityHandler},
    registry::{Registry, RegistryError},
    renewal::{CertificateRenewer, TrustBundleTarget},
    telemetry::{Tracing, TracingError},
    tls::{CertificateResolver, CertificateResolverError},
    trust_bundle::{TrustBundle, TrustBundleError, patch_trust_bundle, watch_trust_bundle},
};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::info;

const SERVICE_NAME: &str = "fluid-webhook";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing { source: TracingError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to ensure a valid certificate"))]
    EnsureCertificate { source: EnsureCertError },

    #[snafu(display("failed to write certificate files"))]
    WritePemFiles {
        source: fluid_certs::files::WritePemFilesError,
    },

    #[snafu(display("failed to load certificate into the TLS server"))]
    LoadCertificate { source: CertificateResolverError },

    #[snafu(display("failed to publish trust bundle"))]
    PublishTrustBundle { source: TrustBundleError },

    #[snafu(display("failed to register admission handlers"))]
    RegisterHandlers { source: RegistryError },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: WebhookError },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: WebhookError },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    match Command::parse() {
        Command::PrintConfig(arguments) => {
            println!("{arguments:#?}");
            Ok(())
        }
        Command::Run(arguments) => run(arguments).await,
    }
}

async fn run(arguments: RunArguments) -> Result<(), Error> {
    // NOTE: Keep the guard in scope for the whole runtime of the webhook
    let _tracing_guard = Tracing::pre_configured(SERVICE_NAME, arguments.telemetry.clone())
        .init()
        .context(InitTracingSnafu)?;

    info!(
        webhook.name = %arguments.webhook_name,
        webhook.namespace = %arguments.webhook_namespace,
        "starting {SERVICE_NAME}"
    );

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;

    let dns_name = arguments.dns_name();
    let store = SecretCertStore::new(
        client.clone(),
        &arguments.webhook_namespace,
        &arguments.cert_secret_name,
    );
    let manager = Arc::new(
        CertificateLifecycleManager::new(store).with_store_timeout(arguments.store_timeout),
    );

    let (artifacts, changed) = manager
        .ensure_cert(&dns_name)
        .await
        .context(EnsureCertificateSnafu)?;
    info!(certificate.changed = changed, "certificate is ready");

    write_pem_files(&arguments.cert_dir, &artifacts)
        .await
        .context(WritePemFilesSnafu)?;
    let cert_resolver =
        Arc::new(CertificateResolver::new(&artifacts).context(LoadCertificateSnafu)?);

    patch_trust_bundle(&client, &arguments.webhook_name, &artifacts.ca_cert)
        .await
        .context(PublishTrustBundleSnafu)?;
    let trust_bundle = Arc::new(TrustBundle::new(artifacts.ca_cert.clone()));

    let cancel = CancellationToken::new();

    tokio::spawn(watch_trust_bundle(
        client.clone(),
        arguments.webhook_name.clone(),
        Arc::clone(&trust_bundle),
        cancel.clone(),
    ));

    let renewer = CertificateRenewer::new(
        manager,
        dns_name,
        arguments.cert_dir.clone(),
        Arc::clone(&cert_resolver),
        trust_bundle,
    )
    .with_trust_bundle_target(TrustBundleTarget {
        client: client.clone(),
        mwc_name: arguments.webhook_name.clone(),
    });
    tokio::spawn(renewer.run(cancel.clone()));

    let registry = build_registry(&arguments, &client).context(RegisterHandlersSnafu)?;
    let server = WebhookServer::new(registry.into_router(), arguments.socket_addr(), cert_resolver)
        .context(CreateWebhookServerSnafu)?;

    let result = server.run().await.context(RunWebhookServerSnafu);
    cancel.cancel();

    result
}

fn build_registry(arguments: &RunArguments, client: &kube::Client) -> Result<Registry, RegistryError> {
    let settings = arguments.admission_settings();

    let dataset_resolver: Arc<dyn DatasetResolver> = Arc::new(CachedDatasetResolver::new(
        KubeDatasetResolver::new(client.clone()),
        arguments
            .cache
            .runtime_info_cache()
            .map(RuntimeInfoCache::new),
    ));

    let fuse_handler = FuseInjectionHandler::new(
        settings,
        InjectionEngine::default(),
        Arc::clone(&dataset_resolver),
        Arc::new(DaemonSetTemplateProvider::new(client.clone())),
        FuseTemplateCache::new(arguments.cache.fuse_template_cache()),
    );
    let node_affinity_handler = NodeAffinityHandler::new(settings, dataset_resolver);

    let node_affinity_enabled = !arguments.disable_node_affinity;
    let registry = Registry::builder()
        .register(FUSE_HANDLER_PATH, Arc::new(fuse_handler))?
        .register_gated(
            NODE_AFFINITY_HANDLER_PATH,
            Arc::new(node_affinity_handler),
            move || node_affinity_enabled,
        )?
        .build();

    Ok(registry)
}
