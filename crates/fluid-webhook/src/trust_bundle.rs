//! Publishes the CA certificate as the trust bundle of the
//! MutatingWebhookConfiguration, so the API server trusts the serving
//! certificate.
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::{StreamExt as _, TryStreamExt as _};
use k8s_openapi::{ByteString, api::admissionregistration::v1::MutatingWebhookConfiguration};
use kube::{
    Api, Client,
    api::PostParams,
    runtime::watcher::{self, Event},
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub type Result<T, E = TrustBundleError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TrustBundleError {
    #[snafu(display("failed to get MutatingWebhookConfiguration {mwc_name:?}"))]
    GetMutatingWebhookConfiguration {
        source: kube::Error,
        mwc_name: String,
    },

    #[snafu(display("MutatingWebhookConfiguration {mwc_name:?} does not exist"))]
    MissingMutatingWebhookConfiguration { mwc_name: String },

    #[snafu(display("failed to replace MutatingWebhookConfiguration {mwc_name:?}"))]
    ReplaceMutatingWebhookConfiguration {
        source: kube::Error,
        mwc_name: String,
    },
}

const PEM_CERTIFICATE_END: &[u8] = b"-----END CERTIFICATE-----";

/// The PEM encoded CA certificates currently published as trust bundle.
///
/// Shared between the renewal loop, which stores a new bundle after rotation,
/// and the watcher, which re-publishes whatever is current. The first
/// certificate of the bundle is the CA of the served certificate.
#[derive(Debug)]
pub struct TrustBundle {
    ca_cert: ArcSwap<Vec<u8>>,
}

impl TrustBundle {
    pub fn new(ca_cert: Vec<u8>) -> Self {
        Self {
            ca_cert: ArcSwap::from_pointee(ca_cert),
        }
    }

    pub fn current(&self) -> Arc<Vec<u8>> {
        self.ca_cert.load_full()
    }

    pub fn update(&self, ca_cert: Vec<u8>) {
        self.ca_cert.store(Arc::new(ca_cert));
    }

    /// Returns whether `ca_cert` leads the current bundle.
    pub fn is_published(&self, ca_cert: &[u8]) -> bool {
        self.current().starts_with(ca_cert)
    }

    /// Returns the bundle to publish when rotating to `ca_cert`: the new CA
    /// followed by the CA which leads the current bundle, so that certificates
    /// issued by either are trusted until every server serves the new one.
    ///
    /// A bundle already led by `ca_cert` is returned unchanged.
    pub fn rotated_to(&self, ca_cert: &[u8]) -> Vec<u8> {
        let current = self.current();
        if current.starts_with(ca_cert) {
            return current.to_vec();
        }

        let previous = first_certificate(&current);
        let mut bundle = ca_cert.to_vec();
        if previous.is_empty() || previous == ca_cert.trim_ascii_end() {
            return bundle;
        }

        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(previous);
        bundle.push(b'\n');

        bundle
    }
}

/// Returns the first PEM certificate of `bundle`, the whole bundle if it
/// contains no complete certificate.
fn first_certificate(bundle: &[u8]) -> &[u8] {
    bundle
        .windows(PEM_CERTIFICATE_END.len())
        .position(|window| window == PEM_CERTIFICATE_END)
        .map_or(bundle.trim_ascii_end(), |start| {
            &bundle[..start + PEM_CERTIFICATE_END.len()]
        })
}

/// Returns whether a watch `event` requires re-publishing `ca_cert`.
///
/// Only created or updated configurations which do not carry `ca_cert` on
/// every entry are re-published. Deletions are ignored.
pub fn needs_republish(event: &Event<MutatingWebhookConfiguration>, ca_cert: &[u8]) -> bool {
    match event {
        Event::Apply(mwc) | Event::InitApply(mwc) => with_trust_bundle(mwc, ca_cert) != *mwc,
        Event::Delete(_) | Event::Init | Event::InitDone => false,
    }
}

/// Returns a copy of `mwc` with `ca_cert` as the trust bundle of every entry.
pub fn with_trust_bundle(
    mwc: &MutatingWebhookConfiguration,
    ca_cert: &[u8],
) -> MutatingWebhookConfiguration {
    let mut mwc = mwc.clone();

    for webhook in mwc.webhooks.iter_mut().flatten() {
        webhook.client_config.ca_bundle = Some(ByteString(ca_cert.to_vec()));
    }

    mwc
}

/// Sets `ca_cert` as the trust bundle of every entry of the
/// MutatingWebhookConfiguration `mwc_name`.
///
/// Nothing is written when every entry already carries `ca_cert`.
#[instrument(
    name = "patch_trust_bundle",
    skip(client, ca_cert),
    fields(k8s.mutatingwebhookconfiguration.name = %mwc_name)
)]
pub async fn patch_trust_bundle(client: &Client, mwc_name: &str, ca_cert: &[u8]) -> Result<()> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());

    let current = api
        .get_opt(mwc_name)
        .await
        .with_context(|_| GetMutatingWebhookConfigurationSnafu { mwc_name })?
        .with_context(|| MissingMutatingWebhookConfigurationSnafu { mwc_name })?;

    let desired = with_trust_bundle(&current, ca_cert);
    if desired == current {
        debug!("trust bundle is up to date");
        return Ok(());
    }

    api.replace(mwc_name, &PostParams::default(), &desired)
        .await
        .with_context(|_| ReplaceMutatingWebhookConfigurationSnafu { mwc_name })?;

    info!(
        webhook.entries = desired.webhooks.as_ref().map_or(0, Vec::len),
        "published trust bundle"
    );

    Ok(())
}

/// Re-publishes the current `trust_bundle` whenever the MutatingWebhookConfiguration `mwc_name`
/// changes, for example after it was re-applied by a deployment tool.
///
/// Errors are logged and the watch continues until `cancel` fires.
pub async fn watch_trust_bundle(
    client: Client,
    mwc_name: String,
    trust_bundle: Arc<TrustBundle>,
    cancel: CancellationToken,
) {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let config = watcher::Config::default().fields(&format!("metadata.name={mwc_name}"));
    let mut stream = watcher::watcher(api, config).boxed();

    info!(k8s.mutatingwebhookconfiguration.name = %mwc_name, "watching trust bundle");

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(event)) => {
                let ca_cert = trust_bundle.current();
                if !needs_republish(&event, &ca_cert) {
                    continue;
                }
                if let Err(err) = patch_trust_bundle(&client, &mwc_name, &ca_cert).await {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to re-publish trust bundle"
                    );
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "trust bundle watch failed"
                );
            }
        }
    }

    debug!("stopped watching trust bundle");
}
