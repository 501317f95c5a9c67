//! Periodically renews the serving certificate and publishes rotated bundles.
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use fluid_certs::{
    CertificateArtifacts, CertificateLifecycleManager,
    files::{WritePemFilesError, write_pem_files},
    manager::EnsureCertError,
    store::CertArtifactStore,
    validation::serving_cert_not_after,
};
use kube::Client;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    tls::{CertificateResolver, CertificateResolverError},
    trust_bundle::{TrustBundle, TrustBundleError, patch_trust_bundle},
};

/// How long before expiry the certificate is renewed.
pub const RENEWAL_MARGIN: Duration = Duration::from_secs(24 * 60 * 60);

/// How long to wait after a failed renewal cycle.
pub const RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

pub type Result<T, E = RenewalError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum RenewalError {
    #[snafu(display("failed to ensure a valid certificate"))]
    EnsureCertificate { source: EnsureCertError },

    #[snafu(display("failed to write certificate files"))]
    WritePemFiles { source: WritePemFilesError },

    #[snafu(display("failed to load rotated certificate into the TLS server"))]
    RotateCertificate { source: CertificateResolverError },

    #[snafu(display("failed to publish trust bundle"))]
    PublishTrustBundle { source: TrustBundleError },
}

/// The MutatingWebhookConfiguration which receives the CA of rotated bundles.
#[derive(Clone)]
pub struct TrustBundleTarget {
    pub client: Client,
    pub mwc_name: String,
}

/// Returns how long to wait before the next renewal cycle for a serving
/// certificate expiring at `not_after`.
pub fn next_renewal_delay(not_after: Option<SystemTime>, now: SystemTime) -> Duration {
    let Some(not_after) = not_after else {
        return RETRY_DELAY;
    };

    not_after
        .duration_since(now)
        .unwrap_or_default()
        .saturating_sub(RENEWAL_MARGIN)
}

/// Keeps the certificate of a running webhook valid.
///
/// Every cycle ensures a valid bundle. A bundle which is not yet served, be it
/// rotated by this or by another replica, is published as trust bundle,
/// written to `cert_dir` and swapped into the TLS server. A failed publish is
/// therefore retried by the next cycle.
pub struct CertificateRenewer<S> {
    manager: Arc<CertificateLifecycleManager<S>>,
    dns_name: String,
    cert_dir: PathBuf,
    resolver: Arc<CertificateResolver>,
    trust_bundle: Arc<TrustBundle>,
    target: Option<TrustBundleTarget>,
}

impl<S> CertificateRenewer<S>
where
    S: CertArtifactStore,
{
    pub fn new(
        manager: Arc<CertificateLifecycleManager<S>>,
        dns_name: impl Into<String>,
        cert_dir: impl Into<PathBuf>,
        resolver: Arc<CertificateResolver>,
        trust_bundle: Arc<TrustBundle>,
    ) -> Self {
        Self {
            manager,
            dns_name: dns_name.into(),
            cert_dir: cert_dir.into(),
            resolver,
            trust_bundle,
            target: None,
        }
    }

    /// Publishes the CA of rotated bundles to `target`.
    pub fn with_trust_bundle_target(mut self, target: TrustBundleTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Runs renewal cycles until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(certificate.dns_name = %self.dns_name, "starting certificate renewal");

        while !cancel.is_cancelled() {
            let delay = match self.renew().await {
                Ok(delay) => delay,
                Err(err) => {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        retry_in = %humantime::format_duration(RETRY_DELAY),
                        "certificate renewal failed, backing off"
                    );
                    RETRY_DELAY
                }
            };

            debug!(next_renewal_in = %humantime::format_duration(delay), "waiting for next renewal");
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!("stopped certificate renewal");
    }

    /// Runs a single renewal cycle and returns the delay until the next one.
    #[instrument(name = "renew_certificate", skip(self), fields(certificate.dns_name = %self.dns_name))]
    pub async fn renew(&self) -> Result<Duration> {
        let (artifacts, changed) = self
            .manager
            .ensure_cert(&self.dns_name)
            .await
            .context(EnsureCertificateSnafu)?;

        if changed || !self.is_published(&artifacts) {
            info!(
                certificate.rotated_here = changed,
                "certificate bundle not served yet, publishing"
            );
            self.publish(&artifacts).await?;
        }

        Ok(next_renewal_delay(
            serving_cert_not_after(&artifacts),
            SystemTime::now(),
        ))
    }

    fn is_published(&self, artifacts: &CertificateArtifacts) -> bool {
        self.resolver.serves(artifacts) && self.trust_bundle.is_published(&artifacts.ca_cert)
    }

    /// Publishes the new CA alongside the previous one before serving the
    /// certificate it issued, so callers trust either side of the rotation.
    async fn publish(&self, artifacts: &CertificateArtifacts) -> Result<()> {
        let bundle = self.trust_bundle.rotated_to(&artifacts.ca_cert);
        if let Some(target) = &self.target {
            patch_trust_bundle(&target.client, &target.mwc_name, &bundle)
                .await
                .context(PublishTrustBundleSnafu)?;
        }
        self.trust_bundle.update(bundle);

        write_pem_files(&self.cert_dir, artifacts)
            .await
            .context(WritePemFilesSnafu)?;

        self.resolver
            .rotate_certificate(artifacts)
            .context(RotateCertificateSnafu)
    }
}

#[cfg(test)]
mod tests {
    use fluid_certs::{CertGenerator, store::InMemoryCertStore};
    use rstest::rstest;

    use super::*;

    const DNS_NAME: &str = "fluid-pod-admission-webhook.fluid-system.svc";
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[rstest]
    #[case::far_away(Some(10 * DAY), 9 * DAY)]
    #[case::within_margin(Some(DAY / 2), Duration::ZERO)]
    #[case::expired(None, RETRY_DELAY)]
    fn renewal_delays(#[case] expires_in: Option<Duration>, #[case] expected: Duration) {
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;

        let not_after = expires_in.map(|expires_in| now + expires_in);
        assert_eq!(next_renewal_delay(not_after, now), expected);
    }

    #[test]
    fn past_expiry_renews_immediately() {
        let now = SystemTime::UNIX_EPOCH + 1000 * DAY;

        assert_eq!(next_renewal_delay(Some(now - DAY), now), Duration::ZERO);
    }

    fn renewer<S: CertArtifactStore>(
        store: S,
        cert_dir: &std::path::Path,
        initial: &CertificateArtifacts,
    ) -> (CertificateRenewer<S>, Arc<CertificateResolver>, Arc<TrustBundle>) {
        let resolver = Arc::new(CertificateResolver::new(initial).unwrap());
        let trust_bundle = Arc::new(TrustBundle::new(initial.ca_cert.clone()));
        let renewer = CertificateRenewer::new(
            Arc::new(CertificateLifecycleManager::new(store)),
            DNS_NAME,
            cert_dir,
            Arc::clone(&resolver),
            Arc::clone(&trust_bundle),
        );

        (renewer, resolver, trust_bundle)
    }

    #[tokio::test]
    async fn changed_bundles_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let initial = CertGenerator::default().generate(DNS_NAME).unwrap();
        let (renewer, resolver, trust_bundle) = renewer(InMemoryCertStore::new(), dir.path(), &initial);
        let before = resolver.current_certified_key();

        let delay = renewer.renew().await.unwrap();

        assert!(delay > Duration::ZERO);
        assert!(!Arc::ptr_eq(&before, &resolver.current_certified_key()));
        assert!(!trust_bundle.is_published(&initial.ca_cert));
        assert!(trust_bundle.current().ends_with(&initial.ca_cert));
        assert!(dir.path().join("tls.crt").exists());
    }

    #[tokio::test]
    async fn bundles_rotated_by_another_replica_are_published() {
        let store = Arc::new(InMemoryCertStore::new());
        let initial = CertGenerator::default().generate(DNS_NAME).unwrap();
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (renewer_a, resolver_a, _) = renewer(Arc::clone(&store), dir_a.path(), &initial);
        let (renewer_b, resolver_b, trust_bundle_b) =
            renewer(Arc::clone(&store), dir_b.path(), &initial);

        renewer_a.renew().await.unwrap();
        renewer_b.renew().await.unwrap();

        let served_a = resolver_a.current_certified_key();
        let served_b = resolver_b.current_certified_key();
        assert!(!resolver_b.serves(&initial));
        assert_eq!(served_a.cert[0], served_b.cert[0]);
        assert!(!trust_bundle_b.is_published(&initial.ca_cert));
        assert!(dir_b.path().join("tls.crt").exists());

        // Nothing left to publish
        renewer_b.renew().await.unwrap();
        assert!(Arc::ptr_eq(&served_b, &resolver_b.current_certified_key()));
    }

    #[tokio::test]
    async fn failed_publishes_are_retried() {
        let root = tempfile::tempdir().unwrap();
        let cert_dir = root.path().join("certs");
        std::fs::write(&cert_dir, b"not a directory").unwrap();
        let initial = CertGenerator::default().generate(DNS_NAME).unwrap();
        let (renewer, resolver, _) = renewer(InMemoryCertStore::new(), &cert_dir, &initial);

        let err = renewer.renew().await.unwrap_err();
        assert!(matches!(err, RenewalError::WritePemFiles { .. }), "{err:?}");
        assert!(resolver.serves(&initial));

        std::fs::remove_file(&cert_dir).unwrap();
        std::fs::create_dir(&cert_dir).unwrap();
        renewer.renew().await.unwrap();

        assert!(!resolver.serves(&initial));
        assert!(cert_dir.join("tls.crt").exists());
    }

    #[tokio::test]
    async fn unchanged_bundles_are_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let initial = CertGenerator::default().generate(DNS_NAME).unwrap();
        let store = InMemoryCertStore::with_artifacts(initial.clone());
        let (renewer, resolver, trust_bundle) = renewer(store, dir.path(), &initial);
        let before = resolver.current_certified_key();

        renewer.renew().await.unwrap();

        assert!(Arc::ptr_eq(&before, &resolver.current_certified_key()));
        assert_eq!(*trust_bundle.current(), initial.ca_cert);
        assert!(!dir.path().join("tls.crt").exists());
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let initial = CertGenerator::default().generate(DNS_NAME).unwrap();
        let store = InMemoryCertStore::with_artifacts(initial.clone());
        let (renewer, ..) = renewer(store, dir.path(), &initial);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(renewer.run(cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
