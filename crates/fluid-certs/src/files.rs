//! Places a [`CertificateArtifacts`] bundle on disk.
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    CertificateArtifacts,
    store::{CA_CERT_FILE_NAME, CA_KEY_FILE_NAME, SERVING_CERT_FILE_NAME, SERVING_KEY_FILE_NAME},
};

/// Alternative name of the serving key, as expected by most TLS servers.
pub const TLS_KEY_FILE_NAME: &str = "tls.key";

/// Alternative name of the serving certificate, as expected by most TLS
/// servers.
pub const TLS_CERT_FILE_NAME: &str = "tls.crt";

#[derive(Debug, Snafu)]
pub enum WritePemFilesError {
    #[snafu(display("failed to create certificate directory {path:?}"))]
    CreateDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write temporary file {path:?}"))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to move {from:?} to {to:?}"))]
    RenameFile {
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },
}

/// Writes all PEM files of `artifacts` into `dir`, creating it if needed.
///
/// Every file is first written next to its final location and then renamed,
/// so readers never observe a partially written file.
#[instrument(name = "write_pem_files", skip(artifacts), fields(certificate.dir = %dir.display()))]
pub async fn write_pem_files(
    dir: &Path,
    artifacts: &CertificateArtifacts,
) -> Result<(), WritePemFilesError> {
    tokio::fs::create_dir_all(dir)
        .await
        .context(CreateDirectorySnafu { path: dir })?;

    let files = [
        (CA_KEY_FILE_NAME, &artifacts.ca_key),
        (CA_CERT_FILE_NAME, &artifacts.ca_cert),
        (SERVING_KEY_FILE_NAME, &artifacts.serving_key),
        (SERVING_CERT_FILE_NAME, &artifacts.serving_cert),
        (TLS_KEY_FILE_NAME, &artifacts.serving_key),
        (TLS_CERT_FILE_NAME, &artifacts.serving_cert),
    ];

    for (file_name, contents) in files {
        let path = dir.join(file_name);
        let temp_path = dir.join(format!(".{file_name}.tmp"));

        tokio::fs::write(&temp_path, contents)
            .await
            .context(WriteFileSnafu { path: &temp_path })?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .with_context(|_| RenameFileSnafu {
                from: temp_path.clone(),
                to: path.clone(),
            })?;
    }

    debug!("wrote certificate files");
    Ok(())
}
