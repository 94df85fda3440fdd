//! TLS material
//!
//! The HTTPS server presents a self-signed certificate generated on first
//! start and persisted under the state directory as `secret.key` and
//! `cert.pem`, so the presented identity is stable across restarts.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use passim_core::{Error, Result};
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};
use tracing::info;

fn crypto_err(e: rcgen::Error) -> Error {
    Error::Io(std::io::Error::other(format!("TLS material: {}", e)))
}

/// Load the persisted key and certificate, generating whichever is missing.
/// Returns `(cert_path, key_path)` ready for the TLS acceptor.
pub fn load_or_generate(statedir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(statedir)?;
    let key_path = statedir.join("secret.key");
    let cert_path = statedir.join("cert.pem");

    let key_pair = if key_path.exists() {
        KeyPair::from_pem(&std::fs::read_to_string(&key_path)?).map_err(crypto_err)?
    } else {
        let key_pair = KeyPair::generate().map_err(crypto_err)?;
        std::fs::write(&key_path, key_pair.serialize_pem())?;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        key_pair
    };

    if !cert_path.exists() {
        let mut params =
            CertificateParams::new(vec!["localhost".to_string()]).map_err(crypto_err)?;
        params
            .distinguished_name
            .push(DnType::CommonName, "Passim");
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        let cert = params.self_signed(&key_pair).map_err(crypto_err)?;
        std::fs::write(&cert_path, cert.pem())?;
    }

    info!(
        "using secret key {} and certificate {}",
        key_path.display(),
        cert_path.display()
    );
    Ok((cert_path, key_path))
}
