use crate::utils::error::{ProxySshError, Result};
use crate::utils::prompt::Prompter;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PrivateKey;
use std::path::Path;

/// Service for loading SSH private keys
pub struct KeyService;

impl KeyService {
    /// Read and decode a private key file, asking for a passphrase when the
    /// key is encrypted.
    pub fn load_private_key(path: &Path, prompter: &dyn Prompter) -> Result<PrivateKey> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProxySshError::KeyFileNotFound(path.display().to_string())
            } else {
                ProxySshError::KeyLoadFailed(format!("{}: {}", path.display(), e))
            }
        })?;

        Self::check_permissions(path);

        let passphrase = if Self::needs_passphrase(&data) {
            tracing::debug!("Private key {} is encrypted", path.display());
            Some(prompter.read_secret(&format!("Passphrase for {}", path.display()))?)
        } else {
            None
        };

        let key = Self::decode_private_key(&data, passphrase.as_deref())?;
        tracing::info!(
            "Loaded {} key {} ({})",
            key.algorithm().as_str(),
            path.display(),
            Self::fingerprint(&key)
        );
        Ok(key)
    }

    /// Whether decoding `data` requires a passphrase
    pub fn needs_passphrase(data: &str) -> bool {
        match PrivateKey::from_openssh(data.trim()) {
            Ok(key) => key.is_encrypted(),
            // Legacy PEM marks encryption in its headers
            Err(_) => data.contains("ENCRYPTED"),
        }
    }

    /// Decode an OpenSSH or PEM private key
    pub fn decode_private_key(data: &str, passphrase: Option<&str>) -> Result<PrivateKey> {
        match PrivateKey::from_openssh(data.trim()) {
            Ok(key) if key.is_encrypted() => {
                let pass = passphrase.ok_or_else(|| {
                    ProxySshError::KeyLoadFailed(
                        "key is encrypted and no passphrase was given".to_string(),
                    )
                })?;
                key.decrypt(pass.as_bytes()).map_err(|e| {
                    ProxySshError::KeyLoadFailed(format!("Failed to decrypt key: {}", e))
                })
            }
            Ok(key) => Ok(key),
            Err(openssh_err) => russh::keys::decode_secret_key(data, passphrase).map_err(|e| {
                ProxySshError::KeyLoadFailed(format!(
                    "not a valid OpenSSH ({}) or PEM ({}) private key",
                    openssh_err, e
                ))
            }),
        }
    }

    /// SHA256 fingerprint of the key's public half
    pub fn fingerprint(key: &PrivateKey) -> String {
        key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    #[cfg(unix)]
    fn check_permissions(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                tracing::warn!(
                    "Private key {} is accessible by others (mode {:o})",
                    path.display(),
                    mode
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) {}
}
