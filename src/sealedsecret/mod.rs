//! Sealed secret decryption
//!
//! Sealed secrets are encrypted secrets stored in Git, decrypted into the
//! deploy source before manifests are loaded. The sealing-key scheme uses
//! age identities; the key material is validated at startup so a broken
//! configuration fails the process instead of the first deployment.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{SealedSecretManagement, SealedSecretManagementKind, SealedSecretMapping};
use crate::errors::PipedError;

pub trait Decrypter: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, PipedError>;
}

/// Decrypter backed by an age identity read from the configured key file.
pub struct SealingKeyDecrypter {
    identity: age::x25519::Identity,
}

impl SealingKeyDecrypter {
    pub async fn from_key_file(path: &str) -> Result<Self, PipedError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            PipedError::SecretError(format!("failed to read private key file {}: {}", path, e))
        })?;
        let identity = text
            .lines()
            .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .unwrap_or_default()
            .trim()
            .parse::<age::x25519::Identity>()
            .map_err(|e| PipedError::SecretError(format!("invalid sealing key: {}", e)))?;
        Ok(Self { identity })
    }
}

impl Decrypter for SealingKeyDecrypter {
    fn decrypt(&self, ciphertext: &str) -> Result<String, PipedError> {
        let armored = age::armor::ArmoredReader::new(ciphertext.as_bytes());
        let decryptor = age::Decryptor::new(armored)
            .map_err(|e| PipedError::SecretError(format!("invalid sealed secret: {}", e)))?;

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| PipedError::SecretError(format!("failed to decrypt: {}", e)))?;

        let mut plaintext = String::new();
        reader
            .read_to_string(&mut plaintext)
            .map_err(|e| PipedError::SecretError(format!("failed to decrypt: {}", e)))?;
        Ok(plaintext)
    }
}

/// Build the decrypter declared in the piped configuration, if any.
pub async fn build_decrypter(
    config: Option<&SealedSecretManagement>,
) -> Result<Option<Arc<dyn Decrypter>>, PipedError> {
    let Some(config) = config else {
        return Ok(None);
    };
    match config.kind {
        SealedSecretManagementKind::None => Ok(None),
        SealedSecretManagementKind::SealingKey => {
            let decrypter = SealingKeyDecrypter::from_key_file(&config.private_key_file).await?;
            info!("Initialized sealing-key secret decrypter");
            Ok(Some(Arc::new(decrypter)))
        }
        kind => Err(PipedError::SecretError(format!(
            "unsupported sealed secret management type: {:?}",
            kind
        ))),
    }
}

/// Decrypt every configured sealed secret into the deploy source.
pub async fn decrypt_into_deploy_source(
    decrypter: &dyn Decrypter,
    mappings: &[SealedSecretMapping],
    app_dir: &Path,
) -> Result<(), PipedError> {
    for mapping in mappings {
        let sealed_path = app_dir.join(&mapping.path);
        let ciphertext = tokio::fs::read_to_string(&sealed_path).await.map_err(|e| {
            PipedError::SecretError(format!(
                "failed to read sealed secret {}: {}",
                sealed_path.display(),
                e
            ))
        })?;
        let plaintext = decrypter.decrypt(&ciphertext)?;

        let out_dir = if mapping.out_dir.is_empty() {
            sealed_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| app_dir.to_path_buf())
        } else {
            app_dir.join(&mapping.out_dir)
        };
        let out_name = if mapping.out_filename.is_empty() {
            sealed_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("secret")
                .to_string()
        } else {
            mapping.out_filename.clone()
        };

        tokio::fs::create_dir_all(&out_dir).await?;
        tokio::fs::write(out_dir.join(out_name), plaintext).await?;
    }
    Ok(())
}
