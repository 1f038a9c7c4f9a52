//! Reads or generates the RSA 4096-bit key pair used to authenticate to
//! provisioned hosts.

use std::path::Path;

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyPairError {
    #[error("failed to create SSH key directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read SSH key at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write SSH key at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to generate RSA key pair: {0}")]
    Generate(ssh_key::Error),
    #[error("failed to parse SSH key: {0}")]
    Parse(ssh_key::Error),
}

/// Ensures a key pair exists at `key_path`, generating one (with an
/// owner-only parent directory) if absent. Returns the OpenSSH public key
/// string.
pub async fn read_or_generate(key_path: &Path) -> Result<String, KeyPairError> {
    if key_path.exists() {
        return read_public_key(key_path).await;
    }

    if let Some(parent) = key_path.parent() {
        create_private_dir(parent).await?;
    }

    let private_key =
        PrivateKey::random(&mut OsRng, Algorithm::Rsa { hash: None }).map_err(KeyPairError::Generate)?;

    let pem = private_key
        .to_openssh(LineEnding::LF)
        .map_err(KeyPairError::Generate)?;
    tokio::fs::write(key_path, pem.as_bytes())
        .await
        .map_err(|source| KeyPairError::Write {
            path: key_path.display().to_string(),
            source,
        })?;
    set_owner_only_permissions(key_path).await?;

    let public = private_key.public_key().to_openssh().map_err(KeyPairError::Generate)?;
    let public_path = key_path.with_extension("pub");
    tokio::fs::write(&public_path, format!("{public}\n"))
        .await
        .map_err(|source| KeyPairError::Write {
            path: public_path.display().to_string(),
            source,
        })?;

    Ok(public)
}

async fn read_public_key(key_path: &Path) -> Result<String, KeyPairError> {
    let public_path = key_path.with_extension("pub");
    if public_path.exists() {
        let content = tokio::fs::read_to_string(&public_path)
            .await
            .map_err(|source| KeyPairError::Read {
                path: public_path.display().to_string(),
                source,
            })?;
        return Ok(content.trim().to_string());
    }

    let bytes = tokio::fs::read(key_path).await.map_err(|source| KeyPairError::Read {
        path: key_path.display().to_string(),
        source,
    })?;
    let private_key = PrivateKey::from_openssh(&bytes).map_err(KeyPairError::Parse)?;
    private_key
        .public_key()
        .to_openssh()
        .map_err(KeyPairError::Parse)
}

#[cfg(unix)]
async fn create_private_dir(path: &Path) -> Result<(), KeyPairError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| KeyPairError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .map_err(|source| KeyPairError::CreateDir {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(not(unix))]
async fn create_private_dir(path: &Path) -> Result<(), KeyPairError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| KeyPairError::CreateDir {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<(), KeyPairError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|source| KeyPairError::Write {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<(), KeyPairError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reuses_key_pair() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_rsa");

        let first = read_or_generate(&key_path).await.unwrap();
        assert!(first.starts_with("ssh-rsa "));

        let second = read_or_generate(&key_path).await.unwrap();
        assert_eq!(first, second);
    }
}
