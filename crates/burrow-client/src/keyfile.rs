//! Key material on disk
//!
//! The file holds `{"public_key": ..., "secret_key": ...}` as written by
//! [`Keypair::to_json`]. It is created with a fresh keypair on first use, so
//! a client keeps the same identity (and its subdomain) across restarts.

use burrow_auth::Keypair;
use std::path::Path;
use tracing::info;

use crate::ClientError;

/// Load the keypair at `path`, generating and saving one if the file is missing
pub async fn load_or_generate(path: &Path) -> Result<Keypair, ClientError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let keypair = Keypair::from_json(&text)?;
            info!("Loaded identity {} from {}", keypair.public_key_base64(), path.display());
            Ok(keypair)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            save(path, &keypair).await?;
            info!(
                "Generated identity {} in {}",
                keypair.public_key_base64(),
                path.display()
            );
            Ok(keypair)
        }
        Err(e) => Err(ClientError::KeyFile(format!("{}: {}", path.display(), e))),
    }
}

/// Write key material, readable by the owner only on unix
pub async fn save(path: &Path, keypair: &Keypair) -> Result<(), ClientError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ClientError::KeyFile(format!("{}: {}", parent.display(), e)))?;
    }

    tokio::fs::write(path, keypair.to_json())
        .await
        .map_err(|e| ClientError::KeyFile(format!("{}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| ClientError::KeyFile(format!("{}: {}", path.display(), e)))?;
    }

    Ok(())
}
