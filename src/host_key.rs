//! Gateway host key persistence.

use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::PrivateKey;
use sha2::{Digest, Sha256};
use tracing::info;

/// Size of freshly generated RSA host keys.
const RSA_KEY_BITS: usize = 2048;

/// Load the host key from `path`, or generate and persist a new RSA key.
pub async fn load_or_generate(path: &Path) -> Result<PrivateKey> {
    use russh::keys::ssh_key::LineEnding;
    use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
    use russh::keys::ssh_key::rand_core::OsRng;

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        return Ok(key);
    }

    info!("Generating new {}-bit RSA host key", RSA_KEY_BITS);
    let keypair =
        RsaKeypair::random(&mut OsRng, RSA_KEY_BITS).context("Failed to generate host key")?;
    let key = PrivateKey::new(KeypairData::from(keypair), "container-gateway")
        .context("Failed to build host key")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let pem = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    write_owner_only(path, pem.as_bytes())
        .await
        .with_context(|| format!("Failed to write host key to {}", path.display()))?;

    info!("Saved host key to {}", path.display());
    Ok(key)
}

/// Create `path` readable by its owner only and write `contents` to it.
async fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

/// SHA256 fingerprint in the "SHA256:..." form printed by `ssh-keygen -l`.
pub fn fingerprint(key: &PrivateKey) -> String {
    use russh::keys::PublicKeyBase64;

    let mut hasher = Sha256::new();
    hasher.update(key.public_key().public_key_bytes());
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}
