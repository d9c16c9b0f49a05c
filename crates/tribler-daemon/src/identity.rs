//! Long-term X25519 identity, stored hex-encoded in `identity.key`.

use std::path::Path;

use anyhow::Context;
use tracing::info;
use tribler_crypto::x25519::X25519StaticSecret;

pub const IDENTITY_FILE: &str = "identity.key";

/// Load the identity from `data_dir`, generating one on first run.
pub fn load_or_create(data_dir: &Path) -> anyhow::Result<X25519StaticSecret> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let secret = X25519StaticSecret::from_hex(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        return Ok(secret);
    }

    let secret = X25519StaticSecret::random();
    std::fs::write(&path, secret.to_hex()).with_context(|| format!("writing {}", path.display()))?;
    restrict(&path)?;
    info!(
        public_key = %secret.public_key().to_hex(),
        "generated new identity"
    );
    Ok(secret)
}

#[cfg(unix)]
fn restrict(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
