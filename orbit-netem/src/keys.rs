//! WireGuard key material.

use std::{
    fmt, fs,
    io::{self, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

const PRIVATE_KEY_MODE: u32 = 0o600;

pub struct KeyPair {
    private: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&private);
        Self { private, public }
    }

    pub fn public_key(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    pub fn private_key(&self) -> String {
        STANDARD.encode(self.private.to_bytes())
    }

    /// Writes the private key where `wg set … private-key` can read it,
    /// readable by the owner only.
    pub fn persist(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PRIVATE_KEY_MODE)
            .open(path)?;
        // `mode` only applies on creation.
        file.set_permissions(fs::Permissions::from_mode(PRIVATE_KEY_MODE))?;
        writeln!(file, "{}", self.private_key())?;
        file.sync_all()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("orbit-netem-keys-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn public_key_is_derived_from_private_key() {
        let pair = KeyPair::generate();
        let private: [u8; 32] = STANDARD
            .decode(pair.private_key())
            .unwrap()
            .try_into()
            .unwrap();
        let public = PublicKey::from(&StaticSecret::from(private));
        assert_eq!(STANDARD.encode(public.as_bytes()), pair.public_key());
        assert_eq!(pair.public_key().len(), 44);
    }

    #[test]
    fn fresh_pairs_differ() {
        assert_ne!(KeyPair::generate().public_key(), KeyPair::generate().public_key());
    }

    #[test]
    fn persisted_key_is_owner_only_and_truncated() {
        let path = scratch("wgkey");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "x".repeat(200)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let pair = KeyPair::generate();
        pair.persist(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), pair.private_key());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn debug_hides_private_key() {
        let pair = KeyPair::generate();
        let rendered = format!("{pair:?}");
        assert!(rendered.contains(&pair.public_key()));
        assert!(!rendered.contains(&pair.private_key()));
    }
}
