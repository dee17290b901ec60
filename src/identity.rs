//! Lazily generated, persisted relay identity keypair, used to populate
//! the `pubkey` field of the NIP-11 document (spec.md §4.7).
use crate::error::Result;
use secp256k1::{rand, KeyPair, Secp256k1};
use std::path::{Path, PathBuf};

/// The relay's own keypair. Generated once and persisted as a hex secret
/// key file so restarts keep the same public identity.
pub struct RelayIdentity {
    keypair: KeyPair,
}

impl RelayIdentity {
    /// Load the keypair from `path`, generating and persisting a new one
    /// if it doesn't exist yet.
    pub fn load_or_generate(path: &Path) -> Result<RelayIdentity> {
        let secp = Secp256k1::new();
        if let Ok(contents) = std::fs::read_to_string(path) {
            let bytes = hex::decode(contents.trim())?;
            let keypair = KeyPair::from_seckey_slice(&secp, &bytes)?;
            return Ok(RelayIdentity { keypair });
        }
        let mut rng = rand::thread_rng();
        let keypair = KeyPair::new(&secp, &mut rng);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, hex::encode(keypair.secret_bytes()))?;
        Ok(RelayIdentity { keypair })
    }

    #[must_use]
    pub fn ephemeral() -> RelayIdentity {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        RelayIdentity {
            keypair: KeyPair::new(&secp, &mut rng),
        }
    }

    /// Hex-encoded x-only public key, the form the wire protocol uses.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        let (xonly, _) = self.keypair.x_only_public_key();
        hex::encode(xonly.serialize())
    }
}

#[must_use]
pub fn default_identity_path(base_dir: &Path) -> PathBuf {
    base_dir.join("relay_identity.hex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_then_reloads_same_key() {
        let dir = std::env::temp_dir().join(format!(
            "atlas-relay-identity-test-{}",
            std::process::id()
        ));
        let path = default_identity_path(&dir);
        let id1 = RelayIdentity::load_or_generate(&path).unwrap();
        let id2 = RelayIdentity::load_or_generate(&path).unwrap();
        assert_eq!(id1.public_key_hex(), id2.public_key_hex());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ephemeral_keys_have_valid_hex_pubkey() {
        let id = RelayIdentity::ephemeral();
        assert_eq!(id.public_key_hex().len(), 64);
        assert!(hex::decode(id.public_key_hex()).is_ok());
    }
}
