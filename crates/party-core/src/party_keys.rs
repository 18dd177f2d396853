//! This party's long-term RSA keypair plus the three parties' public keys
//! in fixed order, and the DER concatenation used as part of every OAEP
//! context.

use anyhow::{anyhow, bail, Context, Result};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::config::PartyConfig;

pub struct PartyKeys {
    pub party_index: u8,
    pub party_pubkeys: [RsaPublicKey; 3],
    pub my_private_key: RsaPrivateKey,
}

impl PartyKeys {
    /// Loads and cross-checks the key set, failing fast on any mismatch:
    /// a configuration mismatch here is a fatal startup error.
    pub fn load(config: &PartyConfig) -> Result<Self> {
        if config.party_index > 2 {
            bail!("party_index must be 0, 1, or 2, got {}", config.party_index);
        }

        let private_pem = std::fs::read_to_string(&config.server_key)
            .with_context(|| format!("reading server_key {}", config.server_key.display()))?;
        let my_private_key = RsaPrivateKey::from_pkcs8_pem(&private_pem)
            .map_err(|e| anyhow!("server_key {} is not a private key: {e}", config.server_key.display()))?;

        let my_public_pem = std::fs::read_to_string(&config.server_cert)
            .with_context(|| format!("reading server_cert {}", config.server_cert.display()))?;
        let my_public_key = RsaPublicKey::from_public_key_pem(&my_public_pem)
            .map_err(|e| anyhow!("server_cert {} is not a public key: {e}", config.server_cert.display()))?;

        let mut party_pubkeys: Vec<RsaPublicKey> = Vec::with_capacity(3);
        for cert_path in &config.party_certs {
            let pem = std::fs::read_to_string(cert_path)
                .with_context(|| format!("reading party_certs entry {}", cert_path.display()))?;
            let key = RsaPublicKey::from_public_key_pem(&pem)
                .map_err(|e| anyhow!("party_certs entry {} is not a public key: {e}", cert_path.display()))?;
            party_pubkeys.push(key);
        }
        let party_pubkeys: [RsaPublicKey; 3] = party_pubkeys
            .try_into()
            .map_err(|_| anyhow!("party_certs must contain exactly 3 entries"))?;

        if party_pubkeys[config.party_index as usize] != my_public_key {
            bail!(
                "party_certs[{}] does not match server_cert: self-cert is not in the party set",
                config.party_index
            );
        }

        Ok(Self {
            party_index: config.party_index,
            party_pubkeys,
            my_private_key,
        })
    }

    pub fn my_public_key(&self) -> &RsaPublicKey {
        &self.party_pubkeys[self.party_index as usize]
    }

    /// DER encoding of each public key concatenated in party order.
    /// Stable byte-for-byte: used inside OAEP contexts and nonce derivation.
    pub fn party_keys_der_concatenated(&self) -> Result<Vec<u8>> {
        use rsa::pkcs8::EncodePublicKey;
        let mut out = Vec::new();
        for key in &self.party_pubkeys {
            let der = key
                .to_public_key_der()
                .map_err(|e| anyhow!("encoding party public key to DER: {e}"))?;
            out.extend_from_slice(der.as_bytes());
        }
        Ok(out)
    }

    pub fn my_public_key_der(&self) -> Result<Vec<u8>> {
        use rsa::pkcs8::EncodePublicKey;
        let der = self
            .my_public_key()
            .to_public_key_der()
            .map_err(|e| anyhow!("encoding my public key to DER: {e}"))?;
        Ok(der.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    fn write_keypair(dir: &std::path::Path, name: &str, priv_key: &RsaPrivateKey) -> (std::path::PathBuf, std::path::PathBuf) {
        let key_path = dir.join(format!("{name}.key"));
        let cert_path = dir.join(format!("{name}.cert"));
        std::fs::write(&key_path, priv_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        let pub_key = RsaPublicKey::from(priv_key);
        std::fs::write(&cert_path, pub_key.to_public_key_pem(LineEnding::LF).unwrap()).unwrap();
        (key_path, cert_path)
    }

    fn test_config(dir: &std::path::Path, party_index: u8) -> PartyConfig {
        let mut rng = rand::thread_rng();
        let keys: Vec<RsaPrivateKey> = (0..3)
            .map(|_| RsaPrivateKey::new(&mut rng, 1024).unwrap())
            .collect();
        let mut certs = Vec::new();
        let mut my_key_path = dir.join("unused.key");
        for (i, key) in keys.iter().enumerate() {
            let (key_path, cert_path) = write_keypair(dir, &format!("party{i}"), key);
            certs.push(cert_path);
            if i as u8 == party_index {
                my_key_path = key_path;
            }
        }
        PartyConfig {
            results_dir: dir.to_path_buf(),
            port: 0,
            ca_cert: dir.join("ca.pem"),
            server_cert: certs[party_index as usize].clone(),
            server_key: my_key_path,
            party_index,
            party_certs: [certs[0].clone(), certs[1].clone(), certs[2].clone()],
            server_id: "x".into(),
            server_secret: "y".into(),
            obelisk_base_url: "https://example".into(),
            models_dir: dir.to_path_buf(),
            cache_dir: dir.to_path_buf(),
            status_db_path: dir.join("status.db"),
            max_cache_size: 10,
            subprocess_timeout_secs: 1,
            mpc_hosts: "".into(),
            inference_binary: dir.join("malicious-rep-ring-party.x"),
            aes_bridge_binary: dir.join("rep3-aes-mozaik"),
            aes_bridge_config: dir.join("rep3aes.toml"),
            offline_binary: dir.join("Fake-Offline.x"),
            offline_scp_destinations: Vec::new(),
        }
    }

    #[test]
    fn loads_matching_keyset() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1);
        let keys = PartyKeys::load(&config).unwrap();
        assert_eq!(keys.party_index, 1);
        assert_eq!(*keys.my_public_key(), RsaPublicKey::from(&keys.my_private_key));
    }

    #[test]
    fn rejects_cert_not_matching_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 1);
        config.server_cert = config.party_certs[0].clone();
        assert!(PartyKeys::load(&config).is_err());
    }

    #[test]
    fn der_concatenation_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 0);
        let keys = PartyKeys::load(&config).unwrap();
        let a = keys.party_keys_der_concatenated().unwrap();
        let b = keys.party_keys_der_concatenated().unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
