use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use pbkdf2::pbkdf2_hmac;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Error)]
pub enum KeyError {
    #[error("the channel key is encrypted and no passphrase was supplied")]
    PassphraseRequired,
    #[error("decryption failed: wrong passphrase or corrupted key material")]
    WrongPassphrase,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// A per-channel secp256k1 keypair.
///
/// Channel keys must be fresh per channel and used nowhere else. The secret half may be held
/// encrypted under a user passphrase; every signing operation accepts an optional passphrase and
/// fails with [`KeyError::PassphraseRequired`] if the key needs one it did not get.
#[derive(Clone, Serialize, Deserialize)]
pub enum ChannelKey {
    Plain {
        secret: SecretKey,
        public: PublicKey,
    },
    Encrypted {
        #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
        salt: Vec<u8>,
        #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
        nonce: Vec<u8>,
        #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
        ciphertext: Vec<u8>,
        public: PublicKey,
    },
}

impl ChannelKey {
    pub fn new<C: Signing>(secp: &Secp256k1<C>, secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(secp, &secret);
        ChannelKey::Plain { secret, public }
    }

    /// Generates a fresh key for a new channel.
    pub fn random<C: Signing, R: RngCore + CryptoRng>(secp: &Secp256k1<C>, rng: &mut R) -> Self {
        let secret = SecretKey::new(rng);
        ChannelKey::new(secp, secret)
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            ChannelKey::Plain { public, .. } => *public,
            ChannelKey::Encrypted { public, .. } => *public,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, ChannelKey::Encrypted { .. })
    }

    /// The secret key, decrypting with `passphrase` if required. A passphrase supplied for a
    /// plain key is ignored.
    pub fn secret(&self, passphrase: Option<&str>) -> Result<SecretKey, KeyError> {
        match self {
            ChannelKey::Plain { secret, .. } => Ok(*secret),
            ChannelKey::Encrypted { salt, nonce, ciphertext, .. } => {
                let passphrase = passphrase.ok_or(KeyError::PassphraseRequired)?;
                let mut key = derive_key(passphrase, salt);
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
                let plaintext = cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext.as_ref())
                    .map_err(|_| KeyError::WrongPassphrase);
                key.zeroize();
                let mut plaintext = plaintext?;
                let secret = SecretKey::from_slice(&plaintext)
                    .map_err(|e| KeyError::InvalidKey(e.to_string()));
                plaintext.zeroize();
                secret
            }
        }
    }

    /// Re-wraps the key under a passphrase. Encrypting an already encrypted key fails.
    pub fn encrypt<R: RngCore + CryptoRng>(
        self,
        passphrase: &str,
        rng: &mut R,
    ) -> Result<Self, KeyError> {
        let (secret, public) = match self {
            ChannelKey::Plain { secret, public } => (secret, public),
            ChannelKey::Encrypted { .. } => {
                return Err(KeyError::InvalidKey("key is already encrypted".into()))
            }
        };
        let mut salt = vec![0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let mut nonce_bytes = vec![0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce_bytes);
        let mut key = derive_key(passphrase, &salt);
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.secret_bytes().as_ref())
            .map_err(|e| KeyError::InvalidKey(format!("encryption failed: {e}")));
        key.zeroize();
        Ok(ChannelKey::Encrypted { salt, nonce: nonce_bytes, ciphertext: ciphertext?, public })
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        write!(f, "ChannelKey({}, encrypted={})", self.public_key(), self.is_encrypted())
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    #[test]
    fn encrypt_round_trip() {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let key = ChannelKey::random(&secp, &mut rng);
        let public = key.public_key();
        let plain_secret = key.secret(None).unwrap();

        let encrypted = key.encrypt("hunter2", &mut rng).unwrap();
        assert!(encrypted.is_encrypted());
        assert_eq!(encrypted.public_key(), public);
        assert_eq!(encrypted.secret(Some("hunter2")).unwrap(), plain_secret);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let encrypted = ChannelKey::random(&secp, &mut rng).encrypt("hunter2", &mut rng).unwrap();
        assert!(matches!(encrypted.secret(Some("*******")), Err(KeyError::WrongPassphrase)));
        assert!(matches!(encrypted.secret(None), Err(KeyError::PassphraseRequired)));
    }

    #[test]
    fn double_encryption_is_rejected() {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let encrypted = ChannelKey::random(&secp, &mut rng).encrypt("a", &mut rng).unwrap();
        assert!(encrypted.encrypt("b", &mut rng).is_err());
    }

    #[test]
    fn serde_round_trip_keeps_ciphertext() {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let encrypted = ChannelKey::random(&secp, &mut rng).encrypt("hunter2", &mut rng).unwrap();
        let serialized = ron::to_string(&encrypted).unwrap();
        let restored: ChannelKey = ron::from_str(&serialized).unwrap();
        assert_eq!(restored.public_key(), encrypted.public_key());
        assert_eq!(
            restored.secret(Some("hunter2")).unwrap(),
            encrypted.secret(Some("hunter2")).unwrap()
        );
    }
}
