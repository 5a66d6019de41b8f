#![forbid(unsafe_code)]

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use keytrust_kernel_contracts::peer::{ED25519_PUBLIC_KEY_LEN, ED25519_SIGNATURE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_IV_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

const KDF_DOMAIN: &[u8] = b"keytrust.recovery-kdf.v1";
const KDF_ROUNDS: u32 = 4096;
const ENCRYPTION_PUBLIC_DOMAIN: &[u8] = b"keytrust.encryption-public.v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid key derivation input: {0}")]
    InvalidDerivationInput(&'static str),
    #[error("aead operation failed")]
    Aead,
}

pub struct SigningKeyPair {
    key: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Key material stretched out of a recovery secret.
#[derive(Debug)]
pub struct DerivedKeyMaterial {
    pub signing: SigningKeyPair,
    encryption_key: [u8; AEAD_KEY_LEN],
}

impl DerivedKeyMaterial {
    pub fn encryption_key(&self) -> &[u8; AEAD_KEY_LEN] {
        &self.encryption_key
    }

    /// Public identifier of the symmetric encryption key.
    pub fn encryption_public_key(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(ENCRYPTION_PUBLIC_DOMAIN);
        hasher.update(self.encryption_key);
        hasher.finalize().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
}

pub trait CryptoProvider: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8])
        -> Result<(), CryptoError>;

    fn derive_key_material(&self, secret: &str, salt: &str)
        -> Result<DerivedKeyMaterial, CryptoError>;

    fn seal(&self, key: &[u8], plaintext: &[u8]) -> Result<SealedPayload, CryptoError>;

    fn open(&self, key: &[u8], sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError>;
}

/// Ed25519 signatures, SHA-512 stretched recovery derivation, AES-256-GCM payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Crypto;

impl CryptoProvider for Ed25519Crypto {
    fn verify(
        &self,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let key_bytes: [u8; ED25519_PUBLIC_KEY_LEN] = public_key
            .try_into()
            .map_err(|_| CryptoError::MalformedPublicKey)?;
        let key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::MalformedPublicKey)?;
        if signature.len() != ED25519_SIGNATURE_LEN {
            return Err(CryptoError::MalformedSignature);
        }
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::MalformedSignature)?;
        key.verify_strict(message, &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }

    fn derive_key_material(
        &self,
        secret: &str,
        salt: &str,
    ) -> Result<DerivedKeyMaterial, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::InvalidDerivationInput("secret must not be empty"));
        }
        let mut state = {
            let mut hasher = Sha512::new();
            hasher.update(KDF_DOMAIN);
            hasher.update((salt.len() as u64).to_le_bytes());
            hasher.update(salt.as_bytes());
            hasher.update(secret.as_bytes());
            hasher.finalize()
        };
        for _ in 0..KDF_ROUNDS {
            let mut hasher = Sha512::new();
            hasher.update(state);
            hasher.update(salt.as_bytes());
            state = hasher.finalize();
        }

        let mut signing_seed = [0u8; 32];
        signing_seed.copy_from_slice(&state[..32]);
        let mut encryption_key = [0u8; AEAD_KEY_LEN];
        encryption_key.copy_from_slice(&state[32..64]);
        Ok(DerivedKeyMaterial {
            signing: SigningKeyPair::from_seed(signing_seed),
            encryption_key,
        })
    }

    fn seal(&self, key: &[u8], plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
        if key.len() != AEAD_KEY_LEN {
            return Err(CryptoError::Aead);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
        let mut iv = [0u8; AEAD_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| CryptoError::Aead)?;
        Ok(SealedPayload {
            ciphertext: buffer,
            iv: iv.to_vec(),
            tag: tag.to_vec(),
        })
    }

    fn open(&self, key: &[u8], sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        if key.len() != AEAD_KEY_LEN
            || sealed.iv.len() != AEAD_IV_LEN
            || sealed.tag.len() != AEAD_TAG_LEN
        {
            return Err(CryptoError::Aead);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
        let mut buffer = sealed.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.iv),
                b"",
                &mut buffer,
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| CryptoError::Aead)?;
        Ok(buffer)
    }
}
