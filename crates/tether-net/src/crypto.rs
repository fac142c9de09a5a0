//! Key exchange and sealed-box encryption for the reliable channel.
//!
//! Each peer holds an X25519 key pair and learns the other side's public key
//! during the handshake. Sealing a payload to a recipient uses a fresh
//! ephemeral key:
//!
//! ```text
//! +------------------+-------------+------------------------------+
//! | ephemeral pubkey | nonce       | ChaCha20-Poly1305 ciphertext |
//! | 32 bytes         | 12 bytes    | plaintext + 16 byte tag      |
//! +------------------+-------------+------------------------------+
//! ```
//!
//! The AEAD key is `SHA-256(domain || shared secret || ephemeral || recipient)`.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;

use crate::codec::{ByteReader, ByteWriter, CodecError, Decode, Encode};

pub const PUBLIC_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_DOMAIN: &[u8] = b"tether sealed box v1";

/// Errors from sealing or opening an encrypted payload.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("sealed payload is {0} bytes, shorter than the envelope")]
    SealedTooShort(usize),

    #[error("key agreement produced a non-contributory secret")]
    WeakKey,

    #[error("encryption failed")]
    SealFailed,

    #[error("decryption failed: payload was tampered with or sealed to another key")]
    OpenFailed,
}

/// An X25519 public key as carried in `connect` and `server_info`.
///
/// The all-zero key means "not supplied".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn is_set(&self) -> bool {
        self.0 != [0; PUBLIC_KEY_LEN]
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl Encode for PublicKey {
    fn encode(&self, writer: &mut ByteWriter) {
        self.0.encode(writer);
    }
}

impl Decode for PublicKey {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        reader.read().map(Self)
    }
}

/// A local key pair. Generated once per process side of a session.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; 32]>());
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Decrypt a payload produced by [`seal`] for this key pair.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < PUBLIC_KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::SealedTooShort(sealed.len()));
        }
        let (ephemeral, rest) = sealed.split_at(PUBLIC_KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut ephemeral_bytes = [0u8; PUBLIC_KEY_LEN];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let shared = self
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral_bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKey);
        }

        let key = derive_key(shared.as_bytes(), &ephemeral_bytes, &self.public.0);
        ChaCha20Poly1305::new(Key::from_slice(&key))
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::OpenFailed)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakKey);
    }

    let key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient.0);
    let nonce: [u8; NONCE_LEN] = rand::random();
    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&key))
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}
