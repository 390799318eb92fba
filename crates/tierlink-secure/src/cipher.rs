//! Symmetric ciphers: the per-connection session cipher and the key wrap
//! used to deliver it.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm, Nonce};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::HandshakeError;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

const WRAP_INFO: &[u8] = b"tierlink-keywrap-v1";

/// The symmetric cipher a secured channel encrypts every frame with.
///
/// The variant is chosen by the key length requested in the key offer.
#[derive(Clone)]
pub enum SessionCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl SessionCipher {
    /// Builds the cipher for a 16- or 32-byte key.
    pub fn from_key(key: &[u8]) -> Result<Self, HandshakeError> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(Self::Aes128)
                .map_err(|_| HandshakeError::MalformedKey("session key")),
            32 => Aes256Gcm::new_from_slice(key)
                .map(Self::Aes256)
                .map_err(|_| HandshakeError::MalformedKey("session key")),
            n => Err(HandshakeError::UnsupportedKeyLength(n as u16)),
        }
    }

    /// Generates a fresh random key of `key_len` bytes.
    pub fn generate_key(key_len: u16) -> Result<Vec<u8>, HandshakeError> {
        match key_len {
            16 => Ok(Aes128Gcm::generate_key(OsRng).to_vec()),
            32 => Ok(Aes256Gcm::generate_key(OsRng).to_vec()),
            n => Err(HandshakeError::UnsupportedKeyLength(n)),
        }
    }

    /// Encrypts `plaintext` under a fresh random nonce. Returns `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), HandshakeError> {
        let (nonce, ciphertext) = match self {
            Self::Aes128(c) => {
                let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
                (nonce, c.encrypt(&nonce, plaintext))
            }
            Self::Aes256(c) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                (nonce, c.encrypt(&nonce, plaintext))
            }
        };
        let ciphertext = ciphertext.map_err(|_| HandshakeError::EncryptFailed)?;
        Ok((nonce.to_vec(), ciphertext))
    }

    /// Decrypts and authenticates a `(nonce, ciphertext)` pair.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if nonce.len() != NONCE_LEN {
            return Err(HandshakeError::MalformedKey("nonce"));
        }
        let nonce = Nonce::from_slice(nonce);
        let plaintext = match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        };
        plaintext.map_err(|_| HandshakeError::DecryptFailed)
    }

    pub fn key_len(&self) -> u16 {
        match self {
            Self::Aes128(_) => 16,
            Self::Aes256(_) => 32,
        }
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aes128(_) => f.write_str("SessionCipher::Aes128"),
            Self::Aes256(_) => f.write_str("SessionCipher::Aes256"),
        }
    }
}

// ---------------------------------------------------------------------------
// Key wrap
// ---------------------------------------------------------------------------

/// Derives the AES-256-GCM key that wraps the session key.
///
/// Both sides compute the same X25519 shared secret; HKDF salts it with
/// the two public keys so a wrap key is bound to one exchange.
fn wrap_cipher(
    our_secret: &StaticSecret,
    their_public: &PublicKey,
    acceptor_public: &PublicKey,
    dialer_public: &PublicKey,
) -> Result<Aes256Gcm, HandshakeError> {
    let shared = our_secret.diffie_hellman(their_public);

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(acceptor_public.as_bytes());
    salt[32..].copy_from_slice(dialer_public.as_bytes());

    let hk = hkdf::Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut wrap_key = [0u8; 32];
    hk.expand(WRAP_INFO, &mut wrap_key)
        .map_err(|_| HandshakeError::KdfFailed)?;

    Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| HandshakeError::KdfFailed)
}

/// Dialer side: encrypts `session_key` for the acceptor's public key.
/// Returns `(nonce, wrapped_key)`.
pub(crate) fn wrap_key(
    dialer_secret: &StaticSecret,
    acceptor_public: &PublicKey,
    session_key: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), HandshakeError> {
    let dialer_public = PublicKey::from(dialer_secret);
    let cipher = wrap_cipher(dialer_secret, acceptor_public, acceptor_public, &dialer_public)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let wrapped = cipher
        .encrypt(&nonce, session_key)
        .map_err(|_| HandshakeError::EncryptFailed)?;
    Ok((nonce.to_vec(), wrapped))
}

/// Acceptor side: recovers the session key delivered by the dialer.
pub(crate) fn unwrap_key(
    acceptor_secret: &StaticSecret,
    dialer_public: &PublicKey,
    nonce: &[u8],
    wrapped: &[u8],
) -> Result<Vec<u8>, HandshakeError> {
    if nonce.len() != NONCE_LEN {
        return Err(HandshakeError::MalformedKey("nonce"));
    }
    let acceptor_public = PublicKey::from(acceptor_secret);
    let cipher = wrap_cipher(acceptor_secret, dialer_public, &acceptor_public, dialer_public)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), wrapped)
        .map_err(|_| HandshakeError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_key_selects_variant_by_length() {
        let short = SessionCipher::from_key(&[7u8; 16]).unwrap();
        let long = SessionCipher::from_key(&[7u8; 32]).unwrap();
        assert_eq!(short.key_len(), 16);
        assert_eq!(long.key_len(), 32);
    }

    #[test]
    fn test_from_key_odd_length_rejected() {
        let result = SessionCipher::from_key(&[0u8; 24]);
        assert!(matches!(result, Err(HandshakeError::UnsupportedKeyLength(24))));
    }

    #[test]
    fn test_seal_then_open_recovers_plaintext() {
        let cipher = SessionCipher::from_key(&SessionCipher::generate_key(32).unwrap()).unwrap();
        let (nonce, ct) = cipher.seal(b"login request").unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert_ne!(ct, b"login request");
        assert_eq!(cipher.open(&nonce, &ct).unwrap(), b"login request");
    }

    #[test]
    fn test_open_with_other_key_fails() {
        let a = SessionCipher::from_key(&[1u8; 16]).unwrap();
        let b = SessionCipher::from_key(&[2u8; 16]).unwrap();
        let (nonce, ct) = a.seal(b"secret").unwrap();
        assert!(matches!(b.open(&nonce, &ct), Err(HandshakeError::DecryptFailed)));
    }

    #[test]
    fn test_open_short_nonce_is_malformed_not_panic() {
        let cipher = SessionCipher::from_key(&[1u8; 32]).unwrap();
        assert!(matches!(
            cipher.open(&[0u8; 4], b"x"),
            Err(HandshakeError::MalformedKey("nonce"))
        ));
    }

    #[test]
    fn test_wrap_unwrap_agree_on_session_key() {
        let acceptor = StaticSecret::random_from_rng(OsRng);
        let dialer = StaticSecret::random_from_rng(OsRng);
        let key = SessionCipher::generate_key(16).unwrap();

        let (nonce, wrapped) = wrap_key(&dialer, &PublicKey::from(&acceptor), &key).unwrap();
        let unwrapped =
            unwrap_key(&acceptor, &PublicKey::from(&dialer), &nonce, &wrapped).unwrap();

        assert_eq!(unwrapped, key);
    }

    #[test]
    fn test_unwrap_for_wrong_recipient_fails() {
        let acceptor = StaticSecret::random_from_rng(OsRng);
        let stranger = StaticSecret::random_from_rng(OsRng);
        let dialer = StaticSecret::random_from_rng(OsRng);

        let (nonce, wrapped) = wrap_key(&dialer, &PublicKey::from(&acceptor), &[9u8; 32]).unwrap();
        let result = unwrap_key(&stranger, &PublicKey::from(&dialer), &nonce, &wrapped);

        assert!(matches!(result, Err(HandshakeError::DecryptFailed)));
    }
}
