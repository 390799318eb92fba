//! The per-connection handshake state machine.
//!
//! ```text
//!  acceptor                                   dialer
//!  ────────                                   ──────
//!  offer()        ── KeyOffer ──────────────▶ respond()      [KeyExchanged]
//!  accept()       ◀────────────── KeyDelivery ─
//!  [KeyExchanged]
//!  confirm()      ── SecuredAck ────────────▶ finish()       [Secured]
//!  [Secured]
//! ```
//!
//! The acceptor always speaks first. Nothing but handshake traffic may be
//! exchanged until both sides reach [`ChannelState::Secured`]; after that
//! every frame goes through [`SecureChannel::seal`] / [`SecureChannel::open`].

use aes_gcm::aead::OsRng;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use tierlink_protocol::{KeyDelivery, KeyOffer, SealedFrame, SecuredAck};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cipher::{unwrap_key, wrap_key};
use crate::{HandshakeError, SessionCipher};

/// Where a channel is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingHandshake,
    KeyExchanged,
    Secured,
}

/// Which end of the handshake this channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Accepted the socket; sends the key offer and the signed ack.
    Acceptor,
    /// Dialed the socket; generates and delivers the session key.
    Dialer,
}

// ---------------------------------------------------------------------------
// ServerKey
// ---------------------------------------------------------------------------

/// A server's long-lived Ed25519 signing identity.
///
/// Signs the `ChannelSecured` acknowledgment of every inbound handshake.
pub struct ServerKey {
    signing: SigningKey,
}

impl ServerKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a key from its 32 secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    fn sign(&self, digest: &[u8]) -> Signature {
        self.signing.sign(digest)
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("verifying_key", &self.verifying_key())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SecureChannel
// ---------------------------------------------------------------------------

/// One connection's side of the key exchange, and the cipher it produces.
pub struct SecureChannel {
    role: ChannelRole,
    state: ChannelState,
    secret: StaticSecret,
    /// Requested (acceptor) or agreed (dialer) symmetric key length.
    key_len: u16,
    remote_public: Option<PublicKey>,
    /// Acceptor's verifying key, learned from the offer (dialer only).
    remote_verifying: Option<VerifyingKey>,
    wrapped_key: Vec<u8>,
    /// The raw session key; kept until the ack has proven possession.
    session_key: Option<Vec<u8>>,
    cipher: Option<SessionCipher>,
}

impl SecureChannel {
    /// The accepting side of a fresh connection, requesting `key_len` bytes.
    pub fn acceptor(key_len: u16) -> Result<Self, HandshakeError> {
        if key_len != 16 && key_len != 32 {
            return Err(HandshakeError::UnsupportedKeyLength(key_len));
        }
        Ok(Self::new(ChannelRole::Acceptor, key_len))
    }

    /// The dialing side of a fresh connection.
    pub fn dialer() -> Self {
        Self::new(ChannelRole::Dialer, 0)
    }

    fn new(role: ChannelRole, key_len: u16) -> Self {
        Self {
            role,
            state: ChannelState::AwaitingHandshake,
            secret: StaticSecret::random_from_rng(OsRng),
            key_len,
            remote_public: None,
            remote_verifying: None,
            wrapped_key: Vec::new(),
            session_key: None,
            cipher: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn is_secured(&self) -> bool {
        self.state == ChannelState::Secured
    }

    fn public(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    fn expect(
        &self,
        role: ChannelRole,
        state: ChannelState,
        operation: &'static str,
    ) -> Result<(), HandshakeError> {
        if self.role != role || self.state != state {
            return Err(HandshakeError::OutOfOrder {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    // -- Acceptor --

    /// Builds the opening key offer.
    pub fn offer(&self, server_key: &ServerKey) -> Result<KeyOffer, HandshakeError> {
        self.expect(ChannelRole::Acceptor, ChannelState::AwaitingHandshake, "offer")?;
        Ok(KeyOffer {
            public_key: self.public().as_bytes().to_vec(),
            verifying_key: server_key.verifying_key().to_vec(),
            key_len: self.key_len,
        })
    }

    /// Unwraps the dialer's session key. Moves to `KeyExchanged`.
    pub fn accept(&mut self, delivery: &KeyDelivery) -> Result<(), HandshakeError> {
        self.expect(ChannelRole::Acceptor, ChannelState::AwaitingHandshake, "accept")?;

        let dialer_public = parse_public(&delivery.public_key)?;
        let key = unwrap_key(&self.secret, &dialer_public, &delivery.nonce, &delivery.wrapped_key)?;
        if key.len() != usize::from(self.key_len) {
            return Err(HandshakeError::MalformedKey("delivered key length"));
        }

        self.cipher = Some(SessionCipher::from_key(&key)?);
        self.session_key = Some(key);
        self.remote_public = Some(dialer_public);
        self.wrapped_key = delivery.wrapped_key.clone();
        self.state = ChannelState::KeyExchanged;
        Ok(())
    }

    /// Echoes the key under the new cipher and signs the transcript.
    /// Moves to `Secured`.
    pub fn confirm(&mut self, server_key: &ServerKey) -> Result<SecuredAck, HandshakeError> {
        self.expect(ChannelRole::Acceptor, ChannelState::KeyExchanged, "confirm")?;
        let (cipher, key, dialer_public) =
            match (&self.cipher, &self.session_key, &self.remote_public) {
                (Some(c), Some(k), Some(p)) => (c, k, p),
                _ => {
                    return Err(HandshakeError::OutOfOrder {
                        operation: "confirm",
                        state: self.state,
                    });
                }
            };

        let (nonce, echoed_key) = cipher.seal(key)?;
        let digest = transcript(&self.public(), dialer_public, &self.wrapped_key, &echoed_key);
        let signature = server_key.sign(&digest).to_bytes().to_vec();

        self.session_key = None;
        self.state = ChannelState::Secured;
        Ok(SecuredAck {
            nonce,
            echoed_key,
            signature,
        })
    }

    // -- Dialer --

    /// Generates the session key and wraps it for the acceptor.
    /// Moves to `KeyExchanged`.
    pub fn respond(&mut self, offer: &KeyOffer) -> Result<KeyDelivery, HandshakeError> {
        self.expect(ChannelRole::Dialer, ChannelState::AwaitingHandshake, "respond")?;

        let acceptor_public = parse_public(&offer.public_key)?;
        let verifying: [u8; 32] = offer
            .verifying_key
            .as_slice()
            .try_into()
            .map_err(|_| HandshakeError::MalformedKey("verifying key"))?;
        let verifying = VerifyingKey::from_bytes(&verifying)
            .map_err(|_| HandshakeError::MalformedKey("verifying key"))?;

        let key = SessionCipher::generate_key(offer.key_len)?;
        let (nonce, wrapped_key) = wrap_key(&self.secret, &acceptor_public, &key)?;

        self.cipher = Some(SessionCipher::from_key(&key)?);
        self.session_key = Some(key);
        self.key_len = offer.key_len;
        self.remote_public = Some(acceptor_public);
        self.remote_verifying = Some(verifying);
        self.wrapped_key = wrapped_key.clone();
        self.state = ChannelState::KeyExchanged;

        Ok(KeyDelivery {
            public_key: self.public().as_bytes().to_vec(),
            nonce,
            wrapped_key,
        })
    }

    /// Verifies the acceptor's signed ack and echoed key. Moves to `Secured`.
    pub fn finish(&mut self, ack: &SecuredAck) -> Result<(), HandshakeError> {
        self.expect(ChannelRole::Dialer, ChannelState::KeyExchanged, "finish")?;
        let (cipher, key, acceptor_public, verifying) = match (
            &self.cipher,
            &self.session_key,
            &self.remote_public,
            &self.remote_verifying,
        ) {
            (Some(c), Some(k), Some(p), Some(v)) => (c, k, p, v),
            _ => {
                return Err(HandshakeError::OutOfOrder {
                    operation: "finish",
                    state: self.state,
                });
            }
        };

        let echoed = cipher.open(&ack.nonce, &ack.echoed_key)?;
        if &echoed != key {
            return Err(HandshakeError::EchoMismatch);
        }

        let digest = transcript(acceptor_public, &self.public(), &self.wrapped_key, &ack.echoed_key);
        let signature = Signature::from_slice(&ack.signature)
            .map_err(|_| HandshakeError::MalformedKey("signature"))?;
        verifying
            .verify(&digest, &signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        self.session_key = None;
        self.state = ChannelState::Secured;
        Ok(())
    }

    // -- Secured traffic --

    /// Encrypts one encoded envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedFrame, HandshakeError> {
        let cipher = self.secured_cipher("seal")?;
        let (nonce, ciphertext) = cipher.seal(plaintext)?;
        Ok(SealedFrame { nonce, ciphertext })
    }

    /// Decrypts one sealed frame back to the encoded envelope.
    pub fn open(&self, frame: &SealedFrame) -> Result<Vec<u8>, HandshakeError> {
        self.secured_cipher("open")?
            .open(&frame.nonce, &frame.ciphertext)
    }

    fn secured_cipher(&self, operation: &'static str) -> Result<&SessionCipher, HandshakeError> {
        match (&self.cipher, self.state) {
            (Some(cipher), ChannelState::Secured) => Ok(cipher),
            _ => Err(HandshakeError::OutOfOrder {
                operation,
                state: self.state,
            }),
        }
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("key_len", &self.key_len)
            .finish_non_exhaustive()
    }
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| HandshakeError::MalformedKey("public key"))?;
    Ok(PublicKey::from(arr))
}

/// SHA-256(acceptor_pub ‖ dialer_pub ‖ wrapped_key ‖ echoed_key)
fn transcript(
    acceptor_public: &PublicKey,
    dialer_public: &PublicKey,
    wrapped_key: &[u8],
    echoed_key: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(acceptor_public.as_bytes());
    hasher.update(dialer_public.as_bytes());
    hasher.update(wrapped_key);
    hasher.update(echoed_key);
    hasher.finalize().into()
}
