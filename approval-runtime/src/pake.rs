//! SPAKE2 channel: key agreement from a weak pairing code plus an
//! authenticated symmetric cipher over the derived key.
//!
//! The pairing code is the SPAKE2 password. Only protocol elements cross the
//! wire; the code itself and the derived key never do. The raw SPAKE2 output
//! is expanded with HKDF-SHA256 into a domain-separated 32-byte channel key,
//! which drives XChaCha20-Poly1305 with a fresh random 24-byte nonce per
//! message (nonce is prepended to the ciphertext, the whole blob is base64).
//!
//! Operations form a strict linear state machine:
//! `NEW --start--> STARTED --finish--> READY --(encrypt|decrypt)*`

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::rand_core::OsRng as AeadOsRng;
use chacha20poly1305::{AeadCore, Key, XChaCha20Poly1305, XNonce, aead::Aead, aead::KeyInit};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use zeroize::Zeroize;

use crate::error::{BrokerError, Result};

/// Identity strings binding both SPAKE2 roles to this protocol.
const PAKE_ID_AGENT: &[u8] = b"credential-broker-agent";
const PAKE_ID_APPROVER: &[u8] = b"credential-broker-approver";

const CHANNEL_KEY_SALT: &[u8] = b"credential-broker.pake.salt.v1";
const CHANNEL_KEY_INFO: &[u8] = b"credential-broker.pake.channel-key.v1";

/// XChaCha20-Poly1305 nonce length prepended to every ciphertext.
const NONCE_LEN: usize = 24;
/// Poly1305 tag length appended by the AEAD.
const TAG_LEN: usize = 16;

/// Which half of the exchange this channel speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The requesting agent (SPAKE2 side A).
    Initiator,
    /// The approval service (SPAKE2 side B).
    Responder,
}

enum ChannelState {
    New,
    Started(Box<Spake2<Ed25519Group>>),
    Ready(Box<XChaCha20Poly1305>),
    /// A failed `finish` poisons the channel; every later call errors.
    Failed,
}

impl ChannelState {
    fn name(&self) -> &'static str {
        match self {
            ChannelState::New => "new",
            ChannelState::Started(_) => "started",
            ChannelState::Ready(_) => "ready",
            ChannelState::Failed => "failed",
        }
    }
}

/// One half of a PAKE-secured channel.
///
/// A freshly constructed channel holds no secret material.
pub struct PakeChannel {
    role: Role,
    state: ChannelState,
}

impl std::fmt::Debug for PakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PakeChannel")
            .field("role", &self.role)
            .field("state", &self.state.name())
            .finish()
    }
}

impl PakeChannel {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ChannelState::New,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Begin the exchange, producing the outbound protocol element.
    ///
    /// Callable exactly once. The password is consumed by the group math;
    /// no encoding of it appears in the returned element.
    pub fn start(&mut self, password: &str) -> Result<Vec<u8>> {
        if !matches!(self.state, ChannelState::New) {
            return Err(BrokerError::State(format!(
                "PAKE start called in state '{}'",
                self.state.name()
            )));
        }

        let password = Password::new(password.as_bytes());
        let id_agent = Identity::new(PAKE_ID_AGENT);
        let id_approver = Identity::new(PAKE_ID_APPROVER);

        let (state, outbound) = match self.role {
            Role::Initiator => Spake2::<Ed25519Group>::start_a(&password, &id_agent, &id_approver),
            Role::Responder => Spake2::<Ed25519Group>::start_b(&password, &id_agent, &id_approver),
        };

        self.state = ChannelState::Started(Box::new(state));
        Ok(outbound)
    }

    /// Consume the peer's protocol element and derive the channel key.
    ///
    /// Callable exactly once after [`start`](Self::start). Any completion
    /// failure surfaces as the generic [`BrokerError::PakeFailed`]; the
    /// distinction between a wrong password and a malformed element is
    /// deliberately not exposed.
    pub fn finish(&mut self, peer_message: &[u8]) -> Result<()> {
        let state = match std::mem::replace(&mut self.state, ChannelState::Failed) {
            ChannelState::Started(state) => state,
            other => {
                let err = BrokerError::State(format!(
                    "PAKE finish called in state '{}'",
                    other.name()
                ));
                self.state = other;
                return Err(err);
            }
        };

        let mut shared = (*state).finish(peer_message).map_err(|err| {
            tracing::debug!("SPAKE2 completion rejected: {err}");
            BrokerError::PakeFailed
        })?;

        let mut key = derive_channel_key(&shared)?;
        shared.zeroize();

        self.state = ChannelState::Ready(Box::new(XChaCha20Poly1305::new(Key::from_slice(&key))));
        key.zeroize();
        Ok(())
    }

    /// Encrypt `plaintext`, returning base64 of `nonce || ciphertext || tag`.
    ///
    /// The nonce is drawn fresh per call, so identical plaintexts yield
    /// distinct ciphertexts.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| BrokerError::State("AEAD encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a blob produced by the peer's [`encrypt`](Self::encrypt).
    ///
    /// Tag mismatch, truncation, bad base64, and non-UTF-8 plaintext all
    /// collapse into [`BrokerError::DecryptionFailed`].
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let raw = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| BrokerError::DecryptionFailed)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(BrokerError::DecryptionFailed);
        }

        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| BrokerError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| BrokerError::DecryptionFailed)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ChannelState::Ready(_))
    }

    fn cipher(&self) -> Result<&XChaCha20Poly1305> {
        match &self.state {
            ChannelState::Ready(cipher) => Ok(cipher),
            other => Err(BrokerError::State(format!(
                "PAKE exchange not completed (state '{}')",
                other.name()
            ))),
        }
    }
}

fn derive_channel_key(shared: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(CHANNEL_KEY_SALT), shared);
    let mut okm = [0u8; 32];
    hk.expand(CHANNEL_KEY_INFO, &mut okm)
        .map_err(|_| BrokerError::PakeFailed)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired(code: &str) -> (PakeChannel, PakeChannel) {
        let mut agent = PakeChannel::new(Role::Initiator);
        let mut approver = PakeChannel::new(Role::Responder);
        let msg_a = agent.start(code).unwrap();
        let msg_b = approver.start(code).unwrap();
        agent.finish(&msg_b).unwrap();
        approver.finish(&msg_a).unwrap();
        (agent, approver)
    }

    #[test]
    fn same_code_derives_symmetric_keys() {
        let (agent, approver) = paired("847293");

        let to_server = agent.encrypt("test message").unwrap();
        assert_eq!(approver.decrypt(&to_server).unwrap(), "test message");

        let to_agent = approver.encrypt("another test").unwrap();
        assert_eq!(agent.decrypt(&to_agent).unwrap(), "another test");
    }

    #[test]
    fn wrong_code_fails_decryption() {
        let mut agent = PakeChannel::new(Role::Initiator);
        let mut approver = PakeChannel::new(Role::Responder);
        let msg_a = agent.start("123456").unwrap();
        let msg_b = approver.start("999999").unwrap();

        // The group math completes on both sides; the keys just differ.
        agent.finish(&msg_b).unwrap();
        approver.finish(&msg_a).unwrap();
        assert!(agent.is_ready());
        assert!(approver.is_ready());

        let ciphertext = agent.encrypt("test data").unwrap();
        assert!(matches!(
            approver.decrypt(&ciphertext),
            Err(BrokerError::DecryptionFailed)
        ));
    }

    #[test]
    fn identical_plaintexts_yield_distinct_ciphertexts() {
        let (agent, approver) = paired("555123");

        let c1 = agent.encrypt("same payload").unwrap();
        let c2 = agent.encrypt("same payload").unwrap();
        assert_ne!(c1, c2);
        assert_eq!(approver.decrypt(&c1).unwrap(), "same payload");
        assert_eq!(approver.decrypt(&c2).unwrap(), "same payload");
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (agent, approver) = paired("246810");
        let ciphertext = agent.encrypt(r#"{"domain":"example.com"}"#).unwrap();

        let mut raw = BASE64.decode(&ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let flipped = BASE64.encode(&raw);
        assert!(matches!(
            approver.decrypt(&flipped),
            Err(BrokerError::DecryptionFailed)
        ));

        // Flip a byte in the middle of the ciphertext body too.
        let mut raw = BASE64.decode(&ciphertext).unwrap();
        let mid = NONCE_LEN + 2;
        raw[mid] ^= 0xFF;
        let flipped = BASE64.encode(&raw);
        assert!(matches!(
            approver.decrypt(&flipped),
            Err(BrokerError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let (agent, approver) = paired("135791");
        let ciphertext = agent.encrypt("a reasonably long plaintext body").unwrap();

        let raw = BASE64.decode(&ciphertext).unwrap();
        let truncated = BASE64.encode(&raw[..raw.len() - 1]);
        assert!(matches!(
            approver.decrypt(&truncated),
            Err(BrokerError::DecryptionFailed)
        ));

        // Down to less than nonce + tag.
        let stub = BASE64.encode(&raw[..NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(
            approver.decrypt(&stub),
            Err(BrokerError::DecryptionFailed)
        ));

        assert!(matches!(
            approver.decrypt("not-base64!!!"),
            Err(BrokerError::DecryptionFailed)
        ));
    }

    #[test]
    fn round_trips_empty_unicode_and_large() {
        let (agent, approver) = paired("102030");

        for plaintext in ["", "héllo wörld — ユニコード ✓", "{\"k\":\"v\"}"] {
            let c = agent.encrypt(plaintext).unwrap();
            assert_eq!(approver.decrypt(&c).unwrap(), plaintext);
        }

        let blob = "x".repeat(10 * 1024);
        let c = approver.encrypt(&blob).unwrap();
        assert_eq!(agent.decrypt(&c).unwrap(), blob);
    }

    #[test]
    fn start_twice_is_a_state_error() {
        let mut agent = PakeChannel::new(Role::Initiator);
        agent.start("111111").unwrap();
        assert!(matches!(agent.start("111111"), Err(BrokerError::State(_))));
    }

    #[test]
    fn finish_before_start_is_a_state_error() {
        let mut approver = PakeChannel::new(Role::Responder);
        assert!(matches!(
            approver.finish(b"whatever"),
            Err(BrokerError::State(_))
        ));
    }

    #[test]
    fn finish_twice_is_a_state_error() {
        let (mut agent, _approver) = paired("111222");
        assert!(matches!(
            agent.finish(b"again"),
            Err(BrokerError::State(_))
        ));
    }

    #[test]
    fn encrypt_decrypt_before_finish_is_a_state_error() {
        let mut agent = PakeChannel::new(Role::Initiator);
        assert!(matches!(agent.encrypt("x"), Err(BrokerError::State(_))));
        assert!(matches!(agent.decrypt("eA=="), Err(BrokerError::State(_))));

        agent.start("333444").unwrap();
        assert!(matches!(agent.encrypt("x"), Err(BrokerError::State(_))));
        assert!(!agent.is_ready());
    }

    #[test]
    fn malformed_peer_element_fails_and_poisons() {
        let mut approver = PakeChannel::new(Role::Responder);
        approver.start("654321").unwrap();
        assert!(matches!(
            approver.finish(&[0u8; 7]),
            Err(BrokerError::PakeFailed)
        ));
        // Poisoned: no restart, no encrypt.
        assert!(!approver.is_ready());
        assert!(matches!(approver.encrypt("x"), Err(BrokerError::State(_))));
        assert!(matches!(
            approver.start("654321"),
            Err(BrokerError::State(_))
        ));
    }

    #[test]
    fn password_absent_from_outbound_element() {
        let code = "987654";
        let mut agent = PakeChannel::new(Role::Initiator);
        let msg = agent.start(code).unwrap();

        let msg_hex = hex::encode(&msg);
        assert!(!msg_hex.contains(&hex::encode(code.as_bytes())));
        // The ASCII digits must not ride along verbatim either.
        assert!(
            !msg.windows(code.len())
                .any(|window| window == code.as_bytes())
        );
    }
}
