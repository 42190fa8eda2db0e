//! Per-connection session crypto.
//!
//! Each connection negotiates an ephemeral secp256k1 keypair during the
//! TCP handshake. Both ends run ECDH over the exchanged public keys and
//! feed the shared secret through HKDF-SHA256, salted with the configured
//! password, to derive one ChaCha20-Poly1305 key per direction. A wrong
//! password yields wrong keys, so key confirmation (an encrypted probe
//! exchanged at the end of the handshake) fails and the connection is
//! rejected before any data flows.
//!
//! UDP payloads are sealed per-frame:
//!
//! ```text
//! [counter:8 BE][ciphertext + 16-byte tag]
//! ```
//!
//! The counter doubles as the AEAD nonce and as replay protection input:
//! receivers track a sliding window and reject duplicates and stragglers
//! that fall behind it. Without a password the same framing is used with
//! a pass-through codec, so the datagram format is identical either way.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::name::PeerName;

/// AEAD tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Sequence counter prefix on every encrypted payload.
pub const COUNTER_SIZE: usize = 8;

/// Replay window size in packets (matching WireGuard).
const REPLAY_WINDOW_SIZE: u64 = 64;

/// Fixed plaintext exchanged for key confirmation during the handshake.
pub const KEY_CONFIRM_PROBE: &[u8] = b"weft key confirmation";

/// Errors from sealing or opening frames.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("payload too short: {0} bytes")]
    TooShort(usize),

    #[error("integrity check failed")]
    IntegrityFailure,

    #[error("replay detected: counter {0} already seen or too old")]
    Replay(u64),

    #[error("nonce counter exhausted")]
    NonceOverflow,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(#[from] secp256k1::Error),
}

impl CryptoError {
    /// Whether this failure should kill the connection rather than drop
    /// one datagram. Forged or corrupted ciphertext means the session keys
    /// disagree; replays and short packets are per-packet noise.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CryptoError::IntegrityFailure | CryptoError::NonceOverflow)
    }
}

/// Sliding receive window rejecting replayed and ancient counters.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record a counter. Errors on duplicates and on counters
    /// more than the window size behind the highest seen.
    pub fn check(&mut self, counter: u64) -> Result<(), CryptoError> {
        if counter > self.highest {
            let shift = counter - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.highest = counter;
            return Ok(());
        }
        let behind = self.highest - counter;
        if behind >= REPLAY_WINDOW_SIZE {
            return Err(CryptoError::Replay(counter));
        }
        let bit = 1u64 << behind;
        if self.bitmap & bit != 0 {
            return Err(CryptoError::Replay(counter));
        }
        self.bitmap |= bit;
        Ok(())
    }
}

/// Sending half of a session codec.
pub trait Encryptor: Send {
    /// Seal one UDP payload.
    fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Bytes added to every payload by this codec.
    fn overhead(&self) -> usize;
}

/// Receiving half of a session codec.
pub trait Decryptor: Send {
    /// Open one UDP payload.
    fn decrypt(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Pass-through codec for unencrypted meshes.
#[derive(Default)]
pub struct NullEncryptor;

impl Encryptor for NullEncryptor {
    fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plain.to_vec())
    }

    fn overhead(&self) -> usize {
        0
    }
}

/// Pass-through codec for unencrypted meshes.
#[derive(Default)]
pub struct NullDecryptor;

impl Decryptor for NullDecryptor {
    fn decrypt(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(payload.to_vec())
    }
}

/// AEAD sender state: one key, one monotone counter.
pub struct AeadEncryptor {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl AeadEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            // 32-byte slice always satisfies the key size
            cipher: ChaCha20Poly1305::new_from_slice(key).expect("key size"),
            counter: 0,
        }
    }
}

impl Encryptor for AeadEncryptor {
    fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;
        let nonce = counter_to_nonce(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| CryptoError::IntegrityFailure)?;
        let mut out = Vec::with_capacity(COUNTER_SIZE + ciphertext.len());
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn overhead(&self) -> usize {
        COUNTER_SIZE + TAG_SIZE
    }
}

/// AEAD receiver state: one key, one replay window.
pub struct AeadDecryptor {
    cipher: ChaCha20Poly1305,
    window: ReplayWindow,
}

impl AeadDecryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new_from_slice(key).expect("key size"),
            window: ReplayWindow::new(),
        }
    }
}

impl Decryptor for AeadDecryptor {
    fn decrypt(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < COUNTER_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort(payload.len()));
        }
        let counter = u64::from_be_bytes(
            payload[..COUNTER_SIZE].try_into().expect("counter size"),
        );
        let nonce = counter_to_nonce(counter);
        let plain = self
            .cipher
            .decrypt(&nonce, &payload[COUNTER_SIZE..])
            .map_err(|_| CryptoError::IntegrityFailure)?;
        // Window update only after authentication, or an attacker could
        // poison the window with forged counters.
        self.window.check(counter)?;
        Ok(plain)
    }
}

fn counter_to_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Directional session keys derived from an ECDH exchange.
pub struct SessionKeys {
    pub tx: [u8; 32],
    pub rx: [u8; 32],
}

/// Derive per-direction keys from the ECDH shared secret and the password.
///
/// Both ends call this with the same (secret, password) and their own view
/// of (local, remote); direction assignment keys off the name ordering so
/// one end's tx is the other's rx.
pub fn derive_session_keys(
    shared_secret: &[u8],
    password: &[u8],
    local: PeerName,
    remote: PeerName,
) -> SessionKeys {
    let hk = Hkdf::<Sha256>::new(Some(password), shared_secret);
    let (lo, hi) = if local < remote {
        (local, remote)
    } else {
        (remote, local)
    };
    let mut info = Vec::with_capacity(26);
    info.extend_from_slice(b"weft-froth-");
    info.extend_from_slice(lo.as_slice());
    info.extend_from_slice(hi.as_slice());
    let mut okm = [0u8; 64];
    hk.expand(&info, &mut okm).expect("64 bytes is valid hkdf length");

    let mut low_key = [0u8; 32];
    let mut high_key = [0u8; 32];
    low_key.copy_from_slice(&okm[..32]);
    high_key.copy_from_slice(&okm[32..]);

    // Lower-named peer transmits with the first key.
    if local < remote {
        SessionKeys {
            tx: low_key,
            rx: high_key,
        }
    } else {
        SessionKeys {
            tx: high_key,
            rx: low_key,
        }
    }
}

/// Ephemeral keypair for one connection's key exchange.
pub struct EphemeralKey {
    secret: secp256k1::SecretKey,
    public: secp256k1::PublicKey,
}

impl EphemeralKey {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secp = secp256k1::Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Self { secret, public }
    }

    /// Compressed public key for the handshake.
    pub fn public_bytes(&self) -> [u8; 33] {
        self.public.serialize()
    }

    /// Run ECDH against the remote's compressed public key.
    pub fn agree(&self, remote_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let remote = secp256k1::PublicKey::from_slice(remote_public)?;
        let shared = secp256k1::ecdh::SharedSecret::new(&remote, &self.secret);
        Ok(shared.secret_bytes())
    }
}
