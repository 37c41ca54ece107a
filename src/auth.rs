use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use k256::{
    PublicKey,
    ecdsa::{RecoveryId, Signature, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use parking_lot::RwLock;
use rand::RngCore;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use uuid::Uuid;

use crate::error::{Error, Result};

const TOKEN_TTL_HOURS: i64 = 1;
const THORCHAIN_HRP: &str = "thor";
const ETHEREUM_SIGN_PREFIX: &str = "\u{19}Ethereum Signed Message:\n";

/// Blockchain network a participant authenticates against. The chain tag
/// doubles as the asset-prefix for the `forbidden` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Chain {
    #[serde(rename = "ETH")]
    Ethereum,
    #[serde(rename = "THOR")]
    Thorchain,
}

impl Chain {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Ethereum => "ETH",
            Self::Thorchain => "THOR",
        }
    }
}

/// A challenge-response token binding a blockchain address to a caller.
///
/// The public key is kept in uncompressed SEC1 form regardless of how it
/// was submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub chain: Chain,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    pub address: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub challenge: String,
    pub verified: bool,
}

impl Token {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// In-memory cache of authentication tokens with a fixed TTL.
pub struct AuthenticationDb {
    tokens: RwLock<HashMap<Uuid, Token>>,
    ttl: Duration,
}

impl Default for AuthenticationDb {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthenticationDb {
    pub fn new() -> Self {
        Self::with_ttl(Duration::hours(TOKEN_TTL_HOURS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Issues a fresh challenge token for the given chain and public key.
    pub fn init(&self, chain: Chain, pub_key: &[u8]) -> Result<Token> {
        let public_key = normalize_public_key(pub_key)?;
        let address = address_from_public_key(chain, &public_key)?;

        let now = Utc::now();
        let token = Token {
            id: Uuid::new_v4(),
            chain,
            public_key,
            address,
            issued_at: now,
            expires_at: now + self.ttl,
            challenge: format!(
                "Authentication challenge: {}",
                STANDARD.encode(random_challenge())
            ),
            verified: false,
        };

        let mut tokens = self.tokens.write();
        tokens.retain(|_, t| !t.is_expired(now));
        tokens.insert(token.id, token.clone());

        Ok(token)
    }

    /// Checks the signature over the token's challenge and marks the token
    /// verified.
    pub fn verify(&self, id: Uuid, signature: &[u8]) -> Result<()> {
        let mut token = self.get(id)?;
        verify_challenge(&token, signature)?;

        token.verified = true;
        self.tokens.write().insert(id, token);

        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Token> {
        let tokens = self.tokens.read();
        let token = tokens.get(&id).ok_or(Error::AuthExpired)?;
        if token.is_expired(Utc::now()) {
            return Err(Error::AuthExpired);
        }
        Ok(token.clone())
    }

    /// Resolves a bearer token id into a verified, unexpired token.
    pub fn extract(&self, bearer_id: &str) -> Result<Token> {
        let id = Uuid::parse_str(bearer_id).map_err(|_| Error::AuthFailed)?;
        let token = self.get(id)?;
        if !token.verified {
            return Err(Error::AuthNotVerified);
        }
        Ok(token)
    }
}

fn random_challenge() -> [u8; 32] {
    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Accepts a compressed (33-byte) or uncompressed (65-byte) secp256k1 key
/// and returns it uncompressed.
fn normalize_public_key(pub_key: &[u8]) -> Result<Vec<u8>> {
    if pub_key.len() != 33 && pub_key.len() != 65 {
        return Err(Error::InvalidPublicKey(
            "public key must be 33 or 65 bytes of SEC1 data".into(),
        ));
    }

    let key = PublicKey::from_sec1_bytes(pub_key)
        .map_err(|err| Error::InvalidPublicKey(err.to_string()))?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}

fn address_from_public_key(chain: Chain, uncompressed: &[u8]) -> Result<String> {
    match chain {
        Chain::Ethereum => Ok(ethereum_address(uncompressed)),
        Chain::Thorchain => thorchain_address(uncompressed),
    }
}

/// Last 20 bytes of Keccak-256 over the key material, EIP-55 checksummed.
fn ethereum_address(uncompressed: &[u8]) -> String {
    let hash = Keccak256::digest(&uncompressed[1..]);
    checksummed_hex(&hash[12..])
}

fn checksummed_hex(address: &[u8]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(2 + lower.len());
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Bech32 of RIPEMD-160(SHA-256(compressed key)) under the `thor` prefix.
fn thorchain_address(uncompressed: &[u8]) -> Result<String> {
    let key = PublicKey::from_sec1_bytes(uncompressed)
        .map_err(|err| Error::InvalidPublicKey(err.to_string()))?;
    let compressed = key.to_encoded_point(true);

    let sha = Sha256::digest(compressed.as_bytes());
    let hash160 = Ripemd160::digest(sha);

    let hrp = bech32::Hrp::parse(THORCHAIN_HRP)
        .map_err(|err| Error::InvalidPublicKey(err.to_string()))?;
    bech32::encode::<bech32::Bech32>(hrp, &hash160)
        .map_err(|err| Error::InvalidPublicKey(err.to_string()))
}

fn verify_challenge(token: &Token, signature: &[u8]) -> Result<()> {
    if signature.len() != 65 {
        return Err(Error::AuthVerificationFailed(
            "signature must be 65 bytes (r || s || v)".into(),
        ));
    }

    let mut v = signature[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id = RecoveryId::from_byte(v).ok_or_else(|| {
        Error::AuthVerificationFailed("invalid signature recovery id".into())
    })?;
    let signature = Signature::from_slice(&signature[..64])
        .map_err(|err| Error::AuthVerificationFailed(err.to_string()))?;

    let prehash: [u8; 32] = match token.chain {
        Chain::Ethereum => {
            // Wallets sign the challenge through personal_sign.
            let message = format!(
                "{ETHEREUM_SIGN_PREFIX}{}{}",
                token.challenge.len(),
                token.challenge
            );
            Keccak256::digest(message.as_bytes()).into()
        }
        Chain::Thorchain => Keccak256::digest(token.challenge.as_bytes()).into(),
    };

    let recovered = VerifyingKey::recover_from_prehash(&prehash, &signature, recovery_id)
        .map_err(|err| Error::AuthVerificationFailed(err.to_string()))?;

    match token.chain {
        Chain::Ethereum => {
            let recovered_address =
                ethereum_address(recovered.to_encoded_point(false).as_bytes());
            if recovered_address != token.address {
                return Err(Error::AuthVerificationFailed(
                    "recovered address does not match".into(),
                ));
            }
        }
        Chain::Thorchain => {
            // Thorchain wallets are not verified chain-accurately yet; the
            // recovered key must simply match the registered one.
            if recovered.to_encoded_point(false).as_bytes() != token.public_key.as_slice() {
                return Err(Error::AuthVerificationFailed(
                    "recovered public key does not match".into(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::SigningKey;

    use super::*;

    fn key_one() -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        SigningKey::from_slice(&bytes).unwrap()
    }

    fn uncompressed(key: &SigningKey) -> Vec<u8> {
        key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
    }

    fn compressed(key: &SigningKey) -> Vec<u8> {
        key.verifying_key().to_encoded_point(true).as_bytes().to_vec()
    }

    #[test]
    fn derives_known_ethereum_address() {
        let address = ethereum_address(&uncompressed(&key_one()));
        assert_eq!(
            address.to_lowercase(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn eip55_checksum_matches_reference_vector() {
        let bytes = hex::decode("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap();
        assert_eq!(
            checksummed_hex(&bytes),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn derives_thorchain_bech32_address() {
        let address = thorchain_address(&uncompressed(&key_one())).unwrap();
        assert!(address.starts_with("thor1"));
        assert_eq!(address.len(), 43);
    }

    #[test]
    fn compressed_keys_are_normalized() {
        let key = key_one();
        let from_compressed = normalize_public_key(&compressed(&key)).unwrap();
        assert_eq!(from_compressed, uncompressed(&key));
        assert_eq!(from_compressed[0], 0x04);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            normalize_public_key(&[0u8; 20]).unwrap_err(),
            Error::InvalidPublicKey(_)
        ));
    }

    fn sign(key: &SigningKey, prehash: &[u8; 32]) -> Vec<u8> {
        let (signature, recovery_id) = key.sign_prehash_recoverable(prehash).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        bytes
    }

    #[test]
    fn ethereum_challenge_round_trip() {
        let db = AuthenticationDb::new();
        let key = key_one();
        let token = db.init(Chain::Ethereum, &uncompressed(&key)).unwrap();
        assert!(!token.verified);
        assert!(token.challenge.starts_with("Authentication challenge: "));

        // Not yet verified.
        assert!(matches!(
            db.extract(&token.id.to_string()).unwrap_err(),
            Error::AuthNotVerified
        ));

        let message = format!(
            "{ETHEREUM_SIGN_PREFIX}{}{}",
            token.challenge.len(),
            token.challenge
        );
        let prehash: [u8; 32] = Keccak256::digest(message.as_bytes()).into();
        db.verify(token.id, &sign(&key, &prehash)).unwrap();

        let extracted = db.extract(&token.id.to_string()).unwrap();
        assert!(extracted.verified);
        assert_eq!(extracted.address, token.address);
    }

    #[test]
    fn thorchain_challenge_round_trip() {
        let db = AuthenticationDb::new();
        let key = SigningKey::random(&mut rand::thread_rng());
        let token = db.init(Chain::Thorchain, &compressed(&key)).unwrap();

        let prehash: [u8; 32] = Keccak256::digest(token.challenge.as_bytes()).into();
        db.verify(token.id, &sign(&key, &prehash)).unwrap();
        assert!(db.extract(&token.id.to_string()).unwrap().verified);
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let db = AuthenticationDb::new();
        let key = key_one();
        let intruder = SigningKey::random(&mut rand::thread_rng());
        let token = db.init(Chain::Ethereum, &uncompressed(&key)).unwrap();

        let message = format!(
            "{ETHEREUM_SIGN_PREFIX}{}{}",
            token.challenge.len(),
            token.challenge
        );
        let prehash: [u8; 32] = Keccak256::digest(message.as_bytes()).into();
        let err = db.verify(token.id, &sign(&intruder, &prehash)).unwrap_err();
        assert!(matches!(err, Error::AuthVerificationFailed(_)));
    }

    #[test]
    fn expired_tokens_are_gone() {
        let db = AuthenticationDb::with_ttl(Duration::seconds(-1));
        let token = db.init(Chain::Ethereum, &uncompressed(&key_one())).unwrap();
        assert!(matches!(db.get(token.id).unwrap_err(), Error::AuthExpired));
    }

    #[test]
    fn garbage_bearer_fails_auth() {
        let db = AuthenticationDb::new();
        assert!(matches!(
            db.extract("not-a-uuid").unwrap_err(),
            Error::AuthFailed
        ));
        assert!(matches!(
            db.extract(&Uuid::new_v4().to_string()).unwrap_err(),
            Error::AuthExpired
        ));
    }
}
