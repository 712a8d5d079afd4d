//! Schnorr signatures over secp256k1
//!
//! Service nodes carry two keys: the identity key that owns the collateral
//! (signs announcements) and the operational key held by the running node
//! (signs pings).

use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Hash;

/// Signature errors
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid private key")]
    InvalidPrivateKey,
}

/// 32-byte private key
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// 32-byte public key (x-only for Schnorr)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_serde")] pub [u8; 32]);

/// 64-byte Schnorr signature
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature(#[serde(with = "sig_serde")] pub [u8; 64]);

mod pubkey_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid public key length"))
    }
}

mod sig_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        SigningKey::from_bytes(bytes)
            .map(PrivateKey)
            .map_err(|_| SignatureError::InvalidPrivateKey)
    }

    /// Parse a hex-encoded secret, as found in operator configuration
    pub fn from_hex(secret: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(secret.trim()).map_err(|_| SignatureError::InvalidPrivateKey)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidPrivateKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn public_key(&self) -> PublicKey {
        let bytes = self.0.verifying_key().to_bytes();
        PublicKey(bytes.into())
    }

    /// Sign a message hash
    pub fn sign(&self, message: &Hash) -> SchnorrSignature {
        let signature: Signature = self.0.sign(&message.0);
        SchnorrSignature(signature.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        VerifyingKey::from_bytes(bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(PublicKey(*bytes))
    }

    pub fn verify(&self, message: &Hash, signature: &SchnorrSignature) -> bool {
        let verifying_key = match VerifyingKey::from_bytes(&self.0) {
            Ok(vk) => vk,
            Err(_) => return false,
        };

        let sig = match Signature::try_from(signature.0.as_slice()) {
            Ok(s) => s,
            Err(_) => return false,
        };

        verifying_key.verify(&message.0, &sig).is_ok()
    }

    /// Hash committed to by outputs paying this key (the "script")
    pub fn pubkey_hash(&self) -> Hash {
        super::hash_bytes(&self.0)
    }

    /// Human-readable address: "SN" + Base58Check(pubkey_hash[0:20])
    pub fn to_address(&self) -> String {
        let hash = self.pubkey_hash();
        let addr_bytes = &hash.0[0..20];
        let checksum = super::double_hash(addr_bytes);

        let mut with_checksum = Vec::with_capacity(24);
        with_checksum.extend_from_slice(addr_bytes);
        with_checksum.extend_from_slice(&checksum.0[0..4]);

        format!("SN{}", bs58::encode(&with_checksum).into_string())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl SchnorrSignature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        SchnorrSignature(*bytes)
    }

    /// Placeholder used before a payload is signed
    pub const fn empty() -> Self {
        SchnorrSignature([0u8; 64])
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl std::fmt::Debug for SchnorrSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}
