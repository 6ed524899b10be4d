use ecdsa::{SigningKey, VerifyingKey, signature::rand_core::OsRng};
use k256::Secp256k1;
use serde::{Deserialize, Serialize};

use crate::{error::Result, sha256::Hash};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PublicKey(pub VerifyingKey<Secp256k1>);

impl PublicKey {
    /// Address outputs are locked to: hex digest of the encoded key.
    pub fn address(&self) -> Result<String> {
        Ok(Hash::hash(self)?.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PrivateKey(#[serde(with = "signkey_serde")] pub SigningKey<Secp256k1>);

impl PrivateKey {
    pub fn new_key() -> Self {
        Self(SigningKey::random(&mut OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new_key()
    }
}

mod signkey_serde {
    use serde::{Deserialize, de::Error};

    pub fn serialize<S>(
        key: &super::SigningKey<super::Secp256k1>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&key.to_bytes())
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<super::SigningKey<super::Secp256k1>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        super::SigningKey::from_slice(&bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_stable_per_key() {
        let key = PrivateKey::new_key();
        let other = PrivateKey::new_key();

        let address = key.public_key().address().unwrap();
        assert_eq!(address, key.public_key().address().unwrap());
        assert_ne!(address, other.public_key().address().unwrap());
        assert_eq!(address.len(), 64);
    }

    #[test]
    fn private_key_survives_cbor() {
        let key = PrivateKey::new_key();
        let mut bytes = Vec::new();
        ciborium::into_writer(&key, &mut bytes).unwrap();
        let decoded: PrivateKey = ciborium::from_reader(bytes.as_slice()).unwrap();

        assert_eq!(decoded.public_key(), key.public_key());
    }
}
