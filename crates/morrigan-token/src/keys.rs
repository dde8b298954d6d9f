use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use rand::rngs::OsRng;

use morrigan_core::error::{Error, Result};

/// One ECDSA P-256 key pair, held long enough to sign tokens and verify
/// them against an in-flight record. The public half is also kept in the
/// compact form persisted on `TokenVerificationRecord::public_key`.
pub struct KeyMaterial {
    signing: SigningKey,
    public_point: Vec<u8>,
}

impl KeyMaterial {
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let verifying = VerifyingKey::from(&signing);
        let public_point = verifying.to_encoded_point(false).as_bytes().to_vec();
        Self {
            signing,
            public_point,
        }
    }

    pub fn encoding_key(&self) -> Result<EncodingKey> {
        let der = self
            .signing
            .to_pkcs8_der()
            .map_err(|e| Error::server_error(format!("key encode failed: {e}")))?;
        Ok(EncodingKey::from_ec_der(der.as_bytes()))
    }

    /// The public key in the compact form stored on verification records:
    /// base64 of the uncompressed SEC1 point.
    pub fn public_key_b64(&self) -> String {
        B64.encode(&self.public_point)
    }
}

/// Builds a `DecodingKey` from a verification record's stored public key,
/// which round-trips `KeyMaterial::public_key_b64`.
pub fn decoding_key_from_b64(public_key_b64: &str) -> Result<DecodingKey> {
    let bytes = B64
        .decode(public_key_b64)
        .map_err(|e| Error::invalid_record(format!("public key is not base64: {e}")))?;
    Ok(DecodingKey::from_ec_der(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_b64_roundtrips_through_decoding_key() {
        let key = KeyMaterial::generate();
        let b64 = key.public_key_b64();
        assert!(decoding_key_from_b64(&b64).is_ok());
    }

    #[test]
    fn distinct_keys_have_distinct_public_material() {
        let a = KeyMaterial::generate();
        let b = KeyMaterial::generate();
        assert_ne!(a.public_key_b64(), b.public_key_b64());
    }
}
