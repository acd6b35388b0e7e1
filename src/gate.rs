use hmac::{Hmac, Mac as _};
use sha2::Sha256;

use crate::error::{BillingError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Authenticates provider callbacks.
///
/// The MAC is always computed over the bytes exactly as received. Parsing and
/// re-serializing the body first can reorder keys or change whitespace and
/// would make genuine callbacks fail verification.
#[derive(Clone)]
pub struct SignatureGate {
    key: Vec<u8>,
}

impl std::fmt::Debug for SignatureGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureGate").finish_non_exhaustive()
    }
}

impl SignatureGate {
    pub fn new(private_key: impl AsRef<[u8]>) -> Self {
        Self {
            key: private_key.as_ref().to_vec(),
        }
    }

    /// Hex-encoded HMAC-SHA256 of `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        hex::encode(self.mac(body).finalize().into_bytes())
    }

    pub fn verify(&self, raw_body: &[u8], provided_signature: Option<&str>) -> Result<()> {
        let provided = provided_signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(BillingError::SignatureInvalid)?;
        let provided = hex::decode(provided.to_ascii_lowercase())
            .map_err(|_| BillingError::SignatureInvalid)?;

        // verify_slice compares in constant time
        self.mac(raw_body)
            .verify_slice(&provided)
            .map_err(|_| BillingError::SignatureInvalid)
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(body);
        mac
    }
}
