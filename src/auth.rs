//! Webhook signature verification.
//!
//! GitHub signs every delivery with HMAC-SHA256 over the raw request body and
//! sends the result in the `X-Hub-Signature-256` header as `sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes the signature header value GitHub would send for `payload`.
pub fn compute_signature_header(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Verifies a webhook delivery against the shared secret.
///
/// A missing header fails verification. The full header string is compared
/// in constant time against the expected `sha256=<lowercase hex>` value.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_header: Option<&str>) -> bool {
    verify_signature_with_trace(secret, payload, signature_header, false)
}

/// Same as [`verify_signature`], optionally logging both signatures at DEBUG.
pub fn verify_signature_with_trace(
    secret: &[u8],
    payload: &[u8],
    signature_header: Option<&str>,
    trace_signatures: bool,
) -> bool {
    let Some(supplied) = signature_header else {
        return false;
    };

    let expected = compute_signature_header(secret, payload);
    if trace_signatures {
        debug!(
            "Validating incoming signature. Expected: {} - Incoming: {}",
            expected, supplied
        );
    }

    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}
