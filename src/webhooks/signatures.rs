use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const SQUARE_SIGNATURE_HEADER: &str = "x-square-signature";

fn mac_for(secret: &str) -> Result<HmacSha256, ServiceError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("HMAC error: {}", e)))
}

fn invalid(reason: &str) -> ServiceError {
    ServiceError::InvalidSignature(reason.to_string())
}

/// Parsed `stripe-signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`)
#[derive(Debug, PartialEq, Eq)]
pub struct StripeSignatureHeader<'a> {
    pub timestamp: i64,
    pub signatures: Vec<&'a str>,
}

impl<'a> StripeSignatureHeader<'a> {
    pub fn parse(header: &'a str) -> Result<Self, ServiceError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| invalid("missing timestamp in signature"))?;
        if signatures.is_empty() {
            return Err(invalid("missing v1 signature"));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Checks a Stripe delivery: HMAC-SHA256 over `"{t}.{payload}"`, hex encoded,
/// with `t` no further than `tolerance_secs` from `now`.
pub fn verify_stripe_signature(
    header: Option<&str>,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let header = header.ok_or_else(|| invalid("missing stripe-signature header"))?;
    let parsed = StripeSignatureHeader::parse(header)?;

    if now.abs_diff(parsed.timestamp) > tolerance_secs {
        return Err(invalid("timestamp outside tolerance window"));
    }

    let signed_prefix = format!("{}.", parsed.timestamp);
    let matches = parsed.signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        mac_for(secret)
            .map(|mut mac| {
                mac.update(signed_prefix.as_bytes());
                mac.update(payload);
                mac.verify_slice(&expected).is_ok()
            })
            .unwrap_or(false)
    });

    if matches {
        Ok(())
    } else {
        Err(invalid("signature mismatch"))
    }
}

/// Checks a Square delivery: base64 HMAC-SHA256 over the raw body.
pub fn verify_square_signature(
    header: Option<&str>,
    payload: &[u8],
    signature_key: &str,
) -> Result<(), ServiceError> {
    let header = header.ok_or_else(|| invalid("missing x-square-signature header"))?;
    let expected = BASE64
        .decode(header.trim())
        .map_err(|_| invalid("signature is not base64"))?;

    let mut mac = mac_for(signature_key)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| invalid("signature mismatch"))
}

/// Builds a `stripe-signature` header value for `payload` signed at `timestamp`.
pub fn sign_stripe_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Builds an `x-square-signature` header value for `payload`.
pub fn sign_square_payload(payload: &[u8], signature_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signature_key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(payload);
    BASE64.encode(mac.finalize().into_bytes())
}
