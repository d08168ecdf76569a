//! AWS Signature Version 4 request signing
//!
//! Minimal signer for Bedrock-family requests: derives the signing key via
//! the HMAC-SHA256 chain and installs `x-amz-date` plus the `authorization`
//! header. The signed header set is `host`, `x-amz-date`, and
//! `content-type` when present, which is sufficient for the Bedrock runtime
//! endpoints (the payload hash travels in the canonical request itself).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Key material and scope for one signature.
pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

/// Sign a request in place: inserts `x-amz-date` and `authorization`.
pub fn sign(
    method: &str,
    url: &str,
    headers: &mut HeaderMap,
    payload: &[u8],
    params: &SigningParams<'_>,
    now: DateTime<Utc>,
) -> Result<()> {
    let (host, path, query) = split_url(url)?;
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    headers.insert(
        HeaderName::from_static("x-amz-date"),
        HeaderValue::from_str(&amz_date)
            .map_err(|_| Error::Auth("invalid x-amz-date value".into()))?,
    );

    // Signed headers in lexicographic order.
    let mut signed: Vec<(String, String)> = Vec::new();
    if let Some(content_type) = headers.get(reqwest::header::CONTENT_TYPE) {
        let value = content_type
            .to_str()
            .map_err(|_| Error::Auth("content-type is not valid ascii".into()))?;
        signed.push(("content-type".into(), canonical_value(value)));
    }
    signed.push(("host".into(), host.to_string()));
    signed.push(("x-amz-date".into(), amz_date.clone()));
    signed.sort();

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers: String = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let payload_hash = hex(&Sha256::digest(payload));
    let canonical_request = format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        query = canonical_query(query),
    );

    let scope = format!("{date}/{}/{}/aws4_request", params.region, params.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(
        format!("AWS4{}", params.secret_access_key).as_bytes(),
        date.as_bytes(),
    )?;
    let k_region = hmac(&k_date, params.region.as_bytes())?;
    let k_service = hmac(&k_region, params.service.as_bytes())?;
    let k_signing = hmac(&k_service, b"aws4_request")?;
    let signature = hex(&hmac(&k_signing, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        params.access_key_id,
    );
    headers.insert(
        reqwest::header::AUTHORIZATION,
        HeaderValue::from_str(&authorization)
            .map_err(|_| Error::Auth("constructed authorization header is invalid".into()))?,
    );
    Ok(())
}

/// Percent-encode a path segment per the signing rules: unreserved
/// characters stay literal, everything else (including `:` common in model
/// identifiers) is encoded.
pub fn uri_encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn split_url(url: &str) -> Result<(&str, &str, &str)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| Error::Auth(format!("unsupported url scheme: {url}")))?;
    let (host, path_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (path, query) = match path_query.find('?') {
        Some(idx) => (&path_query[..idx], &path_query[idx + 1..]),
        None => (path_query, ""),
    };
    Ok((host, path, query))
}

fn canonical_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<&str> = query.split('&').collect();
    pairs.sort();
    pairs.join("&")
}

/// Trim and collapse internal whitespace runs, per the canonicalization
/// rules for signed header values.
fn canonical_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::Auth("hmac key initialization failed".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
