//! HTTP Basic (RFC 7617) and Digest (RFC 7616, MD5) authentication.
//!
//! Exchange front ends usually advertise several schemes at once
//! (`Negotiate`, `NTLM`, `Basic`). Only Digest and Basic are spoken here;
//! Digest wins when both are offered.

use std::collections::HashMap;

use base64::Engine;
use rand::Rng;

/// A scheme offered by the server in `WWW-Authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Digest(DigestAuth),
    Basic,
}

impl Challenge {
    /// Picks the best supported scheme among all `WWW-Authenticate` values.
    pub fn select<'a>(headers: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut basic = false;
        for header in headers {
            let header = header.trim();
            if let Some(digest) = DigestAuth::parse(header) {
                return Some(Self::Digest(digest));
            }
            let scheme = header.split_whitespace().next().unwrap_or_default();
            basic |= scheme.eq_ignore_ascii_case("basic");
        }
        basic.then_some(Self::Basic)
    }
}

/// Digest state negotiated with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestAuth {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Whether the server offered `qop=auth`.
    pub qop_auth: bool,
    nonce_count: u32,
}

impl DigestAuth {
    /// Parses a `Digest ...` challenge. Only MD5 is accepted.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }
        let params = parse_params(rest);
        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return None;
            }
        }
        Some(Self {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            opaque: params.get("opaque").cloned(),
            qop_auth: params
                .get("qop")
                .is_some_and(|q| q.split(',').any(|v| v.trim() == "auth")),
            nonce_count: 0,
        })
    }

    /// Builds the `Authorization` value for one request.
    pub fn authorize(&mut self, method: &str, uri: &str, username: &str, password: &str) -> String {
        let ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", algorithm=MD5",
            self.realm, self.nonce
        );

        let response = if self.qop_auth {
            self.nonce_count += 1;
            let nc = format!("{:08x}", self.nonce_count);
            let cnonce = client_nonce();
            header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
            md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:auth:{ha2}", self.nonce))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };
        header.push_str(&format!(", response=\"{response}\""));

        if let Some(ref opaque) = self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header
    }
}

/// `Authorization` value for Basic.
pub fn basic_auth(username: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

/// Splits `k=v, k="quoted, value"` pairs. Keys are lowercased.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_ascii_lowercase();
        let after_key = after_key.trim_start();
        let (value, remaining) = if let Some(quoted) = after_key.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            (value, &quoted[end..])
        } else {
            let end = after_key.find(',').unwrap_or(after_key.len());
            (after_key[..end].trim().to_string(), &after_key[end..])
        };
        params.insert(key, value);
        rest = remaining;
    }
    params
}

fn client_nonce() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
