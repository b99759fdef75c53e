//! HTTP Digest access authentication (RFC 7616).
//!
//! State is per target: the parsed challenge, the selected algorithm and
//! qop, and the nonce-count.  A fresh nonce (including `stale=true`
//! re-challenges) restarts the nonce-count at 1.
//!
//! Supported algorithms: MD5, MD5-sess, SHA-256, SHA-256-sess.
//! Supported qop: `auth` (preferred when offered) or none (RFC 2069 mode).

use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The WWW-Authenticate header is not a Digest challenge.
    NotDigest,
    /// The challenge is missing a required field.
    MissingField(&'static str),
    /// The server demanded an algorithm this client does not implement.
    UnsupportedAlgorithm(String),
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestError::NotDigest => write!(f, "not a Digest challenge"),
            DigestError::MissingField(name) => write!(f, "challenge missing '{}'", name),
            DigestError::UnsupportedAlgorithm(a) => write!(f, "unsupported algorithm '{}'", a),
        }
    }
}

impl std::error::Error for DigestError {}

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(token: &str) -> Option<Algorithm> {
        match token.to_ascii_uppercase().as_str() {
            "MD5" => Some(Algorithm::Md5),
            "MD5-SESS" => Some(Algorithm::Md5Sess),
            "SHA-256" => Some(Algorithm::Sha256),
            "SHA-256-SESS" => Some(Algorithm::Sha256Sess),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    fn hash(self, data: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => hex::encode(Md5::digest(data.as_bytes())),
            Algorithm::Sha256 | Algorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data.as_bytes()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DigestState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Challenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Algorithm,
    /// `Some("auth")` when qop is in effect; `None` for RFC 2069 mode.
    qop: Option<&'static str>,
}

/// Digest authentication state for one target.
#[derive(Debug, Clone)]
pub struct DigestState {
    username: String,
    password: String,
    challenge: Option<Challenge>,
    nc: u32,
}

impl DigestState {
    pub fn new(username: &str, password: &str) -> DigestState {
        DigestState {
            username: username.to_owned(),
            password: password.to_owned(),
            challenge: None,
            nc: 0,
        }
    }

    /// True once a challenge has been absorbed.
    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Forget all server state (used on reconnect).
    pub fn reset(&mut self) {
        self.challenge = None;
        self.nc = 0;
    }

    /// Absorb a `WWW-Authenticate` challenge.
    ///
    /// A new nonce -- including one delivered with `stale=true` -- restarts
    /// the nonce-count, so the next request goes out with `nc=00000001`.
    pub fn handle_challenge(&mut self, www_authenticate: &str) -> Result<(), DigestError> {
        let params = parse_challenge_params(www_authenticate)?;

        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or(DigestError::MissingField("nonce"))?;
        let realm = params.get("realm").cloned().unwrap_or_default();

        let algorithm = match params.get("algorithm") {
            None => Algorithm::Md5,
            Some(token) => Algorithm::parse(token)
                .ok_or_else(|| DigestError::UnsupportedAlgorithm(token.clone()))?,
        };

        let qop = params.get("qop").and_then(|offered| {
            offered
                .split(',')
                .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                .then_some("auth")
        });

        let stale = params
            .get("stale")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let nonce_changed = self
            .challenge
            .as_ref()
            .is_none_or(|c| c.nonce != nonce);
        if stale || nonce_changed {
            self.nc = 0;
        }

        self.challenge = Some(Challenge {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            algorithm,
            qop,
        });
        Ok(())
    }

    /// Produce an `Authorization` header value for `method` on `uri`,
    /// advancing the nonce-count.  Returns `None` before any challenge.
    pub fn authorization(&mut self, method: &str, uri: &str) -> Option<String> {
        let cnonce = make_cnonce();
        self.authorization_with_cnonce(method, uri, &cnonce)
    }

    fn authorization_with_cnonce(
        &mut self,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> Option<String> {
        let challenge = self.challenge.as_ref()?;
        self.nc += 1;
        let nc = format!("{:08x}", self.nc);

        let mut ha1 = challenge.algorithm.hash(&format!(
            "{}:{}:{}",
            self.username, challenge.realm, self.password
        ));
        if challenge.algorithm.is_session() {
            ha1 = challenge
                .algorithm
                .hash(&format!("{}:{}:{}", ha1, challenge.nonce, cnonce));
        }
        let ha2 = challenge.algorithm.hash(&format!("{}:{}", method, uri));

        let response = match challenge.qop {
            Some(qop) => challenge.algorithm.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, nc, cnonce, qop, ha2
            )),
            None => challenge
                .algorithm
                .hash(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri, response
        );
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header.push_str(&format!(", algorithm={}", challenge.algorithm.token()));
        if let Some(qop) = challenge.qop {
            header.push_str(&format!(", qop={}, nc={}", qop, nc));
        }
        if challenge.qop.is_some() || challenge.algorithm.is_session() {
            header.push_str(&format!(", cnonce=\"{}\"", cnonce));
        }
        Some(header)
    }
}

// ---------------------------------------------------------------------------
// Challenge parsing
// ---------------------------------------------------------------------------

/// Parse the parameter list of a `Digest` challenge into a lowercase-keyed
/// map.  Commas inside quoted strings (e.g. `qop="auth,auth-int"`) do not
/// split parameters.
fn parse_challenge_params(header: &str) -> Result<BTreeMap<String, String>, DigestError> {
    let trimmed = header.trim();
    let scheme_ok = trimmed
        .get(..6)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("digest"));
    if !scheme_ok {
        return Err(DigestError::NotDigest);
    }
    let rest = trimmed[6..].trim_start();

    let mut params = BTreeMap::new();
    for item in split_unquoted_commas(rest) {
        let Some(eq) = item.find('=') else { continue };
        let key = item[..eq].trim().to_lowercase();
        let value = unquote(item[eq + 1..].trim());
        if !key.is_empty() {
            params.insert(key, value);
        }
    }
    Ok(params)
}

fn split_unquoted_commas(input: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&input[start..]);
    items
}

fn unquote(value: &str) -> String {
    let stripped = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    stripped.replace("\\\"", "\"")
}

/// Random client nonce: 16 hex chars of fresh UUID material.
fn make_cnonce() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..16].to_owned()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
