//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the per-attempt code verifier, its S256 challenge and the
//! anti-CSRF `state`, and builds the Google authorization URL. The verifier
//! stays in process memory and is sent only with the code exchange.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Random bytes behind a verifier. 32 bytes encode to 43 base64url characters,
/// the RFC 7636 minimum.
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind the anti-CSRF state value.
const STATE_BYTES: usize = 16;

/// The only challenge method this client uses.
pub const CHALLENGE_METHOD: &str = "S256";

/// Verifier/challenge pair for one authorization attempt.
#[derive(Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    /// Fresh random verifier and its S256 challenge.
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Build from an externally supplied verifier, validating RFC 7636 length
    /// and alphabet.
    pub fn from_verifier(verifier: impl Into<String>) -> Result<Self> {
        let verifier = verifier.into();
        validate_verifier(&verifier)?;
        let challenge = compute_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }

    pub fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }
}

impl std::fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("verifier", &"[REDACTED]")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Generate a cryptographically random PKCE code verifier.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random opaque value round-tripped through the redirect.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// RFC 7636 §4.1: 43-128 characters from `[A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"`.
pub fn validate_verifier(verifier: &str) -> Result<()> {
    if !(43..=128).contains(&verifier.len()) {
        return Err(Error::Validation(format!(
            "PKCE verifier must be 43-128 characters, got {}",
            verifier.len()
        )));
    }
    if !verifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return Err(Error::Validation(
            "PKCE verifier contains characters outside the unreserved set".into(),
        ));
    }
    Ok(())
}

/// Inputs for the authorization URL.
#[derive(Debug)]
pub struct AuthorizationRequest<'a> {
    pub auth_url: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    pub state: &'a str,
    pub challenge: &'a str,
}

/// Build the consent URL. Requests offline access and forces the consent
/// prompt so Google always returns a refresh token.
pub fn build_authorization_url(request: &AuthorizationRequest<'_>) -> String {
    let scope = request.scopes.join(" ");
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}\
         &code_challenge={}&code_challenge_method={}&access_type=offline\
         &prompt=consent&include_granted_scopes=true",
        request.auth_url,
        urlencoding::encode(request.client_id),
        urlencoding::encode(request.redirect_uri),
        urlencoding::encode(&scope),
        urlencoding::encode(request.state),
        urlencoding::encode(request.challenge),
        CHALLENGE_METHOD,
    )
}
