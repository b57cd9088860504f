//! Client side of the relay's OTP authentication: JWT claim checks plus the
//! request/verify/refresh calls. Signature verification is the relay's job;
//! the client only sanity-checks that a stored token is the right kind, for
//! the right identity, and not already expired.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

/// The subset of JWT claims the client inspects.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default, rename = "type")]
    token_type: String,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
}

impl TokenClaims {
    fn parse(token: &str) -> Result<Self> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next()) {
            (Some(header), Some(payload)) if !header.is_empty() && !payload.is_empty() => payload,
            _ => bail!("malformed token"),
        };
        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .context("token payload base64")?;
        serde_json::from_slice(&raw).context("token payload json")
    }

    fn expires_at(&self) -> Result<Option<DateTime<Utc>>> {
        match self.exp {
            None => Ok(None),
            Some(exp) => DateTime::<Utc>::from_timestamp(exp, 0)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("token exp out of range: {exp}")),
        }
    }
}

pub fn validate_token(token: &str, expected_type: &str, email: &str) -> Result<()> {
    let claims = TokenClaims::parse(token)?;
    if claims.token_type != expected_type {
        bail!(
            "wrong token type: wanted {expected_type}, got {:?}",
            claims.token_type
        );
    }
    if !claims.sub.is_empty() && claims.sub != email {
        bail!("token subject {:?} does not match {email:?}", claims.sub);
    }
    if let Some(expiry) = claims.expires_at()? {
        if expiry <= Utc::now() {
            bail!("token expired, login again");
        }
    }
    Ok(())
}

/// The `sub` claim, if the token parses and carries one. Used to detect a
/// config email drifting away from the identity the tokens were issued for.
pub fn token_subject(token: &str) -> Option<String> {
    let claims = TokenClaims::parse(token).ok()?;
    let sub = claims.sub.trim();
    if sub.is_empty() {
        None
    } else {
        Some(sub.to_string())
    }
}

pub async fn request_email_code(
    http: &reqwest::Client,
    server_url: &str,
    email: &str,
) -> Result<()> {
    let url = endpoint(server_url, "/auth/otp/request");
    let resp = http
        .post(url)
        .json(&serde_json::json!({ "email": email }))
        .send()
        .await
        .context("request otp: post")?;
    if !resp.status().is_success() {
        bail!("request otp: http {}", resp.status());
    }
    Ok(())
}

pub async fn verify_email_code(
    http: &reqwest::Client,
    server_url: &str,
    email: &str,
    code: &str,
) -> Result<AuthTokenResponse> {
    if !is_valid_otp(code) {
        bail!("one-time code must be 8 uppercase letters or digits");
    }
    post_json(
        http,
        server_url,
        "/auth/otp/verify",
        &serde_json::json!({ "email": email, "code": code }),
        "verify otp",
    )
    .await
}

pub async fn refresh_auth_tokens(
    http: &reqwest::Client,
    server_url: &str,
    refresh_token: &str,
) -> Result<AuthTokenResponse> {
    post_json(
        http,
        server_url,
        "/auth/refresh",
        &serde_json::json!({ "refreshToken": refresh_token }),
        "refresh tokens",
    )
    .await
}

pub fn is_valid_otp(code: &str) -> bool {
    code.len() == 8
        && code
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

fn endpoint(server_url: &str, path: &str) -> String {
    format!("{}{path}", server_url.trim_end_matches('/'))
}

async fn post_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    server_url: &str,
    path: &str,
    body: &serde_json::Value,
    op: &str,
) -> Result<T> {
    let resp = http
        .post(endpoint(server_url, path))
        .json(body)
        .send()
        .await
        .with_context(|| format!("{op}: post"))?;
    let status = resp.status();
    if !status.is_success() {
        bail!("{op}: http {status}");
    }
    resp.json::<T>()
        .await
        .with_context(|| format!("{op}: decode response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with(payload: &serde_json::Value) -> String {
        let header = serde_json::json!({"alg": "none", "typ": "JWT"});
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap())
        )
    }

    #[test]
    fn claims_parse_rejects_malformed_tokens() {
        assert!(TokenClaims::parse("").is_err());
        assert!(TokenClaims::parse("only-one-segment").is_err());
        assert!(TokenClaims::parse("a.!!!not-base64!!!.c").is_err());
    }

    #[test]
    fn validate_token_enforces_type_subject_and_expiry() {
        let email = "alice@example.com";

        let good = token_with(&serde_json::json!({"type": "refresh", "sub": email}));
        validate_token(&good, "refresh", email).unwrap();

        let wrong_type = token_with(&serde_json::json!({"type": "access", "sub": email}));
        let err = validate_token(&wrong_type, "refresh", email).unwrap_err();
        assert!(err.to_string().contains("wrong token type"));

        let wrong_sub =
            token_with(&serde_json::json!({"type": "refresh", "sub": "mallory@example.com"}));
        let err = validate_token(&wrong_sub, "refresh", email).unwrap_err();
        assert!(err.to_string().contains("does not match"));

        let expired =
            token_with(&serde_json::json!({"type": "refresh", "sub": email, "exp": 1}));
        let err = validate_token(&expired, "refresh", email).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn missing_subject_claim_is_accepted() {
        let token = token_with(&serde_json::json!({"type": "access"}));
        validate_token(&token, "access", "anyone@example.com").unwrap();
        assert_eq!(token_subject(&token), None);
    }

    #[test]
    fn token_subject_extracts_the_identity() {
        let token =
            token_with(&serde_json::json!({"type": "access", "sub": "alice@example.com"}));
        assert_eq!(token_subject(&token).as_deref(), Some("alice@example.com"));
        assert_eq!(token_subject("garbage"), None);
    }

    #[test]
    fn otp_shape_is_eight_uppercase_alphanumerics() {
        assert!(is_valid_otp("ABCD1234"));
        assert!(is_valid_otp("00000000"));
        assert!(!is_valid_otp("abcd1234"));
        assert!(!is_valid_otp("ABCD123"));
        assert!(!is_valid_otp("ABCD12345"));
        assert!(!is_valid_otp("ABCD-123"));
    }
}
