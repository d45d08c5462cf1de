use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const SESSION_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionTokenClaims {
    sub: String,
    display_name: String,
    iat: i64,
    exp: i64,
}

/// Identity embedded in a verified session token: the authenticated user
/// id plus the display attributes the messaging layer needs to compose
/// presence and notification text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Verifies signed session tokens presented at connection time.
///
/// Token minting belongs to the platform's auth service; this service
/// only issues tokens in tests and local development.
#[derive(Clone)]
pub struct SessionTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SessionTokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_session_token(
        &self,
        user_id: Uuid,
        display_name: &str,
    ) -> anyhow::Result<String> {
        self.issue_session_token_at(user_id, display_name, current_unix_timestamp()?)
    }

    fn issue_session_token_at(
        &self,
        user_id: Uuid,
        display_name: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = SessionTokenClaims {
            sub: user_id.to_string(),
            display_name: display_name.to_owned(),
            iat: issued_at,
            exp: issued_at + SESSION_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode session token")
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<VerifiedIdentity> {
        let claims = decode::<SessionTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode session token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("session token subject '{}' is not a UUID", claims.sub))?;

        if claims.display_name.trim().is_empty() {
            return Err(anyhow!("session token is missing a display name"));
        }

        Ok(VerifiedIdentity { user_id, display_name: claims.display_name })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
pub(crate) const TEST_SECRET: &str = "agora_test_secret_that_is_definitely_long_enough";
