//! Bearer credential validation and user profile lookup.

use crate::error::{AppError, AppResult};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    /// Preferred spoken language (ISO 639-1)
    pub language: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a bearer credential to a user id.
    async fn validate(&self, credential: &str) -> AppResult<String>;

    /// Profile fields for a validated user.
    async fn profile(&self, user_id: &str) -> AppResult<UserProfile>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
    #[serde(default)]
    language: Option<String>,
}

/// HS256 JWT validation with languages remembered from the token's claims.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
    languages: DashMap<String, String>,
    default_language: String,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str, default_language: impl Into<String>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            languages: DashMap::new(),
            default_language: default_language.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn validate(&self, credential: &str) -> AppResult<String> {
        let token = credential.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AppError::Unauthenticated("missing bearer credential".to_string()));
        }

        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AppError::Unauthenticated(format!("invalid credential: {}", e)))?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AppError::Unauthenticated("credential has no subject".to_string()));
        }
        if let Some(language) = claims.language.filter(|l| !l.trim().is_empty()) {
            self.languages.insert(claims.sub.clone(), language);
        }

        debug!(user_id = %claims.sub, "Credential validated");
        Ok(claims.sub)
    }

    async fn profile(&self, user_id: &str) -> AppResult<UserProfile> {
        let language = self
            .languages
            .get(user_id)
            .map(|l| l.clone())
            .unwrap_or_else(|| self.default_language.clone());

        Ok(UserProfile {
            user_id: user_id.to_string(),
            language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, language: Option<&str>, secret: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            language: language.map(str::to_string),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_resolves_user_and_language() {
        let provider = JwtIdentityProvider::new(SECRET, "en");
        let user = provider
            .validate(&format!("Bearer {}", token("user-7", Some("hi"), SECRET)))
            .await
            .unwrap();
        assert_eq!(user, "user-7");

        let profile = provider.profile("user-7").await.unwrap();
        assert_eq!(profile.language, "hi");
    }

    #[tokio::test]
    async fn test_unknown_profile_uses_default_language() {
        let provider = JwtIdentityProvider::new(SECRET, "en");
        provider.validate(&token("user-8", None, SECRET)).await.unwrap();
        assert_eq!(provider.profile("user-8").await.unwrap().language, "en");
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let provider = JwtIdentityProvider::new(SECRET, "en");
        for credential in ["", "Bearer ", "not-a-jwt"] {
            let err = provider.validate(credential).await.unwrap_err();
            assert!(matches!(err, AppError::Unauthenticated(_)));
        }

        let forged = token("user-9", None, "other-secret");
        let err = provider.validate(&forged).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }
}
