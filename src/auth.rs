use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user identifier the token was issued for.
    pub sub: String,
    pub exp: i64,
}

/// HS256 token issue/verify. The core never looks users up; it only decides
/// whether an asserted `(connection, user)` binding is trusted.
pub struct SecurityService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl SecurityService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn issue(&self, user_id: &str) -> AppResult<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AppError::Internal)
    }

    pub fn verify(&self, token: &str) -> AppResult<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_and_carries_subject() {
        let svc = SecurityService::new("unit-test-secret");
        let token = svc.issue("alice").unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn garbage_token_is_unauthorized() {
        let svc = SecurityService::new("unit-test-secret");
        assert!(matches!(
            svc.verify("not.a.token"),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let issuer = SecurityService::new("secret-a");
        let verifier = SecurityService::new("secret-b");
        let token = issuer.issue("alice").unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = SecurityService::new("unit-test-secret");
        let claims = Claims {
            sub: "alice".into(),
            // Past the default validation leeway.
            exp: Utc::now().timestamp() - 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"unit-test-secret"),
        )
        .unwrap();
        assert!(matches!(svc.verify(&token), Err(AppError::Unauthorized)));
    }
}
