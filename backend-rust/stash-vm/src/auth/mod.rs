use actix_web::error::{ErrorInternalServerError, ErrorUnauthorized};
use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use chrono::{Duration, Utc};
use futures_util::future::{ready, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const BCRYPT_COST: u32 = 10;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("Invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Authorization header is not a bearer token")]
    NotBearer,
}

/// JWT payload. `sub` is the user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Password hashing and session tokens.
pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(jwt_secret: &str, token_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            token_ttl,
        }
    }

    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        Ok(bcrypt::hash(password, BCRYPT_COST)?)
    }

    /// A malformed stored hash counts as a mismatch.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    pub fn issue_token(&self, user_id: &str) -> Result<String, AuthError> {
        let issued_at = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (issued_at + self.token_ttl).timestamp(),
            iat: issued_at.timestamp(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }

    /// Resolve the user id carried by an `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<String, AuthError> {
        let token = header
            .ok_or(AuthError::MissingHeader)?
            .strip_prefix("Bearer ")
            .ok_or(AuthError::NotBearer)?;
        Ok(self.validate_token(token.trim())?.sub)
    }
}

/// The caller of a request, taken from its `Authorization: Bearer <jwt>` header.
///
/// The token only proves who the caller was when it was issued; handlers
/// still get `NotFound` from the store once the account has been purged.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

impl AuthUser {
    fn extract(req: &HttpRequest) -> Result<Self, Error> {
        let auth_service = req
            .app_data::<web::Data<Arc<AuthService>>>()
            .ok_or_else(|| ErrorInternalServerError("Auth service not configured"))?;

        let header = req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok());

        match auth_service.authenticate(header) {
            Ok(user_id) => Ok(AuthUser { user_id }),
            Err(e) => {
                log::debug!("Rejected request to {}: {}", req.path(), e);
                Err(ErrorUnauthorized(e.to_string()))
            }
        }
    }
}

impl FromRequest for AuthUser {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Self::extract(req))
    }
}
