use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::{Deserialize, Serialize};

/// JWT claims carried by API bearer tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (token holder)
    pub exp: usize,  // Expiration time
    pub iat: usize,  // Issued at
}

/// Auth config managed as Rocket state.
#[derive(Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// Request guard: every `/api/*` route takes an `ApiUser` parameter, which
/// rejects requests without a valid bearer token before the handler runs.
#[derive(Debug)]
pub struct ApiUser {
    pub subject: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiUser {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        // Get the auth config from Rocket state
        let auth_config = match request.rocket().state::<AuthConfig>() {
            Some(cfg) => cfg,
            None => return Outcome::Error((Status::Unauthorized, ())),
        };

        // Extract the token from the Authorization header
        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|value| value.strip_prefix("Bearer ").map(|t| t.to_string()));

        match token {
            Some(token) => {
                match decode::<Claims>(
                    &token,
                    &DecodingKey::from_secret(auth_config.jwt_secret.as_bytes()),
                    &Validation::new(Algorithm::HS256),
                ) {
                    Ok(token_data) => Outcome::Success(ApiUser {
                        subject: token_data.claims.sub,
                    }),
                    Err(_) => Outcome::Error((Status::Unauthorized, ())),
                }
            }
            None => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

/// Mint a bearer token for the given subject. Operators generate tokens
/// out-of-band with the shared secret; this is also what tests use.
pub fn issue_token(secret: &str, subject: &str, expiry_hours: i64) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: subject.to_string(),
        iat: now.timestamp() as usize,
        exp: (now + Duration::hours(expiry_hours)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_validate_with_the_same_secret() {
        let token = issue_token("s3cret", "ops", 1).unwrap();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"s3cret"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, "ops");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token("s3cret", "ops", 1).unwrap();
        assert!(decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"other"),
            &Validation::new(Algorithm::HS256),
        )
        .is_err());
    }
}
