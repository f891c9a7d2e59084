//! JWT bearer verification.

use std::str::FromStr;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::policy::types::JwtKey;
use crate::policy::PolicyError;

/// Verify `token` against `key` and return its claims.
///
/// The token's header must declare exactly the key's algorithm. `exp` and
/// `nbf` are checked when present.
pub fn verify(token: &str, key: &JwtKey) -> Result<Value, PolicyError> {
    let algorithm = Algorithm::from_str(&key.alg)
        .map_err(|_| PolicyError::UnknownAlgorithm(key.alg.clone()))?;
    let decoding_key = decoding_key(algorithm, key)?;

    let mut validation = Validation::new(algorithm);
    validation.algorithms = vec![algorithm];
    validation.required_spec_claims.clear();
    validation.validate_aud = false;
    validation.validate_nbf = true;

    let data = decode::<Value>(token, &decoding_key, &validation)?;
    Ok(data.claims)
}

fn decoding_key(algorithm: Algorithm, key: &JwtKey) -> Result<DecodingKey, PolicyError> {
    use Algorithm::*;

    let pem = || {
        key.public_key
            .as_deref()
            .map(str::as_bytes)
            .ok_or(PolicyError::MissingKey)
    };
    let decoding_key = match algorithm {
        HS256 | HS384 | HS512 => {
            let secret = key.secret.as_deref().ok_or(PolicyError::MissingKey)?;
            DecodingKey::from_secret(secret.as_bytes())
        }
        RS256 | RS384 | RS512 | PS256 | PS384 | PS512 => DecodingKey::from_rsa_pem(pem()?)?,
        ES256 | ES384 => DecodingKey::from_ec_pem(pem()?)?,
        EdDSA => DecodingKey::from_ed_pem(pem()?)?,
    };
    Ok(decoding_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn hs256_key(secret: &str) -> JwtKey {
        JwtKey {
            alg: "HS256".into(),
            secret: Some(secret.into()),
            public_key: None,
        }
    }

    fn sign(alg: Algorithm, secret: &str, claims: &Value) -> String {
        encode(&Header::new(alg), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let token = sign(Algorithm::HS256, "s3cret", &json!({"sub": "peer-a"}));
        let claims = verify(&token, &hs256_key("s3cret")).unwrap();
        assert_eq!(claims["sub"], "peer-a");
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = sign(Algorithm::HS256, "other", &json!({"sub": "x"}));
        assert!(matches!(verify(&token, &hs256_key("s3cret")), Err(PolicyError::Jwt(_))));
    }

    #[test]
    fn rejects_algorithm_mismatch() {
        let token = sign(Algorithm::HS384, "s3cret", &json!({"sub": "x"}));
        assert!(verify(&token, &hs256_key("s3cret")).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let token = sign(Algorithm::HS256, "s3cret", &json!({"sub": "x", "exp": 1_000}));
        assert!(verify(&token, &hs256_key("s3cret")).is_err());
    }

    #[test]
    fn missing_key_material() {
        let key = JwtKey { alg: "RS256".into(), secret: None, public_key: None };
        assert!(matches!(verify("a.b.c", &key), Err(PolicyError::MissingKey)));
    }
}
