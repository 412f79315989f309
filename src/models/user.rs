use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The authenticated caller, resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub role: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

/// Hash a bearer token the way `personal_access_tokens.token` stores it.
///
/// Tokens may arrive as `<id>|<secret>`; only the secret part is hashed.
pub fn hash_token(bearer: &str) -> String {
    let secret = bearer.split_once('|').map_or(bearer, |(_, s)| s);
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_ignores_id_prefix() {
        assert_eq!(hash_token("42|s3cret"), hash_token("s3cret"));
        assert_eq!(hash_token("s3cret").len(), 64);
    }

    #[test]
    fn test_hash_token_known_digest() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_admin_role() {
        let mut u = User {
            id: 1,
            name: "Root".into(),
            username: "root".into(),
            email: "root@example.com".into(),
            role: "admin".into(),
        };
        assert!(u.is_admin());
        u.role = "user".into();
        assert!(!u.is_admin());
    }
}
