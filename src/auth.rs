//! Local users and login sessions.
//!
//! These accounts gate access to the feeds; they are unrelated to AO3
//! credentials, which live in [`crate::credentials`].

use crate::db::{Database, LoginSession, User, now_timestamp};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

const MIN_PASSWORD_LEN: usize = 4;
const BAD_LOGIN: &str = "Invalid username or password";

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a URL-safe random token (login sessions, share keys).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 64 {
        return Err(AppError::InvalidInput(
            "Username must be 1-64 characters".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::InvalidInput(
            "Username can only contain letters, numbers, _ and -".to_string(),
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Local authentication service.
#[derive(Clone)]
pub struct AuthService {
    db: Database,
    session_duration_days: u32,
    registration_enabled: bool,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(db: Database, session_duration_days: u32, registration_enabled: bool) -> Self {
        Self {
            db,
            session_duration_days,
            registration_enabled,
        }
    }

    /// Self-service registration.
    pub fn register(&self, username: &str, password: &str) -> Result<User> {
        if !self.registration_enabled {
            return Err(AppError::Forbidden("Registration is disabled".to_string()));
        }
        self.create_user(username, password, "user")
    }

    /// Create a user with the given role.
    pub fn create_user(&self, username: &str, password: &str, role: &str) -> Result<User> {
        validate_username(username)?;
        validate_password(password)?;
        if role != "admin" && role != "user" {
            return Err(AppError::InvalidInput(
                "Role must be 'admin' or 'user'".to_string(),
            ));
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash_password(password)?,
            display_name: None,
            role: role.to_string(),
            created_at: now_timestamp(),
            last_login: None,
        };

        self.db.create_user(&user)?;
        tracing::info!(username, role, "Created user");
        Ok(user)
    }

    /// Check a username and password without opening a session.
    ///
    /// E-readers that cannot keep a bearer token pass credentials on every
    /// feed request.
    pub fn verify_credentials(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .db
            .get_user_by_username(username)?
            .ok_or_else(|| AppError::Unauthorized(BAD_LOGIN.to_string()))?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthorized(BAD_LOGIN.to_string()));
        }
        Ok(user)
    }

    /// Login and create a session.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        device_id: Option<String>,
    ) -> Result<(User, String)> {
        let user = self.verify_credentials(username, password)?;
        self.db.update_user_last_login(&user.id)?;

        let session = LoginSession {
            token: generate_token(),
            user_id: user.id.clone(),
            device_id,
            expires_at: now_timestamp() + i64::from(self.session_duration_days) * 24 * 60 * 60,
        };
        self.db.create_session(&session)?;

        Ok((user, session.token))
    }

    /// Validate a session token and return the user.
    pub fn validate_token(&self, token: &str) -> Result<Option<User>> {
        let Some(session) = self.db.get_session(token)? else {
            return Ok(None);
        };

        if session.expires_at < now_timestamp() {
            self.db.delete_session(token)?;
            return Ok(None);
        }

        self.db.get_user_by_id(&session.user_id)
    }

    /// Logout (delete session).
    pub fn logout(&self, token: &str) -> Result<()> {
        self.db.delete_session(token)
    }

    /// Change user password.
    pub fn change_password(&self, username: &str, new_password: &str) -> Result<bool> {
        validate_password(new_password)?;
        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(username, &password_hash)
    }

    /// Delete a user together with their AO3 account and feeds.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        self.db.delete_user(username)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_and_verify() {
        let password = "test_password_123";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let token1 = generate_token();
        let token2 = generate_token();

        assert_eq!(token1.len(), 43); // Base64 of 32 bytes
        assert_ne!(token1, token2);
        assert!(
            token1
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("reader_01").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(65)).is_err());
    }
}
