//! Sign-in input validation and login payload construction.

use std::fmt;

use serde::Serialize;

use crate::api::AuthError;

/// Values front-ends are known to submit in place of a missing field.
const PLACEHOLDER_VALUES: [&str; 5] = ["none_provided", "null", "undefined", "none", "empty"];

/// Minimum login id length after trimming.
const MIN_LOGIN_ID_LENGTH: usize = 4;

/// True for blank input and for placeholder values such as `"null"`
/// (compared trimmed and case-insensitively).
pub fn is_placeholder(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    normalized.is_empty() || PLACEHOLDER_VALUES.contains(&normalized.as_str())
}

/// `local@domain.tld` shape: one `@`, no whitespace, and a dot inside the domain.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let clean = |s: &str| !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c == '@');
    if !clean(local) || !clean(domain) {
        return false;
    }
    let last = domain.len() - 1;
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i < last)
}

pub fn is_valid_login_id(login_id: &str) -> bool {
    login_id.trim().chars().count() >= MIN_LOGIN_ID_LENGTH
}

/// Body for `POST /api/public/login`. The field is chosen by whether the
/// identifier contains `@`.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LoginPayload {
    Email {
        email: String,
        password: String,
    },
    LoginId {
        #[serde(rename = "loginId")]
        login_id: String,
        password: String,
    },
}

impl LoginPayload {
    pub fn new(identifier: &str, password: &str) -> Result<Self, AuthError> {
        if is_placeholder(identifier) {
            return Err(AuthError::InvalidInput(
                "Please enter an email or login id".to_string(),
            ));
        }
        if is_placeholder(password) {
            return Err(AuthError::InvalidInput("Please enter a password".to_string()));
        }

        let identifier = identifier.trim();
        if identifier.contains('@') {
            if !is_valid_email(identifier) {
                return Err(AuthError::InvalidInput(
                    "Please enter a valid email address".to_string(),
                ));
            }
            Ok(LoginPayload::Email {
                email: identifier.to_string(),
                password: password.to_string(),
            })
        } else {
            if !is_valid_login_id(identifier) {
                return Err(AuthError::InvalidInput(format!(
                    "Login id must be at least {} characters",
                    MIN_LOGIN_ID_LENGTH
                )));
            }
            Ok(LoginPayload::LoginId {
                login_id: identifier.to_string(),
                password: password.to_string(),
            })
        }
    }

    /// JSON field name carrying the identifier.
    pub fn field_name(&self) -> &'static str {
        match self {
            LoginPayload::Email { .. } => "email",
            LoginPayload::LoginId { .. } => "loginId",
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            LoginPayload::Email { email, .. } => email,
            LoginPayload::LoginId { login_id, .. } => login_id,
        }
    }
}

impl fmt::Debug for LoginPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginPayload")
            .field(self.field_name(), &self.identifier())
            .field("password", &"<redacted>")
            .finish()
    }
}
