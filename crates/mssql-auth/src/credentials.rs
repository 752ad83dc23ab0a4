//! Login credentials.

use std::borrow::Cow;

use tds_protocol::Login7;

use crate::error::AuthError;

/// Longest user name or password LOGIN7 accepts, in characters.
const MAX_FIELD_CHARS: usize = 128;

/// Credentials presented at login.
#[derive(Clone)]
#[non_exhaustive]
pub enum Credentials {
    /// SQL Server authentication with username and password.
    SqlServer {
        /// Username.
        username: Cow<'static, str>,
        /// Password.
        password: Cow<'static, str>,
    },
}

impl Credentials {
    /// Create SQL Server credentials.
    pub fn sql_server(
        username: impl Into<Cow<'static, str>>,
        password: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check if these credentials use SQL authentication.
    #[must_use]
    pub fn is_sql_auth(&self) -> bool {
        matches!(self, Self::SqlServer { .. })
    }

    /// Get the authentication method name.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::SqlServer { .. } => "SQL Server Authentication",
        }
    }

    /// Write these credentials into a LOGIN7 message.
    pub fn apply(&self, login: Login7) -> Result<Login7, AuthError> {
        match self {
            Self::SqlServer { username, password } => {
                if username.is_empty() {
                    return Err(AuthError::InvalidCredentials("username is empty".into()));
                }
                if username.chars().count() > MAX_FIELD_CHARS {
                    return Err(AuthError::InvalidCredentials(format!(
                        "username exceeds {MAX_FIELD_CHARS} characters"
                    )));
                }
                if password.chars().count() > MAX_FIELD_CHARS {
                    return Err(AuthError::InvalidCredentials(format!(
                        "password exceeds {MAX_FIELD_CHARS} characters"
                    )));
                }
                Ok(login.with_sql_auth(username.as_ref(), password.as_ref()))
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::sql_server("sa", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("sa"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_apply_validates() {
        assert!(Credentials::sql_server("sa", "pw").apply(Login7::new()).is_ok());
        assert!(matches!(
            Credentials::sql_server("", "pw").apply(Login7::new()),
            Err(AuthError::InvalidCredentials(_))
        ));
        let long = "x".repeat(129);
        assert!(Credentials::sql_server(long, "pw").apply(Login7::new()).is_err());
    }

    #[test]
    fn test_method_name() {
        let creds = Credentials::sql_server("sa", "pw");
        assert!(creds.is_sql_auth());
        assert_eq!(creds.method_name(), "SQL Server Authentication");
    }
}
