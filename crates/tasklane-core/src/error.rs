use serde_json::Value;
use thiserror::Error;

/// Every transport or HTTP failure the API client can report.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Network error or invalid URL: {message}")]
    Network { message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("{message}")]
    Http {
        status: u16,
        message: String,
        code: Option<String>,
        body: Option<Value>,
    },

    #[error("failed to encode request: {message}")]
    Encode { message: String },

    #[error("failed to decode response (HTTP {status}): {message}")]
    Decode { status: u16, message: String },
}

impl ApiError {
    /// HTTP status, or 0 when no response was received.
    pub fn status(&self) -> u16 {
        match self {
            Self::Network { .. } | Self::Cancelled | Self::Encode { .. } => 0,
            Self::Http { status, .. } | Self::Decode { status, .. } => *status,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Http { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::Http { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), 401 | 403)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Which auth call failed; picks the friendly wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Login,
    Register,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Too many {} attempts. Please try again later.", attempt_noun(.0))]
    RateLimited(AuthAction),

    #[error("A user with this email already exists")]
    AlreadyExists,

    #[error("{} failed - no token returned", action_label(.0))]
    MissingToken(AuthAction),

    #[error("signed in, but the current user could not be loaded")]
    IdentityUnavailable,

    #[error("{0}")]
    Other(String),
}

impl AuthError {
    /// Classifies a failed login/register call. Structured error codes win,
    /// then the HTTP status, and message text only as a last resort.
    pub fn classify(action: AuthAction, err: &ApiError) -> Self {
        if let Some(kind) = err.code().and_then(|code| from_code(action, code)) {
            return kind;
        }

        match err.status() {
            401 | 403 => return Self::InvalidCredentials,
            409 => return Self::AlreadyExists,
            429 => return Self::RateLimited(action),
            _ => {}
        }

        let message = err.message();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("too many requests") {
            Self::RateLimited(action)
        } else if action == AuthAction::Register && lowered.contains("already") {
            Self::AlreadyExists
        } else if action == AuthAction::Login && lowered.contains("invalid") {
            Self::InvalidCredentials
        } else if message.trim().is_empty() {
            Self::Other(format!("{} failed", action_label(&action)))
        } else {
            Self::Other(message)
        }
    }
}

fn from_code(action: AuthAction, code: &str) -> Option<AuthError> {
    match code.to_ascii_lowercase().as_str() {
        "invalid_credentials" | "unauthorized" => Some(AuthError::InvalidCredentials),
        "rate_limited" | "too_many_requests" => Some(AuthError::RateLimited(action)),
        "user_exists" | "already_exists" | "email_taken" => Some(AuthError::AlreadyExists),
        _ => None,
    }
}

fn action_label(action: &AuthAction) -> &'static str {
    match action {
        AuthAction::Login => "Login",
        AuthAction::Register => "Registration",
    }
}

fn attempt_noun(action: &AuthAction) -> &'static str {
    match action {
        AuthAction::Login => "login",
        AuthAction::Register => "registration",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ApiError, AuthAction, AuthError};

    fn http(status: u16, message: &str, code: Option<&str>) -> ApiError {
        ApiError::Http {
            status,
            message: message.to_string(),
            code: code.map(str::to_string),
            body: Some(json!({ "message": message })),
        }
    }

    #[test]
    fn network_and_cancelled_report_status_zero() {
        let network = ApiError::Network {
            message: "connection refused".to_string(),
        };
        assert_eq!(network.status(), 0);
        assert_eq!(ApiError::Cancelled.status(), 0);
        assert_eq!(http(404, "missing", None).status(), 404);
    }

    #[test]
    fn classify_prefers_structured_code_over_status() {
        let err = http(400, "nope", Some("rate_limited"));
        assert_eq!(
            AuthError::classify(AuthAction::Login, &err),
            AuthError::RateLimited(AuthAction::Login)
        );
    }

    #[test]
    fn classify_uses_status_before_message() {
        let err = http(401, "Bad things happened", None);
        assert_eq!(
            AuthError::classify(AuthAction::Login, &err),
            AuthError::InvalidCredentials
        );

        let err = http(429, "slow down", None);
        assert_eq!(
            AuthError::classify(AuthAction::Register, &err).to_string(),
            "Too many registration attempts. Please try again later."
        );
    }

    #[test]
    fn classify_falls_back_to_message_then_raw_text() {
        let err = http(400, "User already registered", None);
        assert_eq!(
            AuthError::classify(AuthAction::Register, &err),
            AuthError::AlreadyExists
        );

        let err = http(500, "database offline", None);
        assert_eq!(
            AuthError::classify(AuthAction::Login, &err),
            AuthError::Other("database offline".to_string())
        );
    }

    #[test]
    fn missing_token_message_names_the_action() {
        assert_eq!(
            AuthError::MissingToken(AuthAction::Login).to_string(),
            "Login failed - no token returned"
        );
        assert_eq!(
            AuthError::MissingToken(AuthAction::Register).to_string(),
            "Registration failed - no token returned"
        );
    }
}
