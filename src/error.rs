//! Error kinds shared by the providers and the orchestration layer.

/// Failure reported by a capability provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network failure, rate limit, server hiccup. Worth retrying.
    #[error("{provider}: transient failure: {message}")]
    Transient { provider: String, message: String },

    /// The provider answered but the payload could not be understood.
    #[error("{provider}: malformed response: {message}")]
    Malformed { provider: String, message: String },

    /// Bad request, rejected credentials and the like. Retrying will not help.
    #[error("{provider}: {message}")]
    Permanent { provider: String, message: String },

    /// No provider of this capability is configured.
    #[error("no {0} provider configured")]
    NotConfigured(&'static str),
}

impl ProviderError {
    pub fn transient(provider: &str, message: impl ToString) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn malformed(provider: &str, message: impl ToString) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn permanent(provider: &str, message: impl ToString) -> Self {
        Self::Permanent {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    /// Classifies a transport-level `reqwest` failure.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::malformed(provider, err)
        } else if err.is_builder() {
            Self::permanent(provider, err)
        } else {
            Self::transient(provider, err)
        }
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Self::transient(provider, message)
        } else {
            Self::permanent(provider, message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Errors raised to callers of the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum ChatbotError {
    #[error("chatbot not found: {0}")]
    ChatbotNotFound(String),

    #[error("history not found: {0}")]
    HistoryNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),
}

pub type Result<T> = std::result::Result<T, ChatbotError>;
