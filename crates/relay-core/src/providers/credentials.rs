//! Static credentials for chat-completions endpoints

use reqwest::RequestBuilder;

/// How requests authenticate against the model endpoint
#[derive(Clone)]
pub enum Credential {
    /// `api-key: <key>` header (Azure OpenAI key auth)
    ApiKey(String),
    /// `Authorization: Bearer <token>` (OpenAI, Azure AD tokens)
    Bearer(String),
    /// No authentication (local OpenAI-compatible servers)
    None,
}

impl Credential {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => request.header("api-key", key),
            Self::Bearer(token) => request.header("Authorization", format!("Bearer {}", token)),
            Self::None => request,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(key) => write!(f, "ApiKey({})", mask_secret(key)),
            Self::Bearer(token) => write!(f, "Bearer({})", mask_secret(token)),
            Self::None => write!(f, "None"),
        }
    }
}

/// Mask a secret for display, keeping a short prefix and suffix
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_masks_key() {
        let cred = Credential::ApiKey("sk-1234567890abcdef".to_string());
        let debug = format!("{:?}", cred);
        assert!(debug.contains("sk-...cdef"));
        assert!(!debug.contains("sk-1234567890abcdef"));
    }

    #[test]
    fn test_mask_short_and_empty() {
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret(""), "(empty)");
    }
}
