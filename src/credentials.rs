use async_trait::async_trait;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.githubcopilot.com";

/// Source of the bearer token and upstream base URL for outgoing requests.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;

    async fn upstream_base_url(&self) -> Option<String>;
}

/// Credentials fixed at startup, typically from the environment.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
    base_url: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>, base_url: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
            base_url: base_url.filter(|u| !u.trim().is_empty()),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn upstream_base_url(&self) -> Option<String> {
        self.base_url.clone()
    }
}

pub async fn resolve_base_url(provider: &dyn CredentialProvider) -> String {
    match provider.upstream_base_url().await {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => DEFAULT_UPSTREAM_BASE_URL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blank_values_count_as_missing() {
        let creds = StaticCredentials::new(Some("  ".to_string()), Some(String::new()));
        assert!(creds.access_token().await.is_none());
        assert_eq!(resolve_base_url(&creds).await, DEFAULT_UPSTREAM_BASE_URL);
    }

    #[tokio::test]
    async fn base_url_override_is_normalized() {
        let creds = StaticCredentials::new(
            Some("tok".to_string()),
            Some("https://proxy.example.com/".to_string()),
        );
        assert_eq!(creds.access_token().await.as_deref(), Some("tok"));
        assert_eq!(resolve_base_url(&creds).await, "https://proxy.example.com");
    }
}
