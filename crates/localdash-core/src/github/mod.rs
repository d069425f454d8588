//! GitHub REST client supplying the server side of repository reconciliation.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::models::Repository;
use crate::util::{compact_text, is_http_url, normalize_text_option};

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

const PAGE_SIZE: usize = 100;
const MAX_PAGES: u32 = 50;
const HTTP_TIMEOUT_SECS: u64 = 15;
const USER_AGENT: &str = concat!("localdash/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("Invalid GitHub client configuration: {0}")]
    InvalidConfiguration(String),
    #[error("GitHub HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub API error: {0}")]
    Api(String),
}

pub type GithubResult<T> = Result<T, GithubError>;

#[derive(Clone)]
pub struct GithubClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("GithubClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    /// `token` is optional; anonymous requests are rate limited harder.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> GithubResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            base_url,
            token: normalize_text_option(token),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Every public repository of `user`, following pagination
    pub async fn fetch_user_repositories(&self, user: &str) -> GithubResult<Vec<Repository>> {
        let user = user.trim();
        if user.is_empty() {
            return Err(GithubError::InvalidConfiguration(
                "user name must not be empty".to_string(),
            ));
        }

        let mut repositories = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch = self.fetch_page(user, page).await?;
            let done = batch.len() < PAGE_SIZE;
            repositories.extend(batch);
            if done {
                break;
            }
        }

        tracing::debug!("Fetched {} repositories for {user}", repositories.len());
        Ok(repositories)
    }

    async fn fetch_page(&self, user: &str, page: u32) -> GithubResult<Vec<Repository>> {
        let url = format!(
            "{}/users/{}/repos?per_page={PAGE_SIZE}&page={page}",
            self.base_url,
            urlencoding::encode(user)
        );

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::Api(parse_api_error(status, &body)));
        }

        Ok(response.json::<Vec<Repository>>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(ApiErrorBody {
        message: Some(message),
    }) = serde_json::from_str::<ApiErrorBody>(body)
    {
        return format!("{} ({})", message.trim(), status.as_u16());
    }

    let compact = compact_text(body);
    if compact.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{compact} ({})", status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> GithubResult<String> {
    let base_url = normalize_text_option(Some(raw)).ok_or_else(|| {
        GithubError::InvalidConfiguration("API base URL must not be empty".to_string())
    })?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(GithubError::InvalidConfiguration(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.github.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://ghe.example.com/api/v3/ ".to_string()).unwrap(),
            "https://ghe.example.com/api/v3"
        );
    }

    #[test]
    fn parse_api_error_prefers_message() {
        let body = r#"{"message":"API rate limit exceeded","documentation_url":"https://docs.github.com"}"#;
        assert_eq!(
            parse_api_error(StatusCode::FORBIDDEN, body),
            "API rate limit exceeded (403)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(parse_api_error(StatusCode::NOT_FOUND, "nope"), "nope (404)");
    }

    #[test]
    fn client_debug_redacts_token() {
        let client = GithubClient::new(DEFAULT_API_BASE_URL, Some("ghp_secret".to_string())).unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("ghp_secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn blank_token_is_anonymous() {
        let client = GithubClient::new(DEFAULT_API_BASE_URL, Some("  ".to_string())).unwrap();
        assert!(client.token.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_user_is_rejected_before_request() {
        let client = GithubClient::new(DEFAULT_API_BASE_URL, None).unwrap();
        assert!(matches!(
            client.fetch_user_repositories(" ").await,
            Err(GithubError::InvalidConfiguration(_))
        ));
    }
}
