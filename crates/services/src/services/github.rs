use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use autodev_db::models::pull_request::PullRequestState;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Repository provider error: {0}")]
    Api(String),
    #[error("Cannot parse repository from '{0}'")]
    InvalidRepo(String),
    #[error("No repository provider token configured")]
    MissingToken,
}

impl From<octocrab::Error> for ProviderError {
    fn from(err: octocrab::Error) -> Self {
        ProviderError::Api(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: i64,
    pub url: String,
    pub state: PullRequestState,
    pub merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreatePrRequest {
    /// `owner/name` or any github URL form accepted by [`parse_repository`].
    pub repository: String,
    pub title: String,
    pub body: Option<String>,
    pub head_branch: String,
    pub base_branch: String,
}

/// The narrow capability the engine needs from the hosted-repository
/// provider. Production uses [`GithubService`]; tests script a fake.
#[async_trait]
pub trait RepoProvider: Send + Sync + 'static {
    /// Non-idempotent: one attempt, no retry.
    async fn create_pull_request(&self, req: &CreatePrRequest) -> Result<PrInfo, ProviderError>;

    /// Idempotent read, retried with exponential backoff by implementations.
    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> Result<PrInfo, ProviderError>;
}

/// Extract `(owner, name)` from `owner/name`, an https clone URL, or an ssh
/// clone URL.
pub fn parse_repository(input: &str) -> Result<(String, String), ProviderError> {
    let trimmed = input
        .trim()
        .trim_end_matches('/')
        .trim_end_matches(".git");

    let tail = if let Some(rest) = trimmed.strip_prefix("git@") {
        // git@github.com:owner/name
        rest.split_once(':').map(|(_, t)| t)
    } else if let Some(idx) = trimmed.find("://") {
        // https://github.com/owner/name
        let after = &trimmed[idx + 3..];
        after.split_once('/').map(|(_, t)| t)
    } else {
        Some(trimmed)
    };

    let tail = tail.ok_or_else(|| ProviderError::InvalidRepo(input.to_string()))?;
    let mut parts = tail.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => Ok((owner.to_string(), name.to_string())),
        _ => Err(ProviderError::InvalidRepo(input.to_string())),
    }
}

/// GitHub-backed provider via octocrab.
pub struct GithubService {
    client: Octocrab,
}

impl GithubService {
    pub fn new(token: &str, base_url: Option<&str>) -> Result<Self, ProviderError> {
        let mut builder = Octocrab::builder().personal_token(token.to_string());
        if let Some(base) = base_url {
            builder = builder.base_uri(base)?;
        }
        let client = builder.build()?;
        Ok(Self { client })
    }

    fn read_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_factor(2.0)
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(5)
    }

    fn to_pr_info(pr: &octocrab::models::pulls::PullRequest) -> PrInfo {
        let state = if pr.merged_at.is_some() {
            PullRequestState::Merged
        } else {
            match pr.state {
                Some(octocrab::models::IssueState::Open) => PullRequestState::Open,
                _ => PullRequestState::Closed,
            }
        };
        PrInfo {
            number: pr.number as i64,
            url: pr
                .html_url
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_default(),
            state,
            merged_at: pr.merged_at,
        }
    }
}

#[async_trait]
impl RepoProvider for GithubService {
    async fn create_pull_request(&self, req: &CreatePrRequest) -> Result<PrInfo, ProviderError> {
        let (owner, name) = parse_repository(&req.repository)?;
        let pulls_handler = self.client.pulls(&owner, &name);
        let mut create =
            pulls_handler.create(&req.title, &req.head_branch, &req.base_branch);
        if let Some(body) = &req.body {
            create = create.body(body);
        }
        let pr = create.send().await?;
        tracing::info!(
            "opened PR #{} on {owner}/{name} ({} -> {})",
            pr.number,
            req.head_branch,
            req.base_branch
        );
        Ok(Self::to_pr_info(&pr))
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> Result<PrInfo, ProviderError> {
        let (owner, name) = parse_repository(repository)?;
        let pr = (|| async {
            self.client
                .pulls(&owner, &name)
                .get(number as u64)
                .await
        })
        .retry(Self::read_backoff())
        .when(|e: &octocrab::Error| !matches!(e, octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404))
        .await?;
        Ok(Self::to_pr_info(&pr))
    }
}

/// Provider used when no token is configured: every call fails fast with
/// `MissingToken` so executions report a clear dependency error instead of
/// a mystery 401.
pub struct DisabledProvider;

#[async_trait]
impl RepoProvider for DisabledProvider {
    async fn create_pull_request(&self, _req: &CreatePrRequest) -> Result<PrInfo, ProviderError> {
        Err(ProviderError::MissingToken)
    }

    async fn get_pull_request(
        &self,
        _repository: &str,
        _number: i64,
    ) -> Result<PrInfo, ProviderError> {
        Err(ProviderError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn repository_forms_all_parse() {
        let cases = [
            "acme/demo",
            "https://github.com/acme/demo",
            "https://github.com/acme/demo.git",
            "git@github.com:acme/demo.git",
        ];
        for case in cases {
            let (owner, name) = parse_repository(case).unwrap();
            assert_eq!((owner.as_str(), name.as_str()), ("acme", "demo"), "{case}");
        }
    }

    #[test]
    fn garbage_repository_is_rejected() {
        assert!(parse_repository("").is_err());
        assert!(parse_repository("just-a-name").is_err());
        assert!(parse_repository("https://github.com/acme").is_err());
        assert!(parse_repository("a/b/c").is_err());
    }
}
