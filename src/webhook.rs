//! Push event payload parsing

use serde_json::Value;

/// Reasons a delivery body cannot be turned into a [`WebhookEvent`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("payload has no repository.name")]
    MissingRepository,

    #[error("repository name {0:?} is not a plain directory name")]
    InvalidRepository(String),
}

/// A push event, reduced to what the deployment pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub repository_name: String,
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    pub modified_files: Vec<String>,
}

impl WebhookEvent {
    /// False when the delivery carried no commits at all.
    pub fn has_commits(&self) -> bool {
        !self.commits.is_empty()
    }

    /// Every modified file, commit by commit, in payload order.
    pub fn modified_files(&self) -> impl Iterator<Item = &str> {
        self.commits
            .iter()
            .flat_map(|commit| commit.modified_files.iter().map(String::as_str))
    }
}

/// Parse a push delivery body.
///
/// Only `repository.name` is required. A missing or non-array `commits` is an
/// empty event, and a commit without a usable `modified` list contributes no
/// files instead of failing the whole delivery.
pub fn parse_payload(body: &[u8]) -> Result<WebhookEvent, ParseError> {
    let payload: Value = serde_json::from_slice(body)?;

    let repository_name = payload
        .get("repository")
        .and_then(|r| r.get("name"))
        .and_then(|n| n.as_str())
        .ok_or(ParseError::MissingRepository)?;

    // The name becomes a path segment under local_path
    if repository_name.is_empty()
        || repository_name == "."
        || repository_name == ".."
        || repository_name.contains(['/', '\\'])
    {
        return Err(ParseError::InvalidRepository(repository_name.to_string()));
    }

    let commits = payload
        .get("commits")
        .and_then(|c| c.as_array())
        .map(|commits| commits.iter().map(parse_commit).collect())
        .unwrap_or_default();

    Ok(WebhookEvent {
        repository_name: repository_name.to_string(),
        commits,
    })
}

fn parse_commit(commit: &Value) -> Commit {
    let modified_files = commit
        .get("modified")
        .and_then(|m| m.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Commit { modified_files }
}
