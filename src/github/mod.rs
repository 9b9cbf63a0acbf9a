//! Mirroring a GitHub project's issue tracker into local storage, and
//! posting changes back.
//!
//! The mirror stores these key schemas in the database:
//!
//! ```text
//! ("ProjectSync", project)             → JSON of ProjectSync
//! ("Event", project, issue, api, id)   → (modtime, raw JSON)
//! ("EventByTime", modtime, project, issue, api, id) → ()
//! ```
//!
//! To reconstruct the history of one issue, scan from
//! `("Event", project, issue)` to `("Event", project, issue, Inf)`.
//! The API element is `"/issues"`, `"/issues/comments"`, or
//! `"/issues/events"`, so the first pair for an issue is its creation
//! event carrying the issue body. IDs are GitHub's and are ordered by
//! time within one API, so comments are time-ordered and events are
//! time-ordered, but not with respect to each other.
//!
//! Values hold the raw JSON served by GitHub. Keeping the raw bytes
//! means a new field of interest never forces a re-download.
//!
//! `EventByTime` indexes events by the time they entered the local
//! database, which is what downstream consumers (the comment rewriter,
//! the related-issues poster) watch to learn about new activity.
//!
//! All functionality hangs off [`Client`]: synchronization in
//! [`sync`](Client::sync) (see `sync.rs`), the read side and typed
//! event data in `data.rs`, and edit operations plus the testing
//! divert below and in `testing.rs`.

pub mod data;
pub mod sync;
pub mod testing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Result};
use serde::Serialize;

use crate::secret::SecretDB;
use crate::storage::DB;

pub use data::{Event, Issue, IssueComment, IssueEvent, Typed};
pub use testing::{TestingClient, TestingEdit};

const API_BASE: &str = "https://api.github.com/repos/";

/// A connection to GitHub state in a database and on GitHub itself.
///
/// The secret database is expected to hold a secret named
/// `"api.github.com"` of the form `user:token`, where the user part is
/// ignored by GitHub and the token is an API token. Without it,
/// requests are made unauthenticated.
pub struct Client {
    pub(crate) db: Arc<dyn DB>,
    secret: Arc<dyn SecretDB>,
    http: reqwest::Client,
    testing: AtomicBool,
    pub(crate) test_state: Mutex<TestState>,
}

#[derive(Default)]
pub(crate) struct TestState {
    pub(crate) edits: Vec<TestingEdit>,
    pub(crate) events: HashMap<String, serde_json::Value>,
    pub(crate) full_sync_stop: bool,
}

/// One fetched page of an array endpoint.
pub(crate) struct Page {
    pub(crate) body: Vec<serde_json::Value>,
    pub(crate) etag: String,
    pub(crate) next: Option<String>,
}

/// Result of a conditional fetch.
pub(crate) enum Fetch {
    Page(Page),
    NotModified,
}

impl Client {
    /// Returns a new client over the given databases and HTTP client.
    pub fn new(db: Arc<dyn DB>, secret: Arc<dyn SecretDB>, http: reqwest::Client) -> Client {
        Client {
            db,
            secret,
            http,
            testing: AtomicBool::new(false),
            test_state: Mutex::new(TestState::default()),
        }
    }

    /// Enables testing mode: edits are diverted into an in-process log
    /// instead of being sent, and stored test events answer reads. See
    /// [`Client::testing`].
    pub fn enable_testing(&self) {
        self.testing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn divert_edits(&self) -> bool {
        self.testing.load(Ordering::SeqCst)
    }

    fn auth(&self) -> (String, String) {
        let auth = self.secret.get("api.github.com").unwrap_or_default();
        match auth.split_once(':') {
            Some((user, pass)) => (user.to_string(), pass.to_string()),
            None => (auth, String::new()),
        }
    }

    /// Fetches `url`, expecting a JSON array body, with rate-limit and
    /// server-error retries. A non-empty `etag` is sent as
    /// `If-None-Match` and a 304 answer becomes [`Fetch::NotModified`].
    pub(crate) async fn get_array(&self, url: &str, etag: &str) -> Result<Fetch> {
        if self.divert_edits() {
            let stored = self.test_state.lock().unwrap().events.get(url).cloned();
            if let Some(json) = stored {
                let body = match json {
                    serde_json::Value::Array(items) => items,
                    other => vec![other],
                };
                return Ok(Fetch::Page(Page {
                    body,
                    etag: String::new(),
                    next: None,
                }));
            }
            // Unregistered URL in a test: an empty feed.
            return Ok(Fetch::Page(Page {
                body: Vec::new(),
                etag: String::new(),
                next: None,
            }));
        }

        let (json, etag, next) = match self.get_raw(url, etag).await? {
            Some(parts) => parts,
            None => return Ok(Fetch::NotModified),
        };
        let serde_json::Value::Array(body) = json else {
            bail!("expected JSON array from {url}");
        };
        Ok(Fetch::Page(Page { body, etag, next }))
    }

    /// Fetches `url` and decodes the body into `T`.
    pub(crate) async fn get_object<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        if self.divert_edits() {
            let stored = self.test_state.lock().unwrap().events.get(url).cloned();
            if let Some(json) = stored {
                return Ok(serde_json::from_value(json)?);
            }
            bail!("no stored test event for {url}");
        }
        let (json, _, _) = self
            .get_raw(url, "")
            .await?
            .ok_or_else(|| anyhow!("unexpected 304 from {url}"))?;
        Ok(serde_json::from_value(json)?)
    }

    /// One GET with the retry policy: rate limits sleep until the
    /// reset (at most 20 times), 500/502 back off linearly (at most 3
    /// attempts), anything else non-2xx fails. Returns `None` for an
    /// ETag-suppressed 304.
    async fn get_raw(
        &self,
        url: &str,
        etag: &str,
    ) -> Result<Option<(serde_json::Value, String, Option<String>)>> {
        let (user, pass) = self.auth();
        let mut nrate = 0;
        let mut nfail = 0;
        loop {
            let mut req = self.http.get(url).basic_auth(&user, Some(&pass));
            if !etag.is_empty() {
                req = req.header("If-None-Match", etag);
            }
            let resp = req.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let data = resp.bytes().await?;

            if status.as_u16() == 304 {
                return Ok(None);
            }
            if status.as_u16() == 200 {
                let json: serde_json::Value = serde_json::from_slice(&data)?;
                let etag = header(&headers, "etag");
                let next = find_next(&header(&headers, "link"));
                return Ok(Some((json, etag, next)));
            }
            if let Some(wait) = rate_limited(status.as_u16(), &headers) {
                nrate += 1;
                if nrate > 20 {
                    bail!(
                        "{status} # too many rate limits\n{}",
                        String::from_utf8_lossy(&data)
                    );
                }
                if !wait.is_zero() {
                    tracing::info!(
                        reset_in = wait.as_secs(),
                        limit = %header(&headers, "x-ratelimit-limit"),
                        used = %header(&headers, "x-ratelimit-used"),
                        "github rate limit"
                    );
                    tokio::time::sleep(wait + Duration::from_secs(60)).await;
                }
                continue;
            }
            if status.as_u16() == 500 || status.as_u16() == 502 {
                tracing::error!(
                    code = status.as_u16(),
                    body = %String::from_utf8_lossy(&data),
                    "github server failure"
                );
                nfail += 1;
                if nfail < 3 {
                    tokio::time::sleep(Duration::from_secs(2 * nfail)).await;
                    continue;
                }
            }
            bail!("{status}\n{}", String::from_utf8_lossy(&data));
        }
    }

    /// Sends `body` as JSON with the given method, with the same
    /// rate-limit handling as reads. Requires authentication.
    async fn send_json<T: Serialize>(&self, method: reqwest::Method, url: &str, body: &T) -> Result<()> {
        let auth = self.secret.get("api.github.com");
        if auth.is_none() && !self.divert_edits() {
            bail!("no secret for api.github.com");
        }
        let (user, pass) = self.auth();
        loop {
            let resp = self
                .http
                .request(method.clone(), url)
                .basic_auth(&user, Some(&pass))
                .json(body)
                .send()
                .await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let data = resp.bytes().await?;
            if let Some(wait) = rate_limited(status.as_u16(), &headers) {
                if !wait.is_zero() {
                    tokio::time::sleep(wait + Duration::from_secs(60)).await;
                }
                continue;
            }
            if !status.is_success() {
                bail!("{status}\n{}", String::from_utf8_lossy(&data));
            }
            return Ok(());
        }
    }

    async fn patch<T: Serialize>(&self, url: &str, changes: &T) -> Result<()> {
        self.send_json(reqwest::Method::PATCH, url, changes).await
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<()> {
        self.send_json(reqwest::Method::POST, url, body).await
    }

    /// Downloads the very latest state of the issue at `url`.
    pub async fn download_issue(&self, url: &str) -> Result<Issue> {
        self.get_object(url).await
    }

    /// Downloads the very latest state of the comment at `url`.
    pub async fn download_issue_comment(&self, url: &str) -> Result<IssueComment> {
        self.get_object(url).await
    }

    /// Posts a new comment (body in Markdown) on the issue.
    pub async fn post_issue_comment(
        &self,
        issue: &Issue,
        changes: &IssueCommentChanges,
    ) -> Result<()> {
        if self.divert_edits() {
            self.test_state.lock().unwrap().edits.push(TestingEdit {
                project: issue.project(),
                issue: issue.number,
                comment: 0,
                issue_changes: None,
                comment_changes: Some(changes.clone()),
            });
            return Ok(());
        }
        self.post(&format!("{}/comments", issue.url), changes).await
    }

    /// Changes the comment on GitHub to have a new body.
    ///
    /// It is usually a good idea to download the live comment first
    /// and check that it still matches the copy the edit was computed
    /// from, to shrink race windows.
    pub async fn edit_issue_comment(
        &self,
        comment: &IssueComment,
        changes: &IssueCommentChanges,
    ) -> Result<()> {
        if self.divert_edits() {
            self.test_state.lock().unwrap().edits.push(TestingEdit {
                project: comment.project(),
                issue: comment.issue_number(),
                comment: comment.comment_id(),
                issue_changes: None,
                comment_changes: Some(changes.clone()),
            });
            return Ok(());
        }
        self.patch(&comment.url, changes).await
    }

    /// Applies the changes to the issue on GitHub.
    pub async fn edit_issue(&self, issue: &Issue, changes: &IssueChanges) -> Result<()> {
        if self.divert_edits() {
            self.test_state.lock().unwrap().edits.push(TestingEdit {
                project: issue.project(),
                issue: issue.number,
                comment: 0,
                issue_changes: Some(changes.clone()),
                comment_changes: None,
            });
            return Ok(());
        }
        self.patch(&issue.url, changes).await
    }
}

/// Changes to apply to an issue. Unset fields are left alone.
///
/// `labels` is the new complete label set, not labels to add; include
/// the existing labels when adding one, or `Some(vec![])` to clear.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IssueChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

/// Changes to apply to an issue comment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IssueCommentChanges {
    pub body: String,
}

fn header(headers: &reqwest::header::HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Decides whether a response is a primary rate-limit rejection and if
/// so how long to wait before retrying (zero means retry at once).
fn rate_limited(status: u16, headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    if status != 403 || header(headers, "x-ratelimit-remaining") != "0" {
        return None;
    }
    let reset: u64 = header(headers, "x-ratelimit-reset").parse().ok()?;
    if reset == 0 {
        return None;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if reset <= now {
        if now - reset > 120 {
            // A reset that stale is not a real rate limit.
            return None;
        }
        return Some(Duration::ZERO);
    }
    Some(Duration::from_secs(reset - now))
}

/// Finds the `rel="next"` URL in a Link header value.
fn find_next(link: &str) -> Option<String> {
    for part in link.split(',') {
        let part = part.trim();
        let Some(rest) = part.strip_prefix('<') else {
            continue;
        };
        let Some((url, attrs)) = rest.split_once('>') else {
            continue;
        };
        for attr in attrs.split(';') {
            if attr.trim() == r#"rel="next""# {
                return Some(url.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_next() {
        let link = r#"<https://api.github.com/repos/x/y/issues?page=2>; rel="next", <https://api.github.com/repos/x/y/issues?page=9>; rel="last""#;
        assert_eq!(
            find_next(link).as_deref(),
            Some("https://api.github.com/repos/x/y/issues?page=2")
        );
        assert_eq!(find_next(r#"<u>; rel="last""#), None);
        assert_eq!(find_next(""), None);
        // rel="next" anywhere in the attribute list.
        let link = r#"<u1>; foo="bar"; rel="next""#;
        assert_eq!(find_next(link).as_deref(), Some("u1"));
    }

    #[test]
    fn test_rate_limited() {
        use reqwest::header::HeaderMap;
        let mut h = HeaderMap::new();
        assert!(rate_limited(403, &h).is_none());
        h.insert("x-ratelimit-remaining", "0".parse().unwrap());
        assert!(rate_limited(403, &h).is_none()); // no reset header
        let soon = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 30;
        h.insert("x-ratelimit-reset", soon.to_string().parse().unwrap());
        let wait = rate_limited(403, &h).unwrap();
        assert!(wait.as_secs() <= 30 && wait.as_secs() >= 25);
        assert!(rate_limited(200, &h).is_none());
        // Long-stale reset: not treated as a limit.
        h.insert("x-ratelimit-reset", "10".parse().unwrap());
        assert!(rate_limited(403, &h).is_none());
    }

    #[test]
    fn test_changes_serialization() {
        let ch = IssueChanges {
            body: Some("new".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&ch).unwrap(), r#"{"body":"new"}"#);
        let ch = IssueCommentChanges { body: "hi".into() };
        assert_eq!(serde_json::to_string(&ch).unwrap(), r#"{"body":"hi"}"#);
    }
}
