//! Testing support for the GitHub client.
//!
//! In testing mode (see [`Client::enable_testing`]) the client never
//! talks to GitHub. Requested edits are appended to an in-process log
//! that tests inspect through [`TestingClient::edits`], reads are
//! answered from JSON registered per URL, and unregistered array URLs
//! serve an empty feed, so sync tests only describe the traffic they
//! care about.
//!
//! [`TestingClient::add_issue`] and friends write synthetic events
//! directly into the client's database and register their download
//! URLs, so downstream consumers (rewriter, poster) can be driven
//! without any HTTP at all.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::json;

use crate::storage::to_json;

use super::{Client, Issue, IssueComment, IssueEvent};

/// A diverted edit: logged instead of applied to GitHub.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestingEdit {
    pub project: String,
    pub issue: i64,
    pub comment: i64,
    pub issue_changes: Option<super::IssueChanges>,
    pub comment_changes: Option<super::IssueCommentChanges>,
}

impl std::fmt::Display for TestingEdit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ch) = &self.issue_changes {
            let js = serde_json::to_string(ch).unwrap_or_default();
            return write!(f, "EditIssue({}#{}, {})", self.project, self.issue, js);
        }
        if let Some(ch) = &self.comment_changes {
            let js = serde_json::to_string(ch).unwrap_or_default();
            if self.comment == 0 {
                return write!(f, "PostIssueComment({}#{}, {})", self.project, self.issue, js);
            }
            return write!(
                f,
                "EditIssueComment({}#{}.{}, {})",
                self.project, self.issue, self.comment, js
            );
        }
        write!(f, "?")
    }
}

/// Access to client functionality intended for tests.
pub struct TestingClient<'a> {
    c: &'a Client,
}

// Synthetic ID spaces far above anything tests allocate by hand.
static ISSUE_ID: AtomicI64 = AtomicI64::new(1_000_000_000);
static COMMENT_ID: AtomicI64 = AtomicI64::new(10_000_000_000);
static EVENT_ID: AtomicI64 = AtomicI64::new(100_000_000_000);

impl Client {
    /// Returns the testing facade. Meaningful only after
    /// [`Client::enable_testing`]; edits made without testing mode go
    /// to GitHub.
    pub fn testing(&self) -> TestingClient<'_> {
        TestingClient { c: self }
    }
}

impl TestingClient<'_> {
    /// Registers `json` (usually an array) to be served for `url`.
    pub fn add_page(&self, url: &str, json: serde_json::Value) {
        self.c
            .test_state
            .lock()
            .unwrap()
            .events
            .insert(url.to_string(), json);
    }

    /// Injects or clears an artificial abort between per-issue event
    /// absorptions of a full sync, to exercise resumability.
    pub fn set_full_sync_stop(&self, stop: bool) {
        self.c.test_state.lock().unwrap().full_sync_stop = stop;
    }

    fn add_event(&self, url: &str, project: &str, issue: i64, api: &str, id: i64, typed_json: serde_json::Value) {
        self.add_page(url, typed_json.clone());
        let mut b = self.c.db.batch();
        self.c
            .write_event(&mut *b, project, issue, api, id, &to_json(&typed_json));
        b.apply();
    }

    /// Adds the issue to the project, filling in its URLs, and writes
    /// the corresponding creation event to the database. Other clients
    /// of the same database see it too.
    pub fn add_issue(&self, project: &str, issue: &Issue) {
        let id = ISSUE_ID.fetch_add(1, Ordering::SeqCst) + 1;
        let mut issue = issue.clone();
        issue.url = format!(
            "https://api.github.com/repos/{project}/issues/{}",
            issue.number
        );
        issue.html_url = format!("https://github.com/{project}/issues/{}", issue.number);
        let url = issue.url.clone();
        let number = issue.number;
        self.add_event(
            &url,
            project,
            number,
            "/issues",
            id,
            serde_json::to_value(&issue).unwrap_or(json!({})),
        );
    }

    /// Adds the comment to the identified issue, assigning it a fresh
    /// comment ID, and writes the corresponding event to the database.
    pub fn add_issue_comment(&self, project: &str, issue: i64, comment: &IssueComment) {
        let id = COMMENT_ID.fetch_add(1, Ordering::SeqCst) + 1;
        let mut comment = comment.clone();
        comment.url = format!("https://api.github.com/repos/{project}/issues/comments/{id}");
        comment.issue_url = format!("https://api.github.com/repos/{project}/issues/{issue}");
        comment.html_url = format!("https://github.com/{project}/issues/{issue}#issuecomment-{id}");
        let url = comment.url.clone();
        self.add_event(
            &url,
            project,
            issue,
            "/issues/comments",
            id,
            serde_json::to_value(&comment).unwrap_or(json!({})),
        );
    }

    /// Adds the metadata event to the identified issue, assigning it a
    /// fresh event ID, and writes it to the database.
    pub fn add_issue_event(&self, project: &str, issue: i64, event: &IssueEvent) {
        let id = EVENT_ID.fetch_add(1, Ordering::SeqCst) + 1;
        let mut event = event.clone();
        event.id = id;
        event.url = format!("https://api.github.com/repos/{project}/issues/events/{id}");
        let url = event.url.clone();
        self.add_event(
            &url,
            project,
            issue,
            "/issues/events",
            id,
            serde_json::to_value(&event).unwrap_or(json!({})),
        );
    }

    /// Returns the edits diverted so far, in order.
    pub fn edits(&self) -> Vec<TestingEdit> {
        self.c.test_state.lock().unwrap().edits.clone()
    }

    /// Clears the diverted-edit log.
    pub fn clear_edits(&self) {
        self.c.test_state.lock().unwrap().edits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{IssueCommentChanges, Typed};
    use crate::secret;
    use crate::storage::timed::DBTime;
    use crate::storage::{MemDB, DB};
    use std::sync::Arc;

    fn test_client() -> Client {
        let db: Arc<dyn DB> = Arc::new(MemDB::new());
        let c = Client::new(db, Arc::new(secret::empty()), reqwest::Client::new());
        c.enable_testing();
        c
    }

    #[tokio::test]
    async fn test_add_issue_and_lookup() {
        let c = test_client();
        c.testing().add_issue(
            "o/r",
            &Issue {
                number: 7,
                title: "seven".into(),
                body: "the body".into(),
                ..Default::default()
            },
        );
        let issue = c.lookup_issue_url("https://github.com/o/r/issues/7").unwrap();
        assert_eq!(issue.title, "seven");
        assert!(c.lookup_issue_url("https://github.com/o/r/issues/8").is_err());
        assert!(c.lookup_issue_url("https://example.com/x").is_err());

        // The issue is downloadable from its API URL.
        let live = c.download_issue(&issue.url).await.unwrap();
        assert_eq!(live.body, "the body");
    }

    #[tokio::test]
    async fn test_events_ordering() {
        let c = test_client();
        let t = c.testing();
        t.add_issue("o/r", &Issue { number: 1, ..Default::default() });
        t.add_issue_comment("o/r", 1, &IssueComment { body: "c1".into(), ..Default::default() });
        t.add_issue_event("o/r", 1, &IssueEvent { event: "closed".into(), ..Default::default() });
        t.add_issue("o/r", &Issue { number: 2, ..Default::default() });

        let apis: Vec<(i64, String)> = c.events("o/r", 0, -1).map(|e| (e.issue, e.api)).collect();
        assert_eq!(
            apis,
            vec![
                (1, "/issues".to_string()),
                (1, "/issues/comments".to_string()),
                (1, "/issues/events".to_string()),
                (2, "/issues".to_string()),
            ]
        );
        // Range bounds are honored.
        assert_eq!(c.events("o/r", 2, -1).count(), 1);
        assert_eq!(c.events("o/r", 1, 1).count(), 3);

        // events_after sees them in write order and filters by project.
        let after: Vec<i64> = c.events_after(DBTime(0), "o/r").map(|e| e.issue).collect();
        assert_eq!(after, vec![1, 1, 1, 2]);
        assert_eq!(c.events_after(DBTime(0), "other/proj").count(), 0);
    }

    #[tokio::test]
    async fn test_edit_divert_log() {
        let c = test_client();
        c.testing().add_issue("o/r", &Issue { number: 3, ..Default::default() });
        let issue = c.lookup_issue_url("https://github.com/o/r/issues/3").unwrap();
        c.post_issue_comment(&issue, &IssueCommentChanges { body: "hello".into() })
            .await
            .unwrap();
        let edits = c.testing().edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(
            edits[0].to_string(),
            r#"PostIssueComment(o/r#3, {"body":"hello"})"#
        );
        c.testing().clear_edits();
        assert!(c.testing().edits().is_empty());
    }

    #[tokio::test]
    async fn test_event_watcher_decodes_typed() {
        let c = test_client();
        c.testing().add_issue(
            "o/r",
            &Issue {
                number: 5,
                title: "five".into(),
                ..Default::default()
            },
        );
        let w = c.event_watcher("test-watcher");
        let mut it = w.recent();
        let e = it.next().unwrap();
        assert_eq!(e.issue, 5);
        match &e.typed {
            Typed::Issue(issue) => assert_eq!(issue.title, "five"),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
