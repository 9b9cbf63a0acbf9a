//! Typed event data and the read side of the mirror.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::okey;
use crate::ordered::{self, Elem};
use crate::storage::timed::{self, DBTime, Entry, Watcher};
use crate::storage::{fmt, DB};

use super::Client;

pub(crate) const EVENT_KIND: &str = "Event";

/// A single issue event stored in the database.
#[derive(Clone, Debug)]
pub struct Event {
    /// When the event was last written locally.
    pub db_time: DBTime,
    /// Project, like `"golang/go"`.
    pub project: String,
    /// Issue number.
    pub issue: i64,
    /// API the event came from: `"/issues"`, `"/issues/comments"`, or
    /// `"/issues/events"`.
    pub api: String,
    /// GitHub's event ID. Each API has its own ID space;
    /// `(project, issue, api, id)` is assumed unique.
    pub id: i64,
    /// Raw JSON body as served by GitHub.
    pub json: Vec<u8>,
    /// Typed decoding of the JSON, selected by `api`.
    pub typed: Typed,
}

/// The typed payload of an [`Event`].
#[derive(Clone, Debug)]
pub enum Typed {
    Issue(Issue),
    IssueComment(IssueComment),
    IssueEvent(IssueEvent),
}

/// A user or organization account in GitHub JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub login: String,
}

/// An issue label in GitHub JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub name: String,
}

/// An issue milestone in GitHub JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    #[serde(default)]
    pub title: String,
}

/// An issue title rename in GitHub JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// The GitHub JSON structure for an issue creation event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub closed_at: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub assignees: Vec<User>,
    #[serde(default)]
    pub milestone: Milestone,
    #[serde(default)]
    pub state: String,
    /// Present exactly when the "issue" is a pull request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl Issue {
    /// The issue's project, like `"golang/go"`.
    pub fn project(&self) -> String {
        url_to_project(&self.url)
    }
}

/// The GitHub JSON structure for an issue comment event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IssueComment {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub issue_url: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub body: String,
}

impl IssueComment {
    /// The comment's project, like `"golang/go"`.
    pub fn project(&self) -> String {
        url_to_project(&self.url)
    }

    /// The comment's issue number.
    pub fn issue_number(&self) -> i64 {
        let base = self.html_url.split('#').next().unwrap_or_default();
        base_to_i64(base)
    }

    /// The comment's own numeric ID. The ID looks unique across all of
    /// GitHub, but only uniqueness within a single issue is assumed.
    pub fn comment_id(&self) -> i64 {
        base_to_i64(&self.url)
    }
}

/// The GitHub JSON structure for an issue metadata event.
///
/// The issue field present in the repository-wide feed is deliberately
/// absent here: it does not appear in per-issue downloads, so nothing
/// may depend on it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IssueEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub actor: User,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub lock_reason: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub assigner: User,
    #[serde(default)]
    pub assignees: Vec<User>,
    #[serde(default)]
    pub milestone: Milestone,
    #[serde(default)]
    pub rename: Rename,
}

fn url_to_project(u: &str) -> String {
    let Some(rest) = u.strip_prefix("https://api.github.com/repos/") else {
        return String::new();
    };
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next()) {
        (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => {
            format!("{owner}/{repo}")
        }
        _ => String::new(),
    }
}

fn base_to_i64(u: &str) -> i64 {
    u.rsplit('/')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(0)
}

/// Decodes a timed entry into an [`Event`], panicking on malformed
/// data.
pub(crate) fn decode_event(db: &dyn DB, t: &Entry) -> Event {
    let decoded = match ordered::decode(&t.key) {
        Ok(elems) if elems.len() == 4 => {
            match (
                elems[0].as_str(),
                elems[1].as_i64(),
                elems[2].as_str(),
                elems[3].as_i64(),
            ) {
                (Some(project), Some(issue), Some(api), Some(id)) => {
                    Some((project.to_string(), issue, api.to_string(), id))
                }
                _ => None,
            }
        }
        _ => None,
    };
    let Some((project, issue, api, id)) = decoded else {
        // unreachable unless corrupt storage
        db.panic_corrupt("github event decode key", &[("key", &fmt(&t.key))]);
    };

    let typed = match api.as_str() {
        "/issues" => serde_json::from_slice(&t.val).map(Typed::Issue),
        "/issues/comments" => serde_json::from_slice(&t.val).map(Typed::IssueComment),
        "/issues/events" => serde_json::from_slice(&t.val).map(Typed::IssueEvent),
        other => db.panic_corrupt("github event invalid api", &[("api", other)]),
    };
    let typed = match typed {
        Ok(typed) => typed,
        Err(e) => db.panic_corrupt(
            "github event json",
            &[
                ("key", &fmt(&t.key)),
                ("js", &String::from_utf8_lossy(&t.val)),
                ("err", &e.to_string()),
            ],
        ),
    };
    Event {
        db_time: t.mod_time,
        project,
        issue,
        api,
        id,
        json: t.val.clone(),
        typed,
    }
}

impl Client {
    /// Writes a single event through the time index.
    pub(crate) fn write_event(
        &self,
        b: &mut dyn crate::storage::Batch,
        project: &str,
        issue: i64,
        api: &str,
        id: i64,
        raw: &[u8],
    ) {
        timed::set(
            &*self.db,
            b,
            EVENT_KIND,
            &okey!(project, issue, api, id),
            raw,
        );
    }

    /// Returns an iterator over issue events in the project, limited
    /// to `issue_min <= issue <= issue_max` (`issue_max < 0` means no
    /// upper limit), in `(project, issue, api, id)` order. For one
    /// issue, that means its `"/issues"` creation event first, then
    /// comments, then metadata events, each group in increasing ID
    /// order, which is increasing event-time order on GitHub.
    pub fn events(
        &self,
        project: &str,
        issue_min: i64,
        issue_max: i64,
    ) -> impl Iterator<Item = Event> + '_ {
        let start = okey!(project, issue_min);
        let issue_max = if issue_max < 0 { i64::MAX } else { issue_max };
        let end = okey!(project, issue_max, Elem::Inf);
        let db = &*self.db;
        timed::scan(db, EVENT_KIND, &start, &end).map(move |t| decode_event(db, &t))
    }

    /// Returns an iterator over events written after database time
    /// `t`, in write-time order, so the `db_time` of the last
    /// successfully processed event can seed a future call. An empty
    /// `project` selects every project.
    pub fn events_after(&self, t: DBTime, project: &str) -> impl Iterator<Item = Event> + '_ {
        let db = &*self.db;
        let filter = event_project_filter(self.db.clone(), project);
        timed::scan_after(db, EVENT_KIND, t, filter).map(move |t| decode_event(db, &t))
    }

    /// Returns a new event [`Watcher`] with the given name, resuming
    /// where any previous watcher of that name left off.
    pub fn event_watcher(&self, name: &str) -> Watcher<Event> {
        let db = self.db.clone();
        Watcher::new(self.db.clone(), name, EVENT_KIND, move |e| {
            decode_event(&*db, e)
        })
    }

    /// Looks up an issue by its `https://github.com/<proj>/issues/<n>`
    /// URL, consulting only the database (never GitHub itself).
    pub fn lookup_issue_url(&self, url: &str) -> Result<Issue> {
        let parsed = (|| {
            let rest = url.strip_prefix("https://github.com/")?;
            let (proj, num) = rest.split_once("/issues/")?;
            let n: i64 = num.parse().ok().filter(|n| *n > 0)?;
            Some((proj.to_string(), n))
        })();
        let Some((proj, n)) = parsed else {
            bail!("not a github issue URL: {url:?}");
        };
        for e in self.events(&proj, n, n) {
            if let Typed::Issue(issue) = e.typed {
                return Ok(issue);
            }
        }
        bail!("{proj}#{n} not in database");
    }
}

fn event_project_filter(
    db: Arc<dyn DB>,
    project: &str,
) -> Option<Box<dyn Fn(&[u8]) -> bool + Send>> {
    if project.is_empty() {
        return None;
    }
    let project = project.to_string();
    Some(Box::new(move |key: &[u8]| {
        match ordered::decode_prefix(key, 1) {
            Ok((elems, _)) => elems[0].as_str() == Some(project.as_str()),
            // unreachable unless corrupt storage
            Err(e) => db.panic_corrupt(
                "github events_after decode",
                &[("key", &fmt(key)), ("err", &e.to_string())],
            ),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_to_project() {
        assert_eq!(
            url_to_project("https://api.github.com/repos/golang/go/issues/1"),
            "golang/go"
        );
        assert_eq!(url_to_project("https://github.com/golang/go/issues/1"), "");
        assert_eq!(url_to_project("https://api.github.com/repos/x"), "");
    }

    #[test]
    fn test_comment_accessors() {
        let c = IssueComment {
            url: "https://api.github.com/repos/o/r/issues/comments/777".into(),
            html_url: "https://github.com/o/r/issues/42#issuecomment-777".into(),
            ..Default::default()
        };
        assert_eq!(c.project(), "o/r");
        assert_eq!(c.issue_number(), 42);
        assert_eq!(c.comment_id(), 777);
    }

    #[test]
    fn test_issue_pull_request_marker() {
        let plain: Issue = serde_json::from_str(r#"{"number": 1}"#).unwrap();
        assert!(plain.pull_request.is_none());
        let pr: Issue = serde_json::from_str(r#"{"number": 1, "pull_request": {}}"#).unwrap();
        assert!(pr.pull_request.is_some());
    }
}
