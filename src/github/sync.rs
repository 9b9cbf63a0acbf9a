//! Incremental synchronization of GitHub issue state into the mirror.
//!
//! Three paginated endpoints feed the mirror, with different ordering
//! affordances that force different strategies:
//!
//! - `/issues` and `/issues/comments` accept
//!   `since=T&sort=updated&direction=asc`, so those feeds stream in
//!   ascending update time and the sync just remembers the last
//!   `updated_at` absorbed and resumes from there.
//! - `/issues/events` has no `since` and streams in *descending* id,
//!   so the sync reads backward until it meets an id it has already
//!   absorbed, and only then records the newest id it saw — recording
//!   earlier would leave an unread gap.
//! - When the backward walk cannot reach the last absorbed event
//!   (first sync, or a long outage), the fallback is a full scan:
//!   record the current newest event id without absorbing anything
//!   (a lower bound on what the remaining steps will cover), sync
//!   `/issues` to learn every issue, absorb each issue's own
//!   `/issues/{n}/events` feed with resumable progress, then run one
//!   normal incremental event pass to close the window.
//!
//! Sync state lives in a [`ProjectSync`] JSON blob per project and is
//! persisted at every step, so an interrupted sync resumes rather than
//! restarting.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::okey;
use crate::ordered::{self, Elem};
use crate::storage::{fmt, to_json, LockGuard, DB};

use super::data::EVENT_KIND;
use super::{Client, Fetch, API_BASE};

/// Per-project sync state stored in the database under
/// `("ProjectSync", project)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ProjectSync {
    /// Project name, like `"golang/go"`.
    pub name: String,
    /// ETag of the newest absorbed event-feed page.
    #[serde(default)]
    pub event_etag: String,
    /// Highest `/issues/events` id absorbed.
    #[serde(default)]
    pub event_id: i64,
    /// Latest issue `updated_at` absorbed.
    #[serde(default)]
    pub issue_date: String,
    /// Latest comment `updated_at` absorbed.
    #[serde(default)]
    pub comment_date: String,
    /// Whether a full per-issue scan is in progress.
    #[serde(default)]
    pub full_sync_active: bool,
    /// Highest issue whose per-issue events are fully absorbed by the
    /// in-progress full scan.
    #[serde(default)]
    pub full_sync_issue: i64,
}

impl ProjectSync {
    fn key(project: &str) -> Vec<u8> {
        okey!("ProjectSync", project)
    }

    pub(crate) fn store(&self, db: &dyn DB) {
        db.set(&ProjectSync::key(&self.name), &to_json(self));
    }
}

impl Client {
    /// Adds a project of the form `"owner/repo"` to the mirror. Only
    /// the sync metadata is created; no data is fetched until
    /// [`Client::sync`] runs. Fails if the project was already added.
    pub fn add(&self, project: &str) -> Result<()> {
        let key = ProjectSync::key(project);
        if self.db.get(&key).is_some() {
            bail!("github add: already added: {project:?}");
        }
        self.db.set(
            &key,
            &to_json(&ProjectSync {
                name: project.to_string(),
                ..Default::default()
            }),
        );
        Ok(())
    }

    /// Syncs every added project, collecting errors rather than
    /// stopping at the first.
    pub async fn sync(&self) -> Result<()> {
        let mut projects = Vec::new();
        for (key, _) in self
            .db
            .scan(&okey!("ProjectSync"), &okey!("ProjectSync", Elem::Inf))
        {
            match ordered::decode(&key) {
                Ok(elems) if elems.len() == 2 => match elems[1].as_str() {
                    Some(p) => projects.push(p.to_string()),
                    None => self
                        .db
                        .panic_corrupt("github sync decode", &[("key", &fmt(&key))]),
                },
                _ => self
                    .db
                    .panic_corrupt("github sync decode", &[("key", &fmt(&key))]),
            }
        }
        let mut errs = Vec::new();
        for project in projects {
            if let Err(e) = self.sync_project(&project).await {
                errs.push(e.to_string());
            }
        }
        if !errs.is_empty() {
            bail!("{}", errs.join("; "));
        }
        Ok(())
    }

    /// Syncs a single project.
    pub async fn sync_project(&self, project: &str) -> Result<()> {
        debug!(project, "github sync project");
        self.sync_project_inner(project)
            .await
            .with_context(|| format!("sync_project({project:?})"))
    }

    async fn sync_project_inner(&self, project: &str) -> Result<()> {
        let key = ProjectSync::key(project);
        let lock_name = String::from_utf8_lossy(&key).into_owned();
        let _guard = LockGuard::acquire(&*self.db, &lock_name);

        let mut proj: ProjectSync = match self.db.get(&key) {
            Some(val) => serde_json::from_slice(&val)?,
            None => bail!("missing project"),
        };

        self.sync_issues(&mut proj).await?;
        self.sync_issue_comments(&mut proj).await?;

        // The incremental event sync only reaches back a bounded
        // distance. A new project, or one that fell too far behind,
        // needs the full per-issue scan instead.
        if proj.event_id == 0 || proj.full_sync_active {
            if proj.event_id == 0 {
                proj.full_sync_active = true;
                proj.full_sync_issue = 0;
                proj.store(&*self.db);
                self.sync_issue_events(&mut proj, 0, true).await?;
            }
            self.sync_issues(&mut proj).await?;
            let issues = self.known_issues(project);
            for issue in issues {
                if issue <= proj.full_sync_issue {
                    continue;
                }
                self.sync_issue_events(&mut proj, issue, false).await?;
                proj.full_sync_issue = issue;
                proj.store(&*self.db);
                if self.test_state.lock().unwrap().full_sync_stop {
                    bail!("test full sync stop");
                }
            }
            // Fall through to the incremental scan to close the window.
            proj.full_sync_active = false;
            proj.store(&*self.db);
        }

        self.sync_issue_events(&mut proj, 0, false).await?;
        Ok(())
    }

    /// Distinct issue numbers present in the mirror for `project`, in
    /// ascending order.
    fn known_issues(&self, project: &str) -> Vec<i64> {
        let mut issues = Vec::new();
        let mut last = 0i64;
        for (key, _) in self.db.scan(
            &{
                let mut k = okey!(EVENT_KIND);
                k.extend_from_slice(&okey!(project));
                k
            },
            &{
                let mut k = okey!(EVENT_KIND);
                k.extend_from_slice(&okey!(project, Elem::Inf));
                k
            },
        ) {
            let issue = match ordered::decode_prefix(&key, 3) {
                Ok((elems, _)) => elems[2].as_i64(),
                Err(_) => None,
            };
            let Some(issue) = issue else {
                // unreachable unless corrupt storage
                self.db
                    .panic_corrupt("github known issues decode", &[("key", &fmt(&key))]);
            };
            if issue != last {
                issues.push(issue);
                last = issue;
            }
        }
        issues
    }

    /// Records all new issues since `proj.issue_date`, advancing it.
    async fn sync_issues(&self, proj: &mut ProjectSync) -> Result<()> {
        self.sync_by_date(proj, "/issues").await
    }

    /// Records all new issue comments since `proj.comment_date`,
    /// advancing it.
    async fn sync_issue_comments(&self, proj: &mut ProjectSync) -> Result<()> {
        self.sync_by_date(proj, "/issues/comments").await
    }

    /// Downloads and saves issues or issue comments updated since the
    /// date remembered in `proj`. The remembered date advances as
    /// items are absorbed and is persisted before any error return, so
    /// the next run picks up where this one stopped.
    async fn sync_by_date(&self, proj: &mut ProjectSync, api: &str) -> Result<()> {
        'restart: loop {
            let since = match api {
                "/issues" => &proj.issue_date,
                "/issues/comments" => &proj.comment_date,
                _ => panic!("sync_by_date api: {api}"),
            };
            let mut query = String::from("direction=asc&page=1");
            if api == "/issues" {
                query.push_str("&per_page=100");
            }
            if !since.is_empty() {
                query.push_str(&format!("&since={since}"));
            }
            query.push_str("&sort=updated");
            if api == "/issues" {
                query.push_str("&state=all");
            }
            let mut url = format!("{API_BASE}{}{api}?{query}", proj.name);

            let mut b = self.db.batch();
            let mut npage = 0;
            loop {
                let page = match self.get_array(&url, "").await {
                    Ok(Fetch::Page(page)) => page,
                    Ok(Fetch::NotModified) => {
                        b.apply();
                        proj.store(&*self.db);
                        return Ok(());
                    }
                    Err(e) => {
                        // Keep the progress made before the failure.
                        b.apply();
                        proj.store(&*self.db);
                        return Err(e);
                    }
                };
                let mut latest = String::new();
                for raw in &page.body {
                    let (issue, id, updated) = match self.date_item_meta(api, raw) {
                        Ok(meta) => meta,
                        Err(e) => {
                            b.apply();
                            proj.store(&*self.db);
                            return Err(e);
                        }
                    };
                    let raw_bytes = to_json(raw);
                    self.write_event(&mut *b, &proj.name, issue, api, id, &raw_bytes);
                    b.maybe_apply();
                    latest = updated;
                }
                b.apply();
                if !latest.is_empty() {
                    match api {
                        "/issues" => proj.issue_date = latest,
                        _ => proj.comment_date = latest,
                    }
                }
                proj.store(&*self.db);

                // Some backends stop serving results after 1000 pages.
                // Well before that, restart pagination from the
                // advanced since date.
                npage += 1;
                if npage >= 500 {
                    continue 'restart;
                }
                match page.next {
                    Some(next) => url = next,
                    None => return Ok(()),
                }
            }
        }
    }

    /// Extracts `(issue, id, updated_at)` from one `/issues` or
    /// `/issues/comments` item without decoding the rest.
    fn date_item_meta(&self, api: &str, raw: &serde_json::Value) -> Result<(i64, i64, String)> {
        let id = raw.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
        if id == 0 {
            bail!("parsing message: no id: {raw}");
        }
        let updated = raw
            .get("updated_at")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if updated.is_empty() {
            bail!("parsing message: no updated_at: {raw}");
        }
        let issue = match api {
            "/issues" => raw.get("number").and_then(|v| v.as_i64()).unwrap_or(0),
            "/issues/comments" => {
                let issue_url = raw
                    .get("issue_url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                issue_url
                    .rsplit('/')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0)
            }
            _ => self.db.panic_corrupt("sync_by_date bad api", &[("api", api)]),
        };
        if issue == 0 {
            bail!("parsing message: no issue number: {raw}");
        }
        Ok((issue, id, updated))
    }

    /// Downloads and saves new issue events.
    ///
    /// With `issue == 0`, reads the project-wide `/issues/events` feed
    /// backward until it reaches `proj.event_id` (or the feed end),
    /// then records the newest id and ETag seen. Reaching neither is a
    /// lost sync: the gap cannot be closed from this feed, and the
    /// error leaves `proj.event_id` untouched so the caller falls back
    /// to a full scan.
    ///
    /// With `issue > 0`, reads that issue's entire `/issues/{n}/events`
    /// feed and does not touch `proj.event_id`; the caller is looping
    /// over all issues.
    ///
    /// With `only_set_latest`, stores nothing and just records the
    /// newest id and ETag, as the lower-bound step of a full scan.
    async fn sync_issue_events(
        &self,
        proj: &mut ProjectSync,
        issue: i64,
        only_set_latest: bool,
    ) -> Result<()> {
        assert!(
            issue == 0 || !only_set_latest,
            "sync_issue_events misuse"
        );

        let api = if issue > 0 {
            format!("/issues/{issue}/events")
        } else {
            "/issues/events".to_string()
        };
        let mut url = format!("{API_BASE}{}{api}?page=1&per_page=100", proj.name);

        let mut first_id = 0i64;
        let mut first_etag = String::new();
        let mut last_id = 0i64;
        let mut stopped = false;

        let mut b = self.db.batch();
        'pages: loop {
            let page = match self.get_array(&url, &proj.event_etag).await {
                Ok(Fetch::Page(page)) => page,
                Ok(Fetch::NotModified) => {
                    b.apply();
                    return Ok(());
                }
                Err(e) => {
                    b.apply();
                    return Err(e);
                }
            };
            for raw in &page.body {
                let id = raw.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
                if id == 0 {
                    b.apply();
                    bail!("parsing message: no id: {raw}");
                }
                let event_issue = if issue > 0 {
                    issue
                } else {
                    let n = raw
                        .get("issue")
                        .and_then(|i| i.get("number"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    if n == 0 {
                        b.apply();
                        bail!("parsing message: no issue number: {raw}");
                    }
                    n
                };
                if first_id == 0 {
                    first_id = id;
                    first_etag = page.etag.clone();
                }
                last_id = id;
                if issue == 0 && (only_set_latest || proj.event_id != 0 && id <= proj.event_id) {
                    stopped = true;
                    break 'pages;
                }
                self.write_event(
                    &mut *b,
                    &proj.name,
                    event_issue,
                    "/issues/events",
                    id,
                    &to_json(raw),
                );
                b.maybe_apply();
            }
            match page.next {
                Some(next) => url = next,
                None => break 'pages,
            }
        }
        b.apply();

        if issue == 0 && last_id != 0 && !stopped {
            return Err(anyhow!(
                "lost sync: missing event IDs between {} and {}",
                proj.event_id,
                last_id
            ));
        }

        if issue == 0 && first_id != 0 {
            proj.event_id = first_id;
            proj.event_etag = first_etag;
            proj.store(&*self.db);
        }
        Ok(())
    }
}
