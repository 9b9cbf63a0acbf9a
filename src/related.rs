//! Posting lists of related issues to newly filed issues.
//!
//! A [`Poster`] watches the mirror for new issues, looks up each
//! issue's embedding in the vector store, searches for the nearest
//! neighbors above a similarity cutoff, and posts a single Markdown
//! comment listing them. A `("Posted", project, issue)` marker written
//! together with a successful post guarantees an issue is never posted
//! to twice, even across crashes and restarts.
//!
//! This started life as a duplicate detector, but "related" turns out
//! to be the more useful framing: surfacing context that the people on
//! the issue had forgotten or never knew is valuable even when nothing
//! is a true duplicate.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::docs::Corpus;
use crate::github::{Client, Issue, IssueCommentChanges, Typed};
use crate::okey;
use crate::ordered::Elem;
use crate::storage::timed::Watcher;
use crate::storage::vector::VectorDB;
use crate::storage::DB;

const DEFAULT_MAX_RESULTS: usize = 10;
const DEFAULT_SCORE_CUTOFF: f64 = 0.82;
const DEFAULT_TOO_OLD_HOURS: i64 = 48;

/// Posts comments about related issues.
///
/// Configure with [`Poster::enable_project`] and (to actually post)
/// [`Poster::enable_posts`] before calling [`Poster::run`]. Without
/// posting enabled, `run` logs the comments it would post and leaves
/// its cursor alone, so the same issues are reconsidered later.
pub struct Poster {
    db: Arc<dyn DB>,
    vdb: Arc<VectorDB>,
    github: Arc<Client>,
    docs: Corpus,
    projects: HashSet<String>,
    watcher: Watcher<crate::github::Event>,
    name: String,
    time_limit: DateTime<Utc>,
    ignores: Vec<Box<dyn Fn(&Issue) -> bool + Send + Sync>>,
    max_results: usize,
    score_cutoff: f64,
    post: bool,
}

impl Poster {
    /// Returns a new poster storing state in `db`, watching issues
    /// through `gh`, searching `vdb`, and reading document titles from
    /// `docs`. The name keys the poster's persistent position; future
    /// posters with the same name resume it.
    pub fn new(
        db: Arc<dyn DB>,
        gh: Arc<Client>,
        vdb: Arc<VectorDB>,
        docs: Corpus,
        name: &str,
    ) -> Poster {
        let watcher = gh.event_watcher(&format!("related.Poster:{name}"));
        Poster {
            db,
            vdb,
            github: gh,
            docs,
            projects: HashSet::new(),
            watcher,
            name: name.to_string(),
            time_limit: Utc::now() - chrono::Duration::hours(DEFAULT_TOO_OLD_HOURS),
            ignores: Vec::new(),
            max_results: DEFAULT_MAX_RESULTS,
            score_cutoff: DEFAULT_SCORE_CUTOFF,
            post: false,
        }
    }

    /// Issues created before `t` are skipped. The default is 48 hours
    /// before the poster was created.
    pub fn set_time_limit(&mut self, t: DateTime<Utc>) {
        self.time_limit = t;
    }

    /// Caps the number of related documents in one posted comment.
    /// The default is 10.
    pub fn set_max_results(&mut self, max: usize) {
        self.max_results = max;
    }

    /// Sets the minimum similarity score for a search result to count
    /// as related. The default of 0.82 was determined empirically.
    pub fn set_min_score(&mut self, min: f64) {
        self.score_cutoff = min;
    }

    /// Skips issues whose body contains `text`.
    pub fn skip_body_contains(&mut self, text: &str) {
        let text = text.to_string();
        self.ignores
            .push(Box::new(move |issue| issue.body.contains(&text)));
    }

    /// Skips issues whose title starts with `prefix`.
    pub fn skip_title_prefix(&mut self, prefix: &str) {
        let prefix = prefix.to_string();
        self.ignores
            .push(Box::new(move |issue| issue.title.starts_with(&prefix)));
    }

    /// Skips issues whose title ends with `suffix`.
    pub fn skip_title_suffix(&mut self, suffix: &str) {
        let suffix = suffix.to_string();
        self.ignores
            .push(Box::new(move |issue| issue.title.ends_with(&suffix)));
    }

    /// Enables posting on issues in the given project.
    pub fn enable_project(&mut self, project: &str) {
        self.projects.insert(project.to_string());
    }

    /// Enables posting to the tracker. See [`Poster::run`] for what
    /// happens without it.
    pub fn enable_posts(&mut self) {
        self.post = true;
    }

    /// Deletes every "posted on this issue" marker, so future runs may
    /// post again. Maintenance use only.
    pub fn delete_posted(&self) {
        self.db
            .delete_range(&okey!("Posted"), &okey!("Posted", Elem::Inf));
    }

    /// Runs a single round over issues created since the last
    /// edit-enabled run under this poster's name.
    ///
    /// Closed issues, pull requests, issues older than the time limit,
    /// skipped-by-rule issues, and issues already posted to are passed
    /// over. For the rest, the issue's own embedding keys a search;
    /// neighbors below the score cutoff are dropped and at most
    /// [`Poster::set_max_results`] survive. The resulting comment is
    /// logged always, and posted when posting is enabled — followed
    /// immediately by the posted marker and a flush, so an interruption
    /// cannot double-post.
    pub async fn run(&self) {
        info!(name = %self.name, "related poster start");

        let mut it = self.watcher.recent();
        'events: while let Some(e) = it.next() {
            if !self.projects.contains(&e.project) || e.api != "/issues" {
                continue;
            }
            let Typed::Issue(issue) = &e.typed else {
                continue;
            };
            if issue.state == "closed" || issue.pull_request.is_some() {
                continue;
            }
            match DateTime::parse_from_rfc3339(&issue.created_at) {
                Ok(tm) => {
                    if tm.with_timezone(&Utc) < self.time_limit {
                        continue;
                    }
                }
                Err(err) => {
                    error!(created_at = %issue.created_at, err = %err, "related parse created_at");
                    continue;
                }
            }
            for ignore in &self.ignores {
                if ignore(issue) {
                    continue 'events;
                }
            }

            // One post per issue ever, across every poster name.
            let posted = okey!("Posted", &e.project, e.issue);
            if self.db.get(&posted).is_some() {
                continue;
            }

            let url = format!("https://github.com/{}/issues/{}", e.project, e.issue);
            debug!(url = %url, "related consider");
            let Some(vec) = self.vdb.get(&url) else {
                // The embedding pipeline has not caught up with this
                // issue yet; it will be reconsidered next round.
                info!(url = %url, "related embedding not ready");
                continue;
            };
            let mut results = self.vdb.search(&vec, self.max_results + 5);
            if results.first().is_some_and(|r| r.id == url) {
                results.remove(0);
            }
            if let Some(cut) = results.iter().position(|r| r.score < self.score_cutoff) {
                results.truncate(cut);
            }
            results.truncate(self.max_results);
            if results.is_empty() {
                if self.post {
                    it.mark_old(e.db_time);
                }
                continue;
            }

            let mut comment = String::from("**Similar Issues**\n\n");
            for r in &results {
                let title = match self.docs.get(&r.id) {
                    Some(d) => d.title,
                    None => r.id.clone(),
                };
                let mut num = String::new();
                if r.id.contains("/issues/") {
                    if let Some(i) = r.id.rfind('/') {
                        num = format!(" #{}", &r.id[i + 1..]);
                    }
                }
                let _ = writeln!(
                    comment,
                    " - [{}{}]({}) <!-- score={:.5} -->",
                    markdown_escape(&title),
                    num,
                    r.id,
                    r.score
                );
            }
            comment.push_str(
                "\n<sub>(Emoji vote if this was helpful or unhelpful; \
                 more detailed feedback welcome in the tracker discussion.)</sub>\n",
            );

            info!(name = %self.name, project = %e.project, issue = e.issue, comment = %comment,
                "related post");

            if !self.post {
                continue;
            }

            if let Err(err) = self
                .github
                .post_issue_comment(issue, &IssueCommentChanges { body: comment })
                .await
            {
                error!(issue = e.issue, err = %err, "related post comment");
                continue;
            }
            self.db.set(&posted, &[]);
            it.mark_old(e.db_time);

            // Flush at once so an interruption later in the loop
            // cannot forget the post happened.
            it.flush();
            self.db.flush();
        }
        info!(name = %self.name, "related poster end");
    }
}

/// Escapes Markdown metacharacters in an issue title so it renders as
/// written inside the bullet list.
fn markdown_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '_' | '*' | '`' | '[' | ']' | '<' | '>' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::QuoteEmbedder;
    use crate::embeddocs;
    use crate::githubdocs;
    use crate::secret;
    use crate::storage::MemDB;

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    struct Fixture {
        db: Arc<dyn DB>,
        gh: Arc<Client>,
        vdb: Arc<VectorDB>,
        docs: Corpus,
    }

    async fn fixture_with_issues(bodies: &[(i64, &str, &str)]) -> Fixture {
        let db: Arc<dyn DB> = Arc::new(MemDB::new());
        let gh = Client::new(db.clone(), Arc::new(secret::empty()), reqwest::Client::new());
        gh.enable_testing();
        let gh = Arc::new(gh);
        for (number, title, body) in bodies {
            gh.testing().add_issue(
                "o/r",
                &Issue {
                    number: *number,
                    title: (*title).to_string(),
                    body: (*body).to_string(),
                    created_at: now(),
                    updated_at: now(),
                    state: "open".into(),
                    ..Default::default()
                },
            );
        }
        let docs = Corpus::new(db.clone());
        githubdocs::sync(&docs, &gh);
        let vdb = Arc::new(VectorDB::new(db.clone(), ""));
        embeddocs::sync(&vdb, &QuoteEmbedder, &docs).await;
        Fixture { db, gh, vdb, docs }
    }

    fn poster(fx: &Fixture) -> Poster {
        let mut p = Poster::new(
            fx.db.clone(),
            fx.gh.clone(),
            fx.vdb.clone(),
            fx.docs.clone(),
            "test",
        );
        p.enable_project("o/r");
        p
    }

    #[tokio::test]
    async fn test_posts_related_list() {
        // Eleven issues with identical bodies: the quote embedder maps
        // equal text to equal vectors, so every pair scores 1.0.
        let issues: Vec<(i64, String, &str)> = (1..=11)
            .map(|n| (n, format!("issue {n}"), "same body text"))
            .collect();
        let borrowed: Vec<(i64, &str, &str)> =
            issues.iter().map(|(n, t, b)| (*n, t.as_str(), *b)).collect();
        let fx = fixture_with_issues(&borrowed).await;
        let mut p = poster(&fx);
        p.enable_posts();
        p.run().await;

        let edits = fx.gh.testing().edits();
        // Each of the 11 issues gets a comment listing the other 10.
        assert_eq!(edits.len(), 11);
        let body = &edits[0].comment_changes.as_ref().unwrap().body;
        assert!(body.starts_with("**Similar Issues**\n\n"), "{body}");
        assert_eq!(body.matches("<!-- score=").count(), 10);
        assert_eq!(body.matches(" - [").count(), 10);
        assert!(!body.contains("issues/1)"), "self match listed: {body}");
        assert!(body.contains("<!-- score=1.00000 -->"), "{body}");
        assert!(body.contains("(https://github.com/o/r/issues/2) "), "{body}");
        assert!(body.contains("#2"), "{body}");
    }

    #[tokio::test]
    async fn test_post_idempotent() {
        let fx = fixture_with_issues(&[
            (1, "a", "shared text"),
            (2, "b", "shared text"),
        ])
        .await;
        let mut p = poster(&fx);
        p.enable_posts();
        p.run().await;
        assert_eq!(fx.gh.testing().edits().len(), 2);

        // Same poster again: cursor advanced, nothing reposted.
        fx.gh.testing().clear_edits();
        p.run().await;
        assert!(fx.gh.testing().edits().is_empty());

        // A fresh poster with a fresh name reads everything again, but
        // the posted markers suppress the posts.
        let mut p2 = Poster::new(
            fx.db.clone(),
            fx.gh.clone(),
            fx.vdb.clone(),
            fx.docs.clone(),
            "other",
        );
        p2.enable_project("o/r");
        p2.enable_posts();
        p2.run().await;
        assert!(fx.gh.testing().edits().is_empty());
    }

    #[tokio::test]
    async fn test_no_post_when_disabled() {
        let fx = fixture_with_issues(&[
            (1, "a", "shared text"),
            (2, "b", "shared text"),
        ])
        .await;
        let p = poster(&fx);
        p.run().await;
        assert!(fx.gh.testing().edits().is_empty());
        // Nothing was marked: enabling posts later posts both.
        let mut p = poster(&fx);
        p.enable_posts();
        p.run().await;
        assert_eq!(fx.gh.testing().edits().len(), 2);
    }

    #[tokio::test]
    async fn test_skips_and_filters() {
        let fx = fixture_with_issues(&[
            (1, "ok", "shared text"),
            (2, "release version v1.2", "shared text"),
            (3, "fix thing [backport]", "shared text"),
            (4, "d", "shared text — watchflakes"),
            (5, "e", "unrelated completely different body"),
        ])
        .await;
        let mut p = poster(&fx);
        p.enable_posts();
        p.skip_title_prefix("release version");
        p.skip_title_suffix("[backport]");
        p.skip_body_contains("watchflakes");
        p.run().await;

        let edits = fx.gh.testing().edits();
        // Only issue 1 passes the filters and has neighbors above the
        // cutoff (issue 5's body is dissimilar to everything).
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].issue, 1);
    }

    #[tokio::test]
    async fn test_skips_closed_and_pr_and_old() {
        let db: Arc<dyn DB> = Arc::new(MemDB::new());
        let gh = Client::new(db.clone(), Arc::new(secret::empty()), reqwest::Client::new());
        gh.enable_testing();
        let gh = Arc::new(gh);
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 1,
                title: "closed".into(),
                body: "same".into(),
                created_at: now(),
                state: "closed".into(),
                ..Default::default()
            },
        );
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 2,
                title: "pr".into(),
                body: "same".into(),
                created_at: now(),
                state: "open".into(),
                pull_request: Some(serde_json::json!({})),
                ..Default::default()
            },
        );
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 3,
                title: "old".into(),
                body: "same".into(),
                created_at: "2020-01-01T00:00:00Z".into(),
                state: "open".into(),
                ..Default::default()
            },
        );
        let docs = Corpus::new(db.clone());
        githubdocs::sync(&docs, &gh);
        let vdb = Arc::new(VectorDB::new(db.clone(), ""));
        embeddocs::sync(&vdb, &QuoteEmbedder, &docs).await;

        let mut p = Poster::new(db, gh.clone(), vdb, docs, "test");
        p.enable_project("o/r");
        p.enable_posts();
        p.run().await;
        assert!(gh.testing().edits().is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_missing_embedding() {
        let fx = fixture_with_issues(&[(1, "a", "shared"), (2, "b", "shared")]).await;
        // A new issue arrives after the embedding pass.
        fx.gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 3,
                title: "late".into(),
                body: "shared".into(),
                created_at: now(),
                updated_at: now(),
                state: "open".into(),
                ..Default::default()
            },
        );
        let mut p = poster(&fx);
        p.enable_posts();
        p.run().await;
        // Issues 1 and 2 posted; 3 skipped pending its embedding.
        assert_eq!(fx.gh.testing().edits().len(), 2);

        // After the embedding pipeline catches up, 3 is posted too.
        githubdocs::sync(&fx.docs, &fx.gh);
        embeddocs::sync(&fx.vdb, &QuoteEmbedder, &fx.docs).await;
        fx.gh.testing().clear_edits();
        p.run().await;
        assert_eq!(fx.gh.testing().edits().len(), 1);
        assert_eq!(fx.gh.testing().edits()[0].issue, 3);
    }

    #[test]
    fn test_markdown_escape() {
        assert_eq!(
            markdown_escape("a_b*c`d[e]f<g>h&i"),
            r"a\_b\*c\`d\[e\]f\<g\>h\&i"
        );
        assert_eq!(markdown_escape("plain title"), "plain title");
    }

    #[tokio::test]
    async fn test_delete_posted() {
        let fx = fixture_with_issues(&[(1, "a", "shared"), (2, "b", "shared")]).await;
        let mut p = poster(&fx);
        p.enable_posts();
        p.run().await;
        assert_eq!(fx.gh.testing().edits().len(), 2);
        fx.gh.testing().clear_edits();

        // Clearing the markers and the cursor reposts.
        p.delete_posted();
        let w = fx.gh.event_watcher("related.Poster:test");
        w.restart();
        p.run().await;
        assert_eq!(fx.gh.testing().edits().len(), 2);
    }
}
