//! Converting mirrored issues into corpus documents.

use tracing::debug;

use crate::docs::Corpus;
use crate::github::{Client, Typed};

/// Writes to `dc` one document per issue that is new in `gh` since the
/// last call.
///
/// Only the issue body (the top comment in the UI) becomes document
/// text; the document ID is the issue's public URL,
/// `https://github.com/<org>/<repo>/issues/<n>`. An issue edited on
/// the tracker shows up as new again and its document is replaced; the
/// corpus skips the write when nothing actually changed.
pub fn sync(dc: &Corpus, gh: &Client) {
    let w = gh.event_watcher("githubdocs");
    let mut it = w.recent();
    while let Some(e) = it.next() {
        let Typed::Issue(issue) = &e.typed else {
            continue;
        };
        debug!(issue = e.issue, dbtime = e.db_time.0, "githubdocs sync");
        let id = format!("https://github.com/{}/issues/{}", e.project, e.issue);
        dc.add(&id, &issue.title, &issue.body);
        it.mark_old(e.db_time);
    }
}

/// Makes the next [`sync`] behave as if no issue had ever been
/// converted: every issue becomes a document again, and unchanged ones
/// land as no-ops in the corpus.
pub fn restart(gh: &Client) {
    gh.event_watcher("githubdocs").restart();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::Issue;
    use crate::secret;
    use crate::storage::{MemDB, DB};
    use std::sync::Arc;

    fn fixture() -> (Arc<Client>, Corpus) {
        let db: Arc<dyn DB> = Arc::new(MemDB::new());
        let gh = Client::new(db.clone(), Arc::new(secret::empty()), reqwest::Client::new());
        gh.enable_testing();
        (Arc::new(gh), Corpus::new(db))
    }

    #[test]
    fn test_sync_converts_issues() {
        let (gh, dc) = fixture();
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 1,
                title: "first".into(),
                body: "body one".into(),
                ..Default::default()
            },
        );
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 2,
                title: "second".into(),
                body: "body two".into(),
                ..Default::default()
            },
        );
        sync(&dc, &gh);
        let d = dc.get("https://github.com/o/r/issues/1").unwrap();
        assert_eq!(d.title, "first");
        assert_eq!(d.text, "body one");
        assert_eq!(dc.docs("").count(), 2);

        // Nothing new: no document changes.
        let t = dc.get("https://github.com/o/r/issues/2").unwrap().db_time;
        sync(&dc, &gh);
        assert_eq!(dc.get("https://github.com/o/r/issues/2").unwrap().db_time, t);
    }

    #[test]
    fn test_edited_issue_replaces_doc() {
        let (gh, dc) = fixture();
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 1,
                title: "title".into(),
                body: "old".into(),
                ..Default::default()
            },
        );
        sync(&dc, &gh);
        // The issue is edited: the mirror re-downloads it as a new
        // event under the same key.
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 1,
                title: "title".into(),
                body: "new".into(),
                ..Default::default()
            },
        );
        sync(&dc, &gh);
        assert_eq!(dc.get("https://github.com/o/r/issues/1").unwrap().text, "new");
        assert_eq!(dc.docs("").count(), 1);
    }

    #[test]
    fn test_restart_reconverts() {
        let (gh, dc) = fixture();
        gh.testing().add_issue(
            "o/r",
            &Issue {
                number: 1,
                title: "t".into(),
                body: "b".into(),
                ..Default::default()
            },
        );
        sync(&dc, &gh);
        let t = dc.get("https://github.com/o/r/issues/1").unwrap().db_time;
        restart(&gh);
        sync(&dc, &gh);
        // Unchanged content: the corpus write was a no-op.
        assert_eq!(dc.get("https://github.com/o/r/issues/1").unwrap().db_time, t);
    }
}
