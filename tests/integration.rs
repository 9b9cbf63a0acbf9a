//! End-to-end test of the bot pipeline over the in-memory engine.
//!
//! Drives the same flow as the binary's run loop — mirror events into
//! storage, derive documents, embed them, rewrite comments, post
//! related issues — entirely against the hermetic test doubles: the
//! in-memory database, the diverted tracker client, and the quote
//! embedder.

use std::sync::Arc;

use issuebot::commentfix::Fixer;
use issuebot::docs::Corpus;
use issuebot::embedding::QuoteEmbedder;
use issuebot::github::{Client, Issue, IssueComment};
use issuebot::related::Poster;
use issuebot::secret;
use issuebot::storage::vector::VectorDB;
use issuebot::storage::{MemDB, DB};
use issuebot::{embeddocs, githubdocs};

struct Harness {
    db: Arc<dyn DB>,
    gh: Arc<Client>,
    corpus: Corpus,
    vdb: Arc<VectorDB>,
}

fn harness() -> Harness {
    let db: Arc<dyn DB> = Arc::new(MemDB::new());
    let gh = Client::new(db.clone(), Arc::new(secret::empty()), reqwest::Client::new());
    gh.enable_testing();
    let gh = Arc::new(gh);
    let corpus = Corpus::new(db.clone());
    let vdb = Arc::new(VectorDB::new(db.clone(), ""));
    Harness {
        db,
        gh,
        corpus,
        vdb,
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn add_issue(h: &Harness, number: i64, title: &str, body: &str) {
    h.gh.testing().add_issue(
        "bot/playground",
        &Issue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            created_at: now(),
            updated_at: now(),
            state: "open".into(),
            ..Default::default()
        },
    );
}

/// One round of the driver pipeline (minus the live tracker sync,
/// which the testing client replaces by writing events directly).
async fn round(h: &Harness, fixer: &Fixer, poster: &Poster) {
    githubdocs::sync(&h.corpus, &h.gh);
    embeddocs::sync(&h.vdb, &QuoteEmbedder, &h.corpus).await;
    fixer.run().await;
    poster.run().await;
}

#[tokio::test]
async fn test_full_pipeline() {
    let h = harness();

    // A burst of issues about the same crash, plus one unrelated.
    // The bodies differ only in their final digit, so the quote
    // embedder scores each issue's own vector strictly highest and the
    // other crash reports just below it.
    for n in 1..=4 {
        add_issue(
            &h,
            n,
            &format!("crash report {n}"),
            &format!("panic observed, see CL 4321 for a start, run {n}"),
        );
    }
    add_issue(&h, 5, "docs typo", "typo");
    h.gh.testing().add_issue_comment(
        "bot/playground",
        1,
        &IssueComment {
            body: "this was cancelled yesterday".into(),
            created_at: now(),
            updated_at: now(),
            ..Default::default()
        },
    );

    let mut fixer = Fixer::new(Some(h.gh.clone()), "links");
    fixer.enable_project("bot/playground");
    fixer.enable_edits();
    fixer
        .auto_link(r"\bCL (\d+)\b", "https://go.dev/cl/$1")
        .unwrap();
    fixer.replace_text("cancelled", "canceled").unwrap();

    let mut poster = Poster::new(
        h.db.clone(),
        h.gh.clone(),
        h.vdb.clone(),
        h.corpus.clone(),
        "related",
    );
    poster.enable_project("bot/playground");
    poster.enable_posts();

    round(&h, &fixer, &poster).await;

    let edits = h.gh.testing().edits();

    // The rewriter linked the CL reference in all four crash bodies
    // and fixed the comment spelling.
    let rewrites: Vec<_> = edits
        .iter()
        .filter(|e| e.comment_changes.is_none() || e.comment != 0)
        .collect();
    assert_eq!(rewrites.len(), 5);
    assert!(rewrites[0]
        .issue_changes
        .as_ref()
        .unwrap()
        .body
        .as_ref()
        .unwrap()
        .contains("[CL 4321](https://go.dev/cl/4321)"));
    let comment_fix = rewrites.last().unwrap();
    assert!(comment_fix.comment != 0);
    assert!(comment_fix
        .comment_changes
        .as_ref()
        .unwrap()
        .body
        .contains("canceled"));

    // The poster commented on each crash issue with the other three;
    // the unrelated issue got nothing (no neighbors above the cutoff).
    let posts: Vec<_> = edits
        .iter()
        .filter(|e| e.comment_changes.is_some() && e.comment == 0)
        .collect();
    assert_eq!(posts.len(), 4);
    for post in &posts {
        let body = &post.comment_changes.as_ref().unwrap().body;
        assert!(body.starts_with("**Similar Issues**"), "{body}");
        assert_eq!(body.matches(" - [").count(), 3, "{body}");
        assert!(body.contains("<!-- score="), "{body}");
        assert!(
            !body.contains(&format!("issues/{})", post.issue)),
            "self link in {body}"
        );
    }
    assert!(!posts.iter().any(|p| p.issue == 5));

    // A second round is quiet: everything has been handled and the
    // posted markers plus watcher cursors survive.
    h.gh.testing().clear_edits();
    round(&h, &fixer, &poster).await;
    assert!(h.gh.testing().edits().is_empty());

    // A new related issue arriving later gets a post listing the
    // earlier ones, fixed text included.
    add_issue(&h, 6, "crash again", "panic observed, see CL 4321 for a start, run 6");
    round(&h, &fixer, &poster).await;
    let edits = h.gh.testing().edits();
    let posts: Vec<_> = edits
        .iter()
        .filter(|e| e.comment_changes.is_some() && e.comment == 0)
        .collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].issue, 6);
    assert_eq!(
        posts[0]
            .comment_changes
            .as_ref()
            .unwrap()
            .body
            .matches(" - [")
            .count(),
        4
    );
}

#[tokio::test]
async fn test_pipeline_survives_watcher_handoff() {
    // Two bot instances sharing one database: each processes what the
    // other has not, never double-posting.
    let h = harness();
    add_issue(&h, 1, "first", "same text");
    add_issue(&h, 2, "second", "same text");

    let make_poster = |h: &Harness| {
        let mut p = Poster::new(
            h.db.clone(),
            h.gh.clone(),
            h.vdb.clone(),
            h.corpus.clone(),
            "related",
        );
        p.enable_project("bot/playground");
        p.enable_posts();
        p
    };

    githubdocs::sync(&h.corpus, &h.gh);
    embeddocs::sync(&h.vdb, &QuoteEmbedder, &h.corpus).await;

    make_poster(&h).run().await;
    let first_count = h.gh.testing().edits().len();
    assert_eq!(first_count, 2);

    // A second instance (fresh poster, same name, same database) sees
    // the shared cursor and does nothing.
    make_poster(&h).run().await;
    assert_eq!(h.gh.testing().edits().len(), first_count);
}
