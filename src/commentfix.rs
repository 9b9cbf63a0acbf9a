//! Rule-based rewriting of issue bodies and comments.
//!
//! A [`Fixer`] holds an ordered list of rewrite rules and applies them
//! to Markdown text. Three rule shapes exist:
//!
//! - [`Fixer::auto_link`] — turn plain text matching a pattern into a
//!   link, except inside existing links.
//! - [`Fixer::replace_text`] — plain-text substitution, applied in
//!   ordinary text (including headings, emphasis, and link text) but
//!   never inside code spans, code blocks, or URLs.
//! - [`Fixer::replace_url`] — rewrite link targets whose URL matches a
//!   pattern anchored at the start; when the link's visible text was
//!   the URL itself, the text is rewritten too.
//!
//! Rules operate on the parsed Markdown event stream, so they cannot
//! corrupt code blocks or markup the way raw string substitution
//! would. [`Fixer::fix`] applies the rules offline; [`Fixer::run`]
//! connects them to the tracker mirror, rewriting new issue bodies and
//! comments as they appear.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use pulldown_cmark::{CowStr, Event, LinkType, Options, Parser, Tag};
use regex::Regex;
use tracing::{error, info};

use crate::github::{self, Client, IssueChanges, IssueCommentChanges, Typed};
use crate::storage::timed::Watcher;

/// A rewriter of issue texts and issue comments.
///
/// Configure rules with [`Fixer::auto_link`], [`Fixer::replace_text`],
/// and [`Fixer::replace_url`], then either call [`Fixer::fix`] on
/// Markdown directly or [`Fixer::run`] to apply the rules to recent
/// tracker activity. Without [`Fixer::enable_edits`], `run` only
/// reports what it would change, and leaves the watcher cursor alone
/// so a later edit-enabled run still sees everything.
pub struct Fixer {
    github: Option<Arc<Client>>,
    watcher: Option<Watcher<github::Event>>,
    rules: Vec<Rule>,
    projects: HashSet<String>,
    edit: bool,
    time_limit: DateTime<Utc>,
}

enum Rule {
    AutoLink { re: Regex, url: String },
    ReplaceText { re: Regex, repl: String },
    ReplaceUrl { re: Regex, repl: String },
}

impl Fixer {
    /// Returns a new fixer watching tracker events through `gh`.
    ///
    /// The name keys the fixer's persistent position: differently
    /// configured fixers need different names. With `gh` absent the
    /// fixer still works offline through [`Fixer::fix`], but
    /// project-related configuration and [`Fixer::run`] panic.
    pub fn new(gh: Option<Arc<Client>>, name: &str) -> Fixer {
        let watcher = gh
            .as_ref()
            .map(|gh| gh.event_watcher(&format!("commentfix.Fixer:{name}")));
        Fixer {
            github: gh,
            watcher,
            rules: Vec::new(),
            projects: HashSet::new(),
            edit: false,
            time_limit: Utc::now() - chrono::Duration::days(30),
        }
    }

    /// Enables rewriting in the given project.
    pub fn enable_project(&mut self, name: &str) {
        assert!(
            self.github.is_some(),
            "commentfix: enable_project without github client"
        );
        self.projects.insert(name.to_string());
    }

    /// Enables applying edits to the tracker. Without this, [`Fixer::run`]
    /// only prints and logs what it would do — useful for gauging a
    /// rule set before trusting it.
    pub fn enable_edits(&mut self) {
        assert!(
            self.github.is_some(),
            "commentfix: enable_edits without github client"
        );
        self.edit = true;
    }

    /// Sets the time before which issues and comments are left alone.
    /// The default is 30 days before the fixer was created.
    pub fn set_time_limit(&mut self, limit: DateTime<Utc>) {
        self.time_limit = limit;
    }

    /// Adds a rule turning text matching `pattern` into a link to
    /// `url`, which may use substitutions like `$1`. Matches inside
    /// existing links are left alone. Fails on an invalid pattern.
    ///
    /// For example, linking CL numbers to the review site:
    ///
    /// ```
    /// # let mut f = issuebot::commentfix::Fixer::new(None, "x");
    /// f.auto_link(r"\bCL (\d+)\b", "https://go.dev/cl/$1").unwrap();
    /// ```
    pub fn auto_link(&mut self, pattern: &str, url: &str) -> Result<()> {
        let re = Regex::new(pattern)?;
        self.rules.push(Rule::AutoLink {
            re,
            url: url.to_string(),
        });
        Ok(())
    }

    /// Adds a rule replacing text matching `pattern` with `repl`
    /// (substitutions like `$1` allowed). Applies to plain text
    /// anywhere, including headings and link text, but never to code
    /// spans, code blocks, or URLs. Fails on an invalid pattern.
    pub fn replace_text(&mut self, pattern: &str, repl: &str) -> Result<()> {
        let re = Regex::new(pattern)?;
        self.rules.push(Rule::ReplaceText {
            re,
            repl: repl.to_string(),
        });
        Ok(())
    }

    /// Adds a rule replacing link URLs matching `pattern` with `repl`.
    /// The pattern is anchored at the start of the URL. When a link's
    /// visible text equals its old URL (autolinks in particular), the
    /// text is updated along with the target. Fails on an invalid
    /// pattern.
    pub fn replace_url(&mut self, pattern: &str, repl: &str) -> Result<()> {
        let re = Regex::new(&format!("\\A(?:{pattern})"))?;
        self.rules.push(Rule::ReplaceUrl {
            re,
            repl: repl.to_string(),
        });
        Ok(())
    }

    /// Applies the configured rules to `text`, returning the rewritten
    /// Markdown, or `None` when no rule changed anything.
    pub fn fix(&self, text: &str) -> Option<String> {
        // No table extension: the rewrite walk covers documents,
        // quotes, lists, headings, and paragraphs only, so table
        // markup stays ordinary paragraph text.
        let opts = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_HEADING_ATTRIBUTES;
        let mut events: Vec<Event> = Parser::new_ext(text, opts).collect();
        let mut changed = false;
        for rule in &self.rules {
            changed |= match rule {
                Rule::AutoLink { re, url } => {
                    let (ev, ch) = apply_auto_link(re, url, std::mem::take(&mut events));
                    events = ev;
                    ch
                }
                Rule::ReplaceText { re, repl } => apply_replace_text(re, repl, &mut events),
                Rule::ReplaceUrl { re, repl } => apply_replace_url(re, repl, &mut events),
            };
        }
        if !changed {
            return None;
        }
        let mut out = String::with_capacity(text.len() + 16);
        if pulldown_cmark_to_cmark::cmark(events.iter(), &mut out).is_err() {
            // unreachable: writing to a String cannot fail
            error!("commentfix markdown serialization failed");
            return None;
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        Some(out)
    }

    /// Applies the configured rules to issue texts and comments
    /// updated since the last edit-enabled run under this fixer's
    /// name.
    ///
    /// Diffs of intended edits go to standard error as well as the
    /// log, because a structured log line holding a multi-line diff is
    /// unreadable. After each applied edit the fixer marks the event
    /// old, flushes, and sleeps one second to stay well inside the
    /// tracker's secondary rate limits.
    ///
    /// Panics if the fixer was built without a tracker client.
    pub async fn run(&self) {
        let gh = self
            .github
            .as_ref()
            .expect("commentfix: run without github client");
        let watcher = self.watcher.as_ref().unwrap();

        let mut it = watcher.recent();
        while let Some(e) = it.next() {
            if !self.projects.contains(&e.project) {
                continue;
            }
            let ic = match &e.typed {
                Typed::Issue(x) => {
                    if x.pull_request.is_some() {
                        // Pull request bodies become commit messages and
                        // must not carry hyperlinks.
                        continue;
                    }
                    IssueOrComment::Issue(x.clone())
                }
                Typed::IssueComment(x) => IssueOrComment::Comment(x.clone()),
                Typed::IssueEvent(_) => continue,
            };
            if let Ok(tm) = DateTime::parse_from_rfc3339(ic.updated_at()) {
                if tm.with_timezone(&Utc) < self.time_limit {
                    if self.edit {
                        it.mark_old(e.db_time);
                    }
                    continue;
                }
            }
            let Some(body) = self.fix(ic.body()) else {
                continue;
            };
            let live = match ic.download(gh).await {
                Ok(live) => live,
                Err(err) => {
                    // unreachable unless tracker error
                    error!(project = %e.project, issue = e.issue, url = %ic.url(), err = %err,
                        "commentfix download error");
                    continue;
                }
            };
            if live.body() != ic.body() {
                info!(project = %e.project, issue = e.issue, url = %ic.url(), "commentfix stale");
                continue;
            }
            let diff = body_diff(ic.body(), &body);
            info!(project = %e.project, issue = e.issue, url = %ic.url(), edit = self.edit,
                diff = %diff, "commentfix rewrite");
            eprintln!("Fix {}:\n{}", ic.url(), diff);
            if self.edit {
                info!(url = %ic.url(), "commentfix editing tracker");
                if let Err(err) = ic.edit_body(gh, &body).await {
                    // unreachable unless tracker error
                    error!(project = %e.project, issue = e.issue, err = %err, "commentfix edit");
                    continue;
                }
                it.mark_old(e.db_time);
                it.flush();
                if !gh.divert_edits() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

enum IssueOrComment {
    Issue(github::Issue),
    Comment(github::IssueComment),
}

impl IssueOrComment {
    fn updated_at(&self) -> &str {
        match self {
            IssueOrComment::Issue(x) => &x.updated_at,
            IssueOrComment::Comment(x) => &x.updated_at,
        }
    }

    fn body(&self) -> &str {
        match self {
            IssueOrComment::Issue(x) => &x.body,
            IssueOrComment::Comment(x) => &x.body,
        }
    }

    fn url(&self) -> &str {
        match self {
            IssueOrComment::Issue(x) => &x.url,
            IssueOrComment::Comment(x) => &x.url,
        }
    }

    async fn download(&self, gh: &Client) -> Result<IssueOrComment> {
        match self {
            IssueOrComment::Issue(x) => {
                Ok(IssueOrComment::Issue(gh.download_issue(&x.url).await?))
            }
            IssueOrComment::Comment(x) => Ok(IssueOrComment::Comment(
                gh.download_issue_comment(&x.url).await?,
            )),
        }
    }

    async fn edit_body(&self, gh: &Client, body: &str) -> Result<()> {
        match self {
            IssueOrComment::Issue(x) => {
                gh.edit_issue(
                    x,
                    &IssueChanges {
                        body: Some(body.to_string()),
                        ..Default::default()
                    },
                )
                .await
            }
            IssueOrComment::Comment(x) => {
                gh.edit_issue_comment(
                    x,
                    &IssueCommentChanges {
                        body: body.to_string(),
                    },
                )
                .await
            }
        }
    }
}

fn owned(s: &str) -> CowStr<'static> {
    CowStr::from(s.to_string())
}

/// Applies one auto-link rule across the event stream, linking plain
/// text outside links and code.
fn apply_auto_link<'a>(re: &Regex, url: &str, events: Vec<Event<'a>>) -> (Vec<Event<'a>>, bool) {
    let mut out = Vec::with_capacity(events.len());
    let mut changed = false;
    let mut link_depth = 0usize;
    let mut code_depth = 0usize;
    for ev in events {
        match &ev {
            Event::Start(Tag::Link(..)) | Event::Start(Tag::Image(..)) => link_depth += 1,
            Event::End(Tag::Link(..)) | Event::End(Tag::Image(..)) => {
                link_depth = link_depth.saturating_sub(1)
            }
            Event::Start(Tag::CodeBlock(..)) => code_depth += 1,
            Event::End(Tag::CodeBlock(..)) => code_depth = code_depth.saturating_sub(1),
            _ => {}
        }
        if link_depth == 0 && code_depth == 0 {
            if let Event::Text(text) = &ev {
                if let Some(linked) = link_text(re, url, text) {
                    changed = true;
                    out.extend(linked);
                    continue;
                }
            }
        }
        out.push(ev);
    }
    (out, changed)
}

/// Splits one text run around its pattern matches, producing link
/// events for each match. Returns `None` when nothing matches.
fn link_text(re: &Regex, url: &str, text: &str) -> Option<Vec<Event<'static>>> {
    let mut out = Vec::new();
    let mut last = 0;
    for cap in re.captures_iter(text) {
        let m = cap.get(0).expect("capture 0 always present");
        if m.start() > last {
            out.push(Event::Text(owned(&text[last..m.start()])));
        }
        let mut dest = String::new();
        cap.expand(url, &mut dest);
        let tag = Tag::Link(LinkType::Inline, owned(&dest), CowStr::from(""));
        out.push(Event::Start(tag.clone()));
        out.push(Event::Text(owned(m.as_str())));
        out.push(Event::End(tag));
        last = m.end();
    }
    if out.is_empty() {
        return None;
    }
    if last < text.len() {
        out.push(Event::Text(owned(&text[last..])));
    }
    Some(out)
}

/// Applies one replace-text rule in place. Code spans are separate
/// event kinds and URLs live inside tags, so skipping code blocks is
/// the only positional state needed.
fn apply_replace_text(re: &Regex, repl: &str, events: &mut [Event<'_>]) -> bool {
    let mut changed = false;
    let mut code_depth = 0usize;
    for ev in events.iter_mut() {
        match ev {
            Event::Start(Tag::CodeBlock(..)) => code_depth += 1,
            Event::End(Tag::CodeBlock(..)) => code_depth = code_depth.saturating_sub(1),
            Event::Text(text) if code_depth == 0 => {
                let replaced = match re.replace_all(text, repl) {
                    std::borrow::Cow::Owned(new) => Some(new),
                    std::borrow::Cow::Borrowed(_) => None,
                };
                if let Some(new) = replaced {
                    *text = CowStr::from(new);
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

/// Applies one replace-url rule in place, rewriting the link tag on
/// both its start and end events, plus the visible text when it
/// mirrored the old URL.
fn apply_replace_url(re: &Regex, repl: &str, events: &mut Vec<Event<'_>>) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < events.len() {
        let link = match &events[i] {
            Event::Start(Tag::Link(ltype, dest, title)) => {
                Some((*ltype, dest.to_string(), title.to_string()))
            }
            _ => None,
        };
        if let Some((ltype, old, title)) = link {
            let new = re.replace(&old, repl).into_owned();
            if new != old {
                changed = true;
                events[i] = Event::Start(Tag::Link(ltype, owned(&new), owned(&title)));
                // Rewrite the matching end tag; the serializer reads
                // the destination from it.
                let mut depth = 0usize;
                let mut j = i + 1;
                let mut end_tag = None;
                while j < events.len() {
                    match &events[j] {
                        Event::Start(Tag::Link(..)) => depth += 1,
                        Event::End(Tag::Link(elt, _, etitle)) => {
                            if depth == 0 {
                                end_tag = Some((*elt, etitle.to_string()));
                                break;
                            }
                            depth -= 1;
                        }
                        _ => {}
                    }
                    j += 1;
                }
                if let Some((elt, etitle)) = end_tag {
                    events[j] = Event::End(Tag::Link(elt, owned(&new), owned(&etitle)));
                }
                // A link whose visible text was the old URL keeps the
                // text in sync with the target.
                if j == i + 2 && matches!(&events[i + 1], Event::Text(t) if t.as_ref() == old) {
                    events[i + 1] = Event::Text(owned(&new));
                }
            }
        }
        i += 1;
    }
    changed
}

/// Renders a unified diff of a body rewrite, normalizing line endings
/// and trailing newlines so the diff shows only real changes.
fn body_diff(old: &str, new: &str) -> String {
    let normalize = |s: &str| format!("{}\n", s.trim_end_matches('\n').replace("\r\n", "\n"));
    let old = normalize(old);
    let new = normalize(new);
    let diff = similar::TextDiff::from_lines(old.as_str(), new.as_str());
    diff.unified_diff().header("old", "new").to_string()
}
