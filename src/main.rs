//! # Issuebot CLI
//!
//! The `issuebot` binary drives the bot. Every command reads the TOML
//! configuration named by `--config`.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `issuebot add-project <owner/repo>` | Register a project for mirroring |
//! | `issuebot sync` | Mirror tracker state into the local database |
//! | `issuebot embed` | Derive documents from the mirror and embed them |
//! | `issuebot fix` | Apply the comment-rewrite rules to recent activity |
//! | `issuebot related` | Post related-issue lists on recent issues |
//! | `issuebot search` | Interactive similarity search over the index |
//! | `issuebot run` | The full loop: sync → embed → fix → related, forever |
//!
//! Whether `fix` edits and `related` posts is controlled by the
//! `fix.edit` and `related.post` config keys; both default to dry-run.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use issuebot::commentfix::Fixer;
use issuebot::config::{self, Config};
use issuebot::docs::Corpus;
use issuebot::embedding::{EmbedDoc, Embedder, OpenAIEmbedder, QuoteEmbedder};
use issuebot::github::Client;
use issuebot::related::Poster;
use issuebot::secret::{self, SecretDB};
use issuebot::storage::disk::SledDB;
use issuebot::storage::vector::VectorDB;
use issuebot::storage::DB;
use issuebot::{embeddocs, githubdocs};

#[derive(Parser)]
#[command(
    name = "issuebot",
    about = "An autonomous maintenance bot for a source-hosting issue tracker",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./issuebot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project ("owner/repo") for mirroring.
    AddProject {
        /// Project name, like "golang/go".
        project: String,
    },

    /// Mirror tracker state for all registered projects.
    Sync,

    /// Derive documents from mirrored issues and embed them.
    Embed,

    /// Apply comment-rewrite rules to recent issues and comments.
    ///
    /// Dry-run unless fix.edit is set in the configuration.
    Fix,

    /// Post related-issue lists on recently filed issues.
    ///
    /// Dry-run unless related.post is set in the configuration.
    Related,

    /// Interactive similarity search: reads queries from stdin and
    /// prints the closest indexed documents with scores.
    Search,

    /// Run the full bot loop until interrupted.
    Run,
}

/// Everything a command needs, built once from the configuration.
struct Bot {
    cfg: Config,
    db: Arc<dyn DB>,
    gh: Arc<Client>,
    corpus: Corpus,
    vdb: Arc<VectorDB>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Bot {
    fn open(cfg: Config) -> Result<Bot> {
        let db: Arc<dyn DB> = Arc::new(SledDB::open(&cfg.db.path)?);
        let secrets: Arc<dyn SecretDB> = Arc::new(secret::netrc(cfg.secret.netrc.as_deref()));
        let gh = Arc::new(Client::new(
            db.clone(),
            secrets.clone(),
            reqwest::Client::new(),
        ));
        let corpus = Corpus::new(db.clone());
        let vdb = Arc::new(VectorDB::new(db.clone(), ""));
        let embedder: Option<Arc<dyn Embedder>> = match cfg.embedding.provider.as_str() {
            "openai" => Some(Arc::new(OpenAIEmbedder::new(&cfg.embedding, secrets)?)),
            "quote" => Some(Arc::new(QuoteEmbedder)),
            _ => None,
        };
        Ok(Bot {
            cfg,
            db,
            gh,
            corpus,
            vdb,
            embedder,
        })
    }

    fn fixer(&self) -> Result<Fixer> {
        let fc = &self.cfg.fix;
        let mut f = Fixer::new(Some(self.gh.clone()), &fc.name);
        for project in &self.cfg.github.projects {
            f.enable_project(project);
        }
        if fc.edit {
            f.enable_edits();
        }
        for rule in &fc.autolinks {
            f.auto_link(&rule.pattern, &rule.url)?;
        }
        for rule in &fc.replacements {
            f.replace_text(&rule.pattern, &rule.with)?;
        }
        for rule in &fc.url_replacements {
            f.replace_url(&rule.pattern, &rule.with)?;
        }
        Ok(f)
    }

    fn poster(&self) -> Poster {
        let rc = &self.cfg.related;
        let mut p = Poster::new(
            self.db.clone(),
            self.gh.clone(),
            self.vdb.clone(),
            self.corpus.clone(),
            &rc.name,
        );
        for project in &self.cfg.github.projects {
            p.enable_project(project);
        }
        if rc.post {
            p.enable_posts();
        }
        p.set_max_results(rc.max_results);
        p.set_min_score(rc.min_score);
        for text in &rc.skip_body_contains {
            p.skip_body_contains(text);
        }
        for prefix in &rc.skip_title_prefixes {
            p.skip_title_prefix(prefix);
        }
        for suffix in &rc.skip_title_suffixes {
            p.skip_title_suffix(suffix);
        }
        p
    }

    async fn embed(&self) {
        githubdocs::sync(&self.corpus, &self.gh);
        match &self.embedder {
            Some(embedder) => embeddocs::sync(&self.vdb, embedder.as_ref(), &self.corpus).await,
            None => info!("embedding disabled; skipping"),
        }
    }

    async fn search_loop(&self) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            anyhow::bail!("search requires an embedding provider");
        };
        let stdin = std::io::stdin();
        loop {
            eprint!("> ");
            std::io::stderr().flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(());
            }
            let query = line.trim();
            if query.is_empty() {
                continue;
            }
            let vecs = match embedder
                .embed_docs(&[EmbedDoc {
                    title: String::new(),
                    text: query.to_string(),
                }])
                .await
            {
                Ok(vecs) => vecs,
                Err(e) => {
                    eprintln!("error: {e}");
                    continue;
                }
            };
            let Some(vec) = vecs.first() else { continue };
            for r in self.vdb.search(vec, 20) {
                let title = self
                    .corpus
                    .get(&r.id)
                    .map(|d| d.title)
                    .unwrap_or_else(|| "?".to_string());
                println!(" {:.5} {} # {}", r.score, r.id, title);
            }
        }
    }

    /// One full round of the bot: sync, derive and embed documents,
    /// rewrite, post. Each stage's errors are logged; the round always
    /// runs to the end so one failing stage cannot starve the others.
    async fn round(&self, fixer: &Fixer, poster: &Poster) {
        if let Err(e) = self.gh.sync().await {
            error!(err = %e, "tracker sync failed");
        }
        self.embed().await;
        fixer.run().await;
        poster.run().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let bot = Bot::open(cfg)?;

    match cli.command {
        Commands::AddProject { project } => {
            bot.gh.add(&project)?;
            println!("added {project}");
        }
        Commands::Sync => {
            bot.gh.sync().await?;
        }
        Commands::Embed => {
            bot.embed().await;
        }
        Commands::Fix => {
            bot.fixer()?.run().await;
        }
        Commands::Related => {
            bot.poster().run().await;
        }
        Commands::Search => {
            bot.search_loop().await?;
        }
        Commands::Run => {
            let fixer = bot.fixer()?;
            let poster = bot.poster();
            let period = Duration::from_secs(bot.cfg.bot.poll_seconds);
            loop {
                bot.round(&fixer, &poster).await;
                tokio::time::sleep(period).await;
            }
        }
    }

    bot.db.flush();
    Ok(())
}
