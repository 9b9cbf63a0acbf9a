//! # Issuebot
//!
//! **An autonomous maintenance bot for a source-hosting issue
//! tracker.**
//!
//! Issuebot mirrors a project's issue tracker into a local database,
//! derives text documents from the mirror, embeds those documents into
//! a vector index, and uses the result to act on new issues: rewriting
//! issue and comment text according to configured rules, and posting a
//! list of semantically related prior issues.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │   Tracker   │──▶│    Mirror    │──▶│ docs corpus │
//! │  (GitHub)   │   │  (github)    │   │   (docs)    │
//! └─────────────┘   └──────┬───────┘   └──────┬──────┘
//!        ▲                 │                  │ embeddocs
//!        │          event watchers            ▼
//!   edits & posts          │           ┌─────────────┐
//!        │          ┌──────┴──────┐    │ vector store │
//!        └──────────┤ commentfix  │    │  (storage)   │
//!                   │ related ────┼───▶└─────────────┘
//!                   └─────────────┘
//! ```
//!
//! Everything sits on a deliberately small storage substrate:
//!
//! 1. [`ordered`] — tuple keys whose byte order equals tuple order.
//! 2. [`storage`] — an ordered key-value [`storage::DB`] with atomic
//!    batches, end-inclusive range scans, and named locks, plus the
//!    panic-on-corruption failure discipline.
//! 3. [`storage::timed`] — a modification-time index over the store,
//!    and the [`storage::timed::Watcher`] pattern for resumable,
//!    mutually exclusive incremental scans.
//! 4. [`storage::vector`] — persistent vectors with an in-memory
//!    brute-force similarity search.
//!
//! Every external capability — the store itself, the secret provider
//! ([`secret`]), the embedding model ([`embedding`]) — is a trait with
//! an in-memory implementation, so the whole pipeline runs hermetically
//! in tests: the tracker client diverts edits and serves canned pages,
//! and the quote embedder produces deterministic, reversible vectors.
//!
//! The `issuebot` binary wires the pieces into a polling driver loop:
//! sync → derive docs → embed → rewrite → post related.

pub mod commentfix;
pub mod config;
pub mod docs;
pub mod embeddocs;
pub mod embedding;
pub mod github;
pub mod githubdocs;
pub mod ordered;
pub mod related;
pub mod secret;
pub mod storage;
