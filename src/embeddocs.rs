//! Embedding new corpus documents into the vector store.
//!
//! There is very little here by design: the document corpus knows what
//! is new (its watcher), the embedder turns documents into vectors,
//! and the vector store persists them. This module just moves data
//! between the three in batches, with careful ordering so that a crash
//! or embedder failure never marks a document processed before its
//! vector is stored.

use tracing::{debug, error, info};

use crate::docs::{Corpus, Doc};
use crate::embedding::{EmbedDoc, Embedder};
use crate::storage::timed::{DBTime, Recent};
use crate::storage::vector::VectorDB;

/// Documents per embedder call.
const BATCH_SIZE: usize = 100;

/// Reads new documents from `corpus`, embeds them with `embed`, and
/// writes the resulting vectors to `vdb`.
///
/// Position is kept by the corpus watcher named `"embeddocs"`, so
/// repeated calls (and calls across restarts) process each document
/// once. The watcher cursor only advances after a batch's vectors are
/// flushed to the vector store; on embedder failure the produced
/// prefix is written, the error is logged, and the sync stops — the
/// unmarked remainder is retried on the next run.
pub async fn sync(vdb: &VectorDB, embed: &dyn Embedder, corpus: &Corpus) {
    info!("embeddocs sync");

    let w = corpus.doc_watcher("embeddocs");
    let mut batch: Vec<EmbedDoc> = Vec::new();
    let mut ids: Vec<String> = Vec::new();
    let mut batch_last = DBTime(0);

    {
        let mut it = w.recent();
        while let Some(d) = it.next() {
            debug!(doc = %d.id, "embeddocs sync doc");
            batch.push(EmbedDoc {
                title: d.title,
                text: d.text,
            });
            ids.push(d.id);
            batch_last = d.db_time;
            if batch.len() >= BATCH_SIZE
                && !flush(vdb, embed, &mut it, &mut batch, &mut ids, batch_last).await
            {
                return;
            }
        }
    }

    if !batch.is_empty() {
        // The final partial batch still has to be flushed, and flush
        // calls mark_old, which is only valid while the watcher lock
        // is held. Start a fresh iteration just to get that locked
        // context, flush, and drop it.
        let mut it = w.recent();
        flush(vdb, embed, &mut it, &mut batch, &mut ids, batch_last).await;
    }
}

/// Embeds and writes one accumulated batch, advancing the watcher on
/// success. Reports whether the sync should continue.
async fn flush(
    vdb: &VectorDB,
    embed: &dyn Embedder,
    it: &mut Recent<'_, Doc>,
    batch: &mut Vec<EmbedDoc>,
    ids: &mut Vec<String>,
    batch_last: DBTime,
) -> bool {
    let (vecs, err) = match embed.embed_docs(batch).await {
        Ok(vecs) => (vecs, None),
        Err(e) => {
            let partial = e.partial;
            let source = e.source;
            (partial, Some(source))
        }
    };
    if vecs.len() > ids.len() {
        // More vectors than documents: something is badly wrong with
        // the embedder. Refuse to guess at an alignment.
        error!(
            batch = batch.len(),
            vecs = vecs.len(),
            ids = ids.len(),
            "embeddocs length mismatch"
        );
        return false;
    }
    let mut vb = vdb.batch();
    for (id, vec) in ids.iter().zip(vecs.iter()) {
        vb.set(id, vec);
    }
    vb.apply();
    if let Some(err) = err {
        error!(err = %err, "embeddocs embedder error");
        return false;
    }
    if vecs.len() != ids.len() {
        error!(
            batch = batch.len(),
            vecs = vecs.len(),
            ids = ids.len(),
            "embeddocs length mismatch"
        );
        return false;
    }
    vdb.flush();
    it.mark_old(batch_last);
    it.flush();
    batch.clear();
    ids.clear();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{unquote_vector, EmbedError, QuoteEmbedder, Vector};
    use crate::storage::{MemDB, DB};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn fixture() -> (Arc<dyn DB>, Corpus, VectorDB) {
        let db: Arc<dyn DB> = Arc::new(MemDB::new());
        let corpus = Corpus::new(db.clone());
        let vdb = VectorDB::new(db.clone(), "");
        (db, corpus, vdb)
    }

    #[tokio::test]
    async fn test_sync_embeds_all_docs() {
        let (_db, corpus, vdb) = fixture();
        for i in 0..250 {
            corpus.add(&format!("doc/{i:03}"), "t", &format!("text {i}"));
        }
        sync(&vdb, &QuoteEmbedder, &corpus).await;
        for i in 0..250 {
            let v = vdb.get(&format!("doc/{i:03}")).unwrap();
            assert_eq!(unquote_vector(&v), format!("text {i}"));
        }
        // A second sync sees nothing new.
        sync(&vdb, &QuoteEmbedder, &corpus).await;
        // And a changed doc is re-embedded.
        corpus.add("doc/000", "t", "changed");
        sync(&vdb, &QuoteEmbedder, &corpus).await;
        assert_eq!(unquote_vector(&vdb.get("doc/000").unwrap()), "changed");
    }

    /// Embedder returning more vectors than documents.
    struct OverEmbedder;

    #[async_trait]
    impl Embedder for OverEmbedder {
        async fn embed_docs(&self, docs: &[EmbedDoc]) -> Result<Vec<Vector>, EmbedError> {
            Ok(vec![Vector(vec![1.0]); docs.len() + 1])
        }
    }

    #[tokio::test]
    async fn test_sync_refuses_count_mismatch() {
        let (_db, corpus, vdb) = fixture();
        corpus.add("doc/a", "t", "a");
        sync(&vdb, &OverEmbedder, &corpus).await;
        // Nothing written, nothing marked old.
        assert!(vdb.get("doc/a").is_none());
        sync(&vdb, &QuoteEmbedder, &corpus).await;
        assert!(vdb.get("doc/a").is_some());
    }

    /// Embedder failing after a fixed number of vectors.
    struct PartialEmbedder {
        succeed: usize,
    }

    #[async_trait]
    impl Embedder for PartialEmbedder {
        async fn embed_docs(&self, docs: &[EmbedDoc]) -> Result<Vec<Vector>, EmbedError> {
            let quote = QuoteEmbedder.embed_docs(docs).await.unwrap();
            Err(EmbedError {
                partial: quote.into_iter().take(self.succeed).collect(),
                source: anyhow!("quota exhausted"),
            })
        }
    }

    #[tokio::test]
    async fn test_sync_writes_prefix_on_embedder_error() {
        let (_db, corpus, vdb) = fixture();
        corpus.add("doc/a", "t", "a");
        corpus.add("doc/b", "t", "b");
        corpus.add("doc/c", "t", "c");
        sync(&vdb, &PartialEmbedder { succeed: 2 }, &corpus).await;
        // The prefix was written...
        assert!(vdb.get("doc/a").is_some());
        assert!(vdb.get("doc/b").is_some());
        assert!(vdb.get("doc/c").is_none());
        // ...but the cursor did not advance, so a healthy run
        // re-embeds everything still pending.
        sync(&vdb, &QuoteEmbedder, &corpus).await;
        assert!(vdb.get("doc/c").is_some());
    }
}
