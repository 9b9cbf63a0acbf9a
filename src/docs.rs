//! A corpus of text documents identified by document IDs.
//!
//! Documents (an ID — conventionally a URL — plus a title and text)
//! are stored in timed storage under kind `"docs.Doc"`:
//!
//! ```text
//! ("docs.Doc", id)            → (modtime, title, text)
//! ("docs.DocByTime", modtime, id) → ()
//! ```
//!
//! The by-time index lets downstream consumers (the embedding
//! pipeline) process only documents added or changed since their last
//! scan, via [`Corpus::docs_after`] or a [`Corpus::doc_watcher`].

use std::sync::Arc;

use crate::okey;
use crate::ordered::{self, Elem};
use crate::storage::timed::{self, DBTime, Entry, Watcher};
use crate::storage::{fmt, DB};

const KIND: &str = "docs.Doc";

/// The collection of documents stored in a database.
#[derive(Clone)]
pub struct Corpus {
    db: Arc<dyn DB>,
}

/// A single document in the corpus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Doc {
    /// Database time when the document was last written.
    pub db_time: DBTime,
    /// Document identifier, such as a URL.
    pub id: String,
    /// Title of the document.
    pub title: String,
    /// Text of the document.
    pub text: String,
}

fn decode_doc(db: &dyn DB, t: &Entry) -> Doc {
    let id = match ordered::decode(&t.key) {
        Ok(elems) => elems.first().and_then(|e| e.as_str()).map(str::to_string),
        Err(_) => None,
    };
    let Some(id) = id else {
        // unreachable unless corrupt storage
        db.panic_corrupt("docs decode key", &[("key", &fmt(&t.key))]);
    };
    let (title, text) = match ordered::decode(&t.val) {
        Ok(elems) if elems.len() == 2 => match (elems[0].as_str(), elems[1].as_str()) {
            (Some(title), Some(text)) => (title.to_string(), text.to_string()),
            _ => db.panic_corrupt("docs decode value", &[("key", &fmt(&t.key))]),
        },
        _ => db.panic_corrupt("docs decode value", &[("key", &fmt(&t.key))]),
    };
    Doc {
        db_time: t.mod_time,
        id,
        title,
        text,
    }
}

impl Corpus {
    /// Returns the corpus of documents stored in `db`.
    pub fn new(db: Arc<dyn DB>) -> Corpus {
        Corpus { db }
    }

    /// Returns the document with the given id, if present.
    pub fn get(&self, id: &str) -> Option<Doc> {
        let t = timed::get(&*self.db, KIND, &okey!(id))?;
        Some(decode_doc(&*self.db, &t))
    }

    /// Adds a document with the given id, title, and text.
    ///
    /// If the document already exists with the same title and text
    /// this is a no-op, so re-adding unchanged content does not bump
    /// its modtime and cause downstream re-processing.
    pub fn add(&self, id: &str, title: &str, text: &str) {
        if let Some(old) = self.get(id) {
            if old.title == title && old.text == text {
                return;
            }
        }
        let mut b = self.db.batch();
        timed::set(&*self.db, &mut *b, KIND, &okey!(id), &okey!(title, text));
        b.apply();
    }

    /// Returns an iterator over all documents whose IDs start with
    /// `prefix`, ordered by ID.
    pub fn docs(&self, prefix: &str) -> impl Iterator<Item = Doc> + '_ {
        // 0xFF never occurs in UTF-8, so prefix+0xFF is an inclusive
        // upper bound covering every id extending the prefix.
        let mut end = prefix.as_bytes().to_vec();
        end.push(0xFF);
        let db = &*self.db;
        timed::scan(db, KIND, &okey!(prefix), &okey!(Elem::Bytes(end)))
            .map(move |t| decode_doc(db, &t))
    }

    /// Returns an iterator over documents with modtime greater than
    /// `t` and IDs starting with `prefix`, ordered by modtime. The
    /// prefix test runs against the index row alone, before the
    /// document is loaded.
    pub fn docs_after(&self, t: DBTime, prefix: &str) -> impl Iterator<Item = Doc> + '_ {
        let db = &*self.db;
        let filter: Option<Box<dyn Fn(&[u8]) -> bool + Send>> = if prefix.is_empty() {
            None
        } else {
            let prefix = prefix.to_string();
            let db = self.db.clone();
            Some(Box::new(move |key: &[u8]| {
                let id = match ordered::decode(key) {
                    Ok(elems) => elems.first().and_then(|e| e.as_str()).map(str::to_string),
                    Err(_) => None,
                };
                match id {
                    Some(id) => id.starts_with(&prefix),
                    // unreachable unless corrupt storage
                    None => db.panic_corrupt("docs filter decode", &[("key", &fmt(key))]),
                }
            }))
        };
        timed::scan_after(db, KIND, t, filter).map(move |t| decode_doc(db, &t))
    }

    /// Returns a new document [`Watcher`] with the given name,
    /// resuming wherever any previous watcher of that name left off.
    pub fn doc_watcher(&self, name: &str) -> Watcher<Doc> {
        let db = self.db.clone();
        Watcher::new(self.db.clone(), name, KIND, move |e| decode_doc(&*db, e))
    }
}
