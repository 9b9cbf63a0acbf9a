//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait plus two implementations:
//!
//! - **[`OpenAIEmbedder`]** — calls the OpenAI embeddings API with
//!   batching, retry, and exponential backoff.
//! - **[`QuoteEmbedder`]** — a deterministic test double that copies a
//!   prefix of the text into a unit vector; semantically useless but
//!   exact, which makes vector-search tests self-checking.
//!
//! Also defines [`Vector`], the embedding vector type, with the
//! big-endian `f32` byte codec used by the vector store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::secret::SecretDB;

/// A single document to be embedded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbedDoc {
    pub title: String,
    pub text: String,
}

/// An embedding vector; by contract, unit length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vector(pub Vec<f32>);

impl Vector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dot product of `self` and `other`, over the shorter of the two.
    /// For unit vectors this is the cosine similarity.
    pub fn dot(&self, other: &Vector) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| f64::from(*a) * f64::from(*b))
            .sum()
    }

    /// Byte encoding suitable for database storage: each component as
    /// four big-endian bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * self.0.len());
        for f in &self.0 {
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        out
    }

    /// Reverses [`Vector::encode`]. Trailing bytes beyond a multiple
    /// of four are ignored.
    pub fn decode(enc: &[u8]) -> Vector {
        Vector(
            enc.chunks_exact(4)
                .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
        )
    }
}

/// Error from [`Embedder::embed_docs`], carrying whatever prefix of
/// vectors was produced before the failure.
///
/// The embedding pipeline writes the prefix (those embeddings are
/// valid and paid for) and retries the remainder on its next run.
#[derive(Debug)]
pub struct EmbedError {
    /// Vectors for a prefix of the requested documents.
    pub partial: Vec<Vector>,
    /// The underlying failure.
    pub source: anyhow::Error,
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "embedding failed after {} vectors: {}",
            self.partial.len(),
            self.source
        )
    }
}

impl std::error::Error for EmbedError {}

/// Computes vector embeddings for a batch of documents.
///
/// Implementations with an internal batch-size limit make multiple
/// requests to cover the whole input. On failure partway through, the
/// error carries the vectors already produced. Every returned vector
/// is unit length.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_docs(&self, docs: &[EmbedDoc]) -> Result<Vec<Vector>, EmbedError>;
}

// ============ OpenAI provider ============

/// Embedding provider backed by the OpenAI embeddings API.
///
/// Batch size, retry count, request timeout, and the optional expected
/// dimensionality all come from the `[embedding]` configuration. The
/// API key comes from the secret database under `"api.openai.com"`; a
/// netrc-sourced `user:key` value is accepted and the part after the
/// colon is used.
pub struct OpenAIEmbedder {
    model: String,
    dims: Option<usize>,
    batch_size: usize,
    max_retries: u32,
    secret: Arc<dyn SecretDB>,
    http: reqwest::Client,
}

impl OpenAIEmbedder {
    /// Creates a provider from the embedding configuration.
    ///
    /// Fails when `model` is unset or the HTTP client cannot be built.
    pub fn new(config: &EmbeddingConfig, secret: Arc<dyn SecretDB>) -> Result<OpenAIEmbedder> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(OpenAIEmbedder {
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            secret,
            http,
        })
    }

    fn api_key(&self) -> Result<String> {
        let raw = self
            .secret
            .get("api.openai.com")
            .ok_or_else(|| anyhow!("no secret for api.openai.com"))?;
        // netrc values look like "user:key"; bare keys pass through.
        Ok(raw
            .split_once(':')
            .map(|(_, key)| key.to_string())
            .unwrap_or(raw))
    }

    /// One embeddings API call, with retry on rate limits, server
    /// errors, and transport errors. Other client errors fail
    /// immediately.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let key = self.api_key()?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vecs = parse_openai_response(&json)?;
                        check_dims(&vecs, self.dims)?;
                        return Ok(vecs);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("embeddings API error {status}: {text}"));
                        continue;
                    }
                    return Err(anyhow!("embeddings API error {status}: {text}"));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
    }
}

/// Verifies every vector matches the configured dimensionality, when
/// one is configured. A wrong-width vector means the model or the
/// dims setting is misconfigured.
fn check_dims(vecs: &[Vector], dims: Option<usize>) -> Result<()> {
    let Some(dims) = dims else {
        return Ok(());
    };
    for v in vecs {
        if v.len() != dims {
            bail!("embeddings API returned {} dims, want {dims}", v.len());
        }
    }
    Ok(())
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vector>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data array"))?;
    let mut vecs = Vec::with_capacity(data.len());
    for item in data {
        let emb = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid embeddings response: missing embedding"))?;
        vecs.push(Vector(
            emb.iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        ));
    }
    Ok(vecs)
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed_docs(&self, docs: &[EmbedDoc]) -> Result<Vec<Vector>, EmbedError> {
        let mut vecs: Vec<Vector> = Vec::with_capacity(docs.len());
        for chunk in docs.chunks(self.batch_size) {
            let texts: Vec<String> = chunk
                .iter()
                .map(|d| {
                    if d.title.is_empty() {
                        d.text.clone()
                    } else {
                        format!("{}\n\n{}", d.title, d.text)
                    }
                })
                .collect();
            match self.embed_batch(&texts).await {
                Ok(batch) => vecs.extend(batch),
                Err(source) => {
                    return Err(EmbedError {
                        partial: vecs,
                        source,
                    })
                }
            }
        }
        Ok(vecs)
    }
}

// ============ Quote embedder (test double) ============

const QUOTE_LEN: usize = 123;

/// An [`Embedder`] that quotes up to the first 122 bytes of each
/// document's text directly into a 123-element unit vector.
///
/// Useless for real similarity, but deterministic and reversible (see
/// [`unquote_vector`]), which lets tests assert exactly which document
/// a stored vector came from without depending on a live model.
pub struct QuoteEmbedder;

/// Quotes `text` into a unit vector. The text ends at the first
/// negative entry; the final entry is forced negative before
/// normalization so the scale can be recovered.
fn quote(text: &str) -> Vector {
    let bytes = text.as_bytes();
    let mut v = vec![0f32; QUOTE_LEN];
    let mut d = 0f64;
    for (i, slot) in v.iter_mut().enumerate().take(QUOTE_LEN - 1) {
        let Some(&b) = bytes.get(i) else { break };
        *slot = f32::from(b) / 256.0;
        d += f64::from(*slot) * f64::from(*slot);
    }
    if bytes.len() + 1 < QUOTE_LEN {
        v[bytes.len()] = -1.0;
        d += 1.0;
    }
    v[QUOTE_LEN - 1] = -1.0;
    d += 1.0;

    let scale = (1.0 / d.sqrt()) as f32;
    for f in &mut v {
        *f *= scale;
    }
    Vector(v)
}

/// Recovers the text prefix quoted into `v` by [`QuoteEmbedder`].
/// Panics if `v` is not a quotation vector.
pub fn unquote_vector(v: &Vector) -> String {
    assert_eq!(v.len(), QUOTE_LEN, "unquote of non-quotation vector");
    let d = -1.0 / v.0[QUOTE_LEN - 1];
    let mut b = Vec::new();
    for &f in &v.0 {
        if f < 0.0 {
            break;
        }
        b.push((256.0 * f * d + 0.5) as u8);
    }
    String::from_utf8_lossy(&b).into_owned()
}

#[async_trait]
impl Embedder for QuoteEmbedder {
    async fn embed_docs(&self, docs: &[EmbedDoc]) -> Result<Vec<Vector>, EmbedError> {
        Ok(docs.iter().map(|d| quote(&d.text)).collect())
    }
}
