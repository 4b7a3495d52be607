//! Document fetching.
//!
//! One call, one GET: retry policy belongs to the worker, so a retry is
//! always a fresh session acquisition and counts toward rotation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::identity::IdentityProvider;
use crate::types::FetchError;

/// A fetched, unparsed document.
#[derive(Debug, Clone)]
pub struct Document {
    /// Requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub body: String,
    /// Identity generation the request went out under.
    pub generation: u64,
}

/// Anything that can produce the document for an entity key.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Document, FetchError>;
}

/// Canonical document URL for an entity: `{base}/show/{key}`.
pub fn book_url(base: &str, key: &str) -> String {
    if let Ok(mut url) = url::Url::parse(base) {
        let pushed = match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty().push("show").push(key);
                true
            }
            Err(()) => false,
        };
        if pushed {
            return url.to_string();
        }
    }
    format!("{}/show/{}", base.trim_end_matches('/'), key)
}

/// Fetches entity documents through sessions from the identity provider.
pub struct DocumentFetcher {
    base_url: String,
    identity: Arc<IdentityProvider>,
}

impl DocumentFetcher {
    pub fn new(base_url: impl Into<String>, identity: Arc<IdentityProvider>) -> Self {
        Self {
            base_url: base_url.into(),
            identity,
        }
    }

    pub fn identity(&self) -> &Arc<IdentityProvider> {
        &self.identity
    }
}

#[async_trait]
impl DocumentSource for DocumentFetcher {
    async fn fetch(&self, key: &str) -> Result<Document, FetchError> {
        let url = book_url(&self.base_url, key);
        let session = self.identity.acquire_session().await?;

        let resp = session
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        if !resp.status().is_success() {
            return Err(FetchError::Status { url, status });
        }

        let body = resp.text().await.map_err(|e| transport_error(&url, e))?;
        debug!(
            %url,
            status,
            bytes = body.len(),
            request = session.request_number(),
            "fetched document"
        );

        Ok(Document {
            url,
            final_url,
            status,
            body,
            generation: session.generation(),
        })
    }
}

pub(crate) fn transport_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_url() {
        assert_eq!(
            book_url("https://www.goodreads.com/book", "40042001"),
            "https://www.goodreads.com/book/show/40042001"
        );
    }

    #[test]
    fn test_book_url_trailing_slash() {
        assert_eq!(
            book_url("https://books.example/book/", "7"),
            "https://books.example/book/show/7"
        );
    }

    #[test]
    fn test_book_url_encodes_key() {
        assert_eq!(
            book_url("https://books.example", "a b"),
            "https://books.example/show/a%20b"
        );
    }

    #[test]
    fn test_book_url_is_pure() {
        let a = book_url("http://127.0.0.1:8080/book", "12");
        let b = book_url("http://127.0.0.1:8080/book", "12");
        assert_eq!(a, b);
    }
}
