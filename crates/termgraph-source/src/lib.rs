//! Source adapter contract for termgraph.
//!
//! Every vocabulary (and every annotation / cross-map source) is read through
//! one [`SourceAdapter`]:
//!
//! - `fetch` downloads one release into a [`Payload`] (may fail with
//!   `SourceUnavailable` or `SourceFormatChanged`);
//! - `parse` turns a payload into a lazy, finite stream of [`RawRecord`]s.
//!
//! Parsing borrows the payload, so a failed pass can be restarted from the
//! same bytes (optionally skipping records already consumed) without fetching
//! again. Format-specific adapters live in the `termgraph-ingest-*` crates.

pub mod fetch;
pub mod record;

use async_trait::async_trait;

pub use fetch::{
    verify_checksum, with_retry, CredentialKey, CredentialUse, Fetcher, Payload, RetryPolicy,
    SourceDescriptor,
};
pub use record::{RawRecord, RawValue};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network, auth, or I/O failure while fetching.
    #[error("source `{source_name}` unavailable: {reason}")]
    Unavailable {
        source_name: String,
        reason: String,
        retryable: bool,
    },

    /// Checksum or schema no longer matches what the adapter expects.
    #[error("source `{source_name}` format changed: {reason}")]
    FormatChanged { source_name: String, reason: String },

    /// A single record could not be read; the stream continues.
    #[error("malformed record at {locator}: {reason}")]
    MalformedRecord { locator: String, reason: String },
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable { retryable: true, .. })
    }

    /// Record-level errors are quarantined; everything else fails the source.
    pub fn is_record_level(&self) -> bool {
        matches!(self, SourceError::MalformedRecord { .. })
    }

    pub fn format_changed(source_name: &str, reason: impl Into<String>) -> Self {
        SourceError::FormatChanged {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::MalformedRecord {
            locator: locator.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Adapter contract
// ============================================================================

/// Lazy record stream borrowed from a payload.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<RawRecord, SourceError>> + Send + 'a>;

/// Per-format reader for one release.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Vocabulary or cross-map source name.
    fn name(&self) -> &str;

    /// Download the release.
    async fn fetch(&self) -> Result<Payload, SourceError>;

    /// Stream raw records out of a fetched payload.
    ///
    /// Whole-payload problems (unreadable encoding, missing required columns)
    /// return `FormatChanged`; per-record problems are yielded as
    /// `MalformedRecord` items.
    fn parse<'a>(&'a self, payload: &'a Payload) -> Result<RecordStream<'a>, SourceError>;

    /// Resume a stream after the first `consumed` records.
    fn parse_from<'a>(
        &'a self,
        payload: &'a Payload,
        consumed: usize,
    ) -> Result<RecordStream<'a>, SourceError> {
        Ok(Box::new(self.parse(payload)?.skip(consumed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<RawRecord>);

    #[async_trait]
    impl SourceAdapter for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self) -> Result<Payload, SourceError> {
            Ok(Payload::from_bytes("fixed", "<memory>", Vec::new(), None))
        }

        fn parse<'a>(&'a self, _payload: &'a Payload) -> Result<RecordStream<'a>, SourceError> {
            Ok(Box::new(self.0.iter().cloned().map(Ok)))
        }
    }

    #[tokio::test]
    async fn parse_is_restartable() {
        let adapter = Fixed(vec![RawRecord::new("a"), RawRecord::new("b"), RawRecord::new("c")]);
        let payload = adapter.fetch().await.unwrap();

        let first: Vec<_> = adapter.parse(&payload).unwrap().take(2).collect();
        assert_eq!(first.len(), 2);

        let rest: Vec<String> = adapter
            .parse_from(&payload, 2)
            .unwrap()
            .map(|r| r.unwrap().native_code)
            .collect();
        assert_eq!(rest, vec!["c"]);

        let again = adapter.parse(&payload).unwrap().count();
        assert_eq!(again, 3);
    }

    #[test]
    fn error_classes() {
        assert!(SourceError::malformed("line 3", "bad").is_record_level());
        assert!(!SourceError::format_changed("hgnc", "columns").is_retryable());
    }
}
