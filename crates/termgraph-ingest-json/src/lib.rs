//! REST-API source adapter: paginated JSON payloads.
//!
//! `fetch` follows the next-page link until it disappears (or `max_pages` is
//! reached) and stores every page, in order, as one JSON array payload.
//! `parse` walks the item array of each page and flattens every item into
//! dotted-path fields:
//!
//! ```text
//!   {"@id": "...", "prefLabel": "x", "links": {"self": "..."}, "synonym": ["a", "b"]}
//!     ==> @id, prefLabel, links.self, synonym = [a, b]
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use termgraph_source::{
    verify_checksum, Fetcher, Payload, RawRecord, RawValue, RecordStream, SourceAdapter,
    SourceDescriptor, SourceError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonLayout {
    /// Dotted path to the item array inside one page; empty means the page
    /// itself is the array.
    pub items_path: String,
    /// Dotted path to the next-page URL.
    pub next_page_path: Option<String>,
    /// Dotted path (within an item) to the native code.
    pub code_path: String,
    pub max_pages: usize,
}

impl Default for JsonLayout {
    fn default() -> Self {
        Self {
            items_path: String::new(),
            next_page_path: None,
            code_path: "id".to_string(),
            max_pages: 10_000,
        }
    }
}

impl JsonLayout {
    /// BioPortal-style class listing.
    pub fn bioportal() -> Self {
        Self {
            items_path: "collection".to_string(),
            next_page_path: Some("links.nextPage".to_string()),
            code_path: "@id".to_string(),
            ..Self::default()
        }
    }
}

/// Resolve a dotted path (`links.nextPage`) inside a JSON value.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |v, key| v.as_object().and_then(|o| o.get(key)))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Flatten one item into dotted-path fields.
pub fn flatten_item(record: &mut RawRecord, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_item(record, &path, v);
            }
        }
        Value::Array(items) => {
            for item in items {
                if item.is_object() || item.is_array() {
                    flatten_item(record, prefix, item);
                } else if let Some(text) = scalar_text(item) {
                    record.push_text(prefix, text);
                }
            }
        }
        Value::Null => {}
        Value::Bool(b) => {
            record.raw_fields.insert(prefix.to_string(), RawValue::Bool(*b));
        }
        Value::Number(n) => match n.as_f64() {
            Some(x) => {
                record.raw_fields.insert(prefix.to_string(), RawValue::Number(x));
            }
            None => record.push_text(prefix, n.to_string()),
        },
        Value::String(s) => record.push_text(prefix, s.clone()),
    }
}

pub struct JsonApiAdapter {
    descriptor: SourceDescriptor,
    fetcher: Arc<Fetcher>,
    layout: JsonLayout,
}

impl JsonApiAdapter {
    pub fn new(descriptor: SourceDescriptor, fetcher: Arc<Fetcher>, layout: JsonLayout) -> Self {
        Self {
            descriptor,
            fetcher,
            layout,
        }
    }

    fn decode_page(&self, payload: &Payload) -> Result<Value, SourceError> {
        serde_json::from_slice(&payload.bytes).map_err(|e| {
            SourceError::format_changed(self.name(), format!("invalid JSON page: {e}"))
        })
    }

    fn next_link(&self, page: &Value, current: &str) -> Option<String> {
        let path = self.layout.next_page_path.as_deref()?;
        let link = lookup(page, path)?.as_str()?.trim();
        if link.is_empty() {
            return None;
        }
        match url::Url::parse(current).and_then(|base| base.join(link)) {
            Ok(u) => Some(u.to_string()),
            Err(_) => Some(link.to_string()),
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn fetch(&self) -> Result<Payload, SourceError> {
        // The checksum covers the assembled payload, not single pages.
        let mut page_desc = self.descriptor.clone().with_checksum(None);
        let mut pages: Vec<Value> = Vec::new();
        let mut first_locator = None;

        loop {
            let payload = self.fetcher.fetch(&page_desc).await?;
            let page = self.decode_page(&payload)?;
            first_locator.get_or_insert_with(|| payload.locator.clone());
            let next = self.next_link(&page, &payload.locator);
            pages.push(page);

            match next {
                Some(link) if pages.len() < self.layout.max_pages => {
                    tracing::debug!(source = %self.name(), page = pages.len() + 1, "following next page");
                    page_desc.location = link;
                    // Versioned templates are already expanded in the link.
                    page_desc.version = None;
                }
                Some(_) => {
                    tracing::warn!(source = %self.name(), max_pages = self.layout.max_pages, "page limit reached");
                    break;
                }
                None => break,
            }
        }

        let bytes = serde_json::to_vec(&Value::Array(pages)).map_err(|e| {
            SourceError::format_changed(self.name(), format!("re-encode pages: {e}"))
        })?;
        let payload = Payload::from_bytes(
            self.name(),
            first_locator.as_deref().unwrap_or(&self.descriptor.location),
            bytes,
            self.descriptor.version.clone(),
        );
        verify_checksum(&payload, self.descriptor.checksum.as_deref())?;
        Ok(payload)
    }

    fn parse<'a>(&'a self, payload: &'a Payload) -> Result<RecordStream<'a>, SourceError> {
        let pages = match self.decode_page(payload)? {
            Value::Array(pages) => pages,
            other => vec![other],
        };

        let mut items: Vec<(usize, Value)> = Vec::new();
        for (page_no, page) in pages.into_iter().enumerate() {
            match lookup(&page, &self.layout.items_path) {
                Some(Value::Array(list)) => {
                    items.extend(list.iter().cloned().map(|item| (page_no + 1, item)))
                }
                _ => {
                    return Err(SourceError::format_changed(
                        self.name(),
                        format!("page {} has no item array at `{}`", page_no + 1, self.layout.items_path),
                    ))
                }
            }
        }

        let code_path = &self.layout.code_path;
        let stream = items.into_iter().enumerate().map(move |(i, (page_no, item))| {
            let locator = format!("page {page_no} item {}", i + 1);
            let code = lookup(&item, code_path)
                .and_then(scalar_text)
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| SourceError::malformed(&locator, format!("missing `{code_path}`")))?;
            let mut record = RawRecord::new(code);
            flatten_item(&mut record, "", &item);
            Ok(record)
        });
        Ok(Box::new(stream))
    }
}
