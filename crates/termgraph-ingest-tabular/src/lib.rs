//! Flat-file releases: TSV, CSV and pipe-delimited RRF.
//!
//! Column names come from the header row or, for headerless dumps, from the
//! declared [`TabularLayout::columns`]. Each row becomes one [`RawRecord`]
//! whose `native_code` is taken from the code column (or the row number when
//! the file has no natural key, e.g. annotation tables).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use termgraph_source::{
    Fetcher, Payload, RawRecord, RawValue, RecordStream, SourceAdapter, SourceDescriptor,
    SourceError,
};

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Tab,
    Comma,
    Pipe,
}

impl Delimiter {
    fn byte(self) -> u8 {
        match self {
            Delimiter::Tab => b'\t',
            Delimiter::Comma => b',',
            Delimiter::Pipe => b'|',
        }
    }
}

/// How to read one flat file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularLayout {
    pub delimiter: Delimiter,
    pub has_headers: bool,
    /// Declared column names; override the header row when present.
    pub columns: Option<Vec<String>>,
    /// Column holding the native code. `None` numbers rows instead.
    pub code_column: Option<String>,
    /// Columns that must exist, beyond the code column.
    pub required_columns: Vec<String>,
    /// Multi-valued columns and their in-cell separator.
    pub multi_valued: BTreeMap<String, char>,
    /// Lines starting with this character are skipped.
    pub comment: Option<char>,
    /// Honour `"` quoting (CSV); TSV/RRF dumps treat quotes literally.
    pub quoting: bool,
    /// Allow rows with fewer/more cells than columns (RRF trailing `|`).
    pub flexible: bool,
}

impl Default for TabularLayout {
    fn default() -> Self {
        Self::tsv()
    }
}

impl TabularLayout {
    pub fn tsv() -> Self {
        Self {
            delimiter: Delimiter::Tab,
            has_headers: true,
            columns: None,
            code_column: None,
            required_columns: Vec::new(),
            multi_valued: BTreeMap::new(),
            comment: None,
            quoting: false,
            flexible: false,
        }
    }

    pub fn csv() -> Self {
        Self {
            delimiter: Delimiter::Comma,
            quoting: true,
            ..Self::tsv()
        }
    }

    /// Headerless pipe-delimited dump with declared columns.
    pub fn rrf(columns: &[&str]) -> Self {
        Self {
            delimiter: Delimiter::Pipe,
            has_headers: false,
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
            flexible: true,
            ..Self::tsv()
        }
    }

    pub fn with_code_column(mut self, column: &str) -> Self {
        self.code_column = Some(column.to_string());
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_required(mut self, columns: &[&str]) -> Self {
        self.required_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_multi_valued(mut self, column: &str, separator: char) -> Self {
        self.multi_valued.insert(column.to_string(), separator);
        self
    }

    pub fn with_comment(mut self, prefix: char) -> Self {
        self.comment = Some(prefix);
        self
    }

    pub fn headerless(mut self) -> Self {
        self.has_headers = false;
        self
    }

    pub fn flexible(mut self) -> Self {
        self.flexible = true;
        self
    }

    fn reader<'a>(&self, bytes: &'a [u8]) -> csv::Reader<&'a [u8]> {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(self.delimiter.byte())
            .has_headers(self.has_headers)
            .flexible(self.flexible)
            .quoting(self.quoting)
            .comment(self.comment.and_then(|c| u8::try_from(c).ok()));
        builder.from_reader(bytes)
    }
}

/// Strip BOM, comment markers and whitespace from a header cell.
fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim_start_matches('#')
        .trim()
        .to_string()
}

// ============================================================================
// Adapter
// ============================================================================

/// Source adapter for one flat-file release.
pub struct TabularAdapter {
    descriptor: SourceDescriptor,
    fetcher: Arc<Fetcher>,
    layout: TabularLayout,
}

impl TabularAdapter {
    pub fn new(descriptor: SourceDescriptor, fetcher: Arc<Fetcher>, layout: TabularLayout) -> Self {
        Self {
            descriptor,
            fetcher,
            layout,
        }
    }

    pub fn layout(&self) -> &TabularLayout {
        &self.layout
    }

    fn columns(&self, reader: &mut csv::Reader<&[u8]>) -> Result<Vec<String>, SourceError> {
        if let Some(cols) = &self.layout.columns {
            return Ok(cols.clone());
        }
        if !self.layout.has_headers {
            return Err(SourceError::format_changed(
                self.name(),
                "headerless layout without declared columns",
            ));
        }
        let headers = reader
            .headers()
            .map_err(|e| SourceError::format_changed(self.name(), format!("unreadable header: {e}")))?;
        Ok(headers.iter().map(normalize_header).collect())
    }

    fn check_columns(&self, columns: &[String]) -> Result<(), SourceError> {
        let missing: Vec<&str> = self
            .layout
            .code_column
            .iter()
            .chain(self.layout.required_columns.iter())
            .map(String::as_str)
            .filter(|c| !columns.iter().any(|h| h == c))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SourceError::format_changed(
                self.name(),
                format!("missing columns: {}", missing.join(", ")),
            ))
        }
    }
}

fn row_to_record(
    layout: &TabularLayout,
    columns: &[String],
    row: &csv::StringRecord,
    row_index: usize,
) -> Result<RawRecord, SourceError> {
    let line = row
        .position()
        .map(|p| p.line())
        .unwrap_or(row_index as u64 + 1);
    let locator = format!("line {line}");

    let mut fields = BTreeMap::new();
    for (name, cell) in columns.iter().zip(row.iter()) {
        let cell = cell.trim();
        if cell.is_empty() {
            continue;
        }
        let value = match layout.multi_valued.get(name) {
            Some(sep) => RawValue::Many(
                cell.split(*sep)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            None => RawValue::Text(cell.to_string()),
        };
        fields.insert(name.clone(), value);
    }

    let native_code = match &layout.code_column {
        Some(col) => fields
            .get(col)
            .and_then(RawValue::as_text)
            .map(str::to_string)
            .ok_or_else(|| SourceError::malformed(locator, format!("empty code column `{col}`")))?,
        None => format!("row:{}", row_index + 1),
    };

    Ok(RawRecord {
        native_code,
        raw_fields: fields,
    })
}

#[async_trait]
impl SourceAdapter for TabularAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn fetch(&self) -> Result<Payload, SourceError> {
        self.fetcher.fetch(&self.descriptor).await
    }

    fn parse<'a>(&'a self, payload: &'a Payload) -> Result<RecordStream<'a>, SourceError> {
        let mut reader = self.layout.reader(&payload.bytes);
        let columns = self.columns(&mut reader)?;
        self.check_columns(&columns)?;
        tracing::debug!(source = %self.name(), columns = columns.len(), "parsing flat file");

        let layout = &self.layout;
        let stream = reader
            .into_records()
            .enumerate()
            .map(move |(i, row)| match row {
                Ok(row) => row_to_record(layout, &columns, &row, i),
                Err(e) => {
                    let line = e
                        .position()
                        .map(|p| p.line())
                        .unwrap_or(i as u64 + 1);
                    Err(SourceError::malformed(format!("line {line}"), e.to_string()))
                }
            });
        Ok(Box::new(stream))
    }
}
