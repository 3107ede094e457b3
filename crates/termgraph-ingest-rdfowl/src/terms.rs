//! Minimal RDF term model and Sophia-backed statement parsing.

use sophia::api::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum RdfNode {
    Iri(String),
    BlankNode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RdfLiteral {
    pub lexical: String,
    pub datatype: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum RdfObject {
    Node(RdfNode),
    Literal(RdfLiteral),
}

#[derive(Debug, Clone)]
pub(crate) struct RdfStatement {
    pub subject: RdfNode,
    pub predicate_iri: String,
    pub object: RdfObject,
}

/// Serializations accepted for ontology dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RdfFormat {
    NTriples,
    Turtle,
    RdfXml,
}

impl RdfFormat {
    /// Guess from a file name or URL.
    pub fn from_locator(locator: &str) -> Option<Self> {
        let ext = locator
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())?;
        match ext.as_str() {
            "nt" | "ntriples" => Some(RdfFormat::NTriples),
            "ttl" | "turtle" => Some(RdfFormat::Turtle),
            "rdf" | "owl" | "xml" => Some(RdfFormat::RdfXml),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub(crate) struct RdfSinkError {
    message: String,
}

impl RdfSinkError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub(crate) fn local_name(iri: &str) -> &str {
    iri.rsplit(['#', '/']).next().unwrap_or(iri)
}

fn unescape_rdf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parse the N-Triples-style display form Sophia terms render to.
pub(crate) fn parse_term_display(term: &str) -> Result<RdfObject, RdfSinkError> {
    let s = term.trim();

    if let Some(rest) = s.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        return Ok(RdfObject::Node(RdfNode::Iri(rest.to_string())));
    }

    if let Some(rest) = s.strip_prefix("_:") {
        return Ok(RdfObject::Node(RdfNode::BlankNode(rest.to_string())));
    }

    if s.starts_with('"') {
        let mut end_quote = None;
        let mut escaped = false;
        for (i, ch) in s.char_indices().skip(1) {
            if ch == '"' && !escaped {
                end_quote = Some(i);
                break;
            }
            escaped = ch == '\\' && !escaped;
        }
        let Some(end) = end_quote else {
            return Err(RdfSinkError::new(format!(
                "invalid literal term (missing closing quote): {s}"
            )));
        };

        let lexical = unescape_rdf_string(&s[1..end]);
        let rest = s[end + 1..].trim();

        let mut language = None;
        let mut datatype = None;
        if let Some(lang) = rest.strip_prefix('@') {
            language = Some(lang.to_string());
        } else if let Some(dt) = rest.strip_prefix("^^") {
            let dt = dt.trim();
            datatype = dt
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .map(str::to_string)
                .or_else(|| (!dt.is_empty()).then(|| dt.to_string()));
        }

        return Ok(RdfObject::Literal(RdfLiteral {
            lexical,
            datatype,
            language,
        }));
    }

    Err(RdfSinkError::new(format!("unsupported RDF term form: {s}")))
}

fn statement_from_display(
    s: String,
    p: String,
    o: String,
) -> Result<Option<RdfStatement>, RdfSinkError> {
    let subject = match parse_term_display(&s)? {
        RdfObject::Node(node) => node,
        RdfObject::Literal(_) => return Err(RdfSinkError::new(format!("literal subject: {s}"))),
    };
    let RdfObject::Node(RdfNode::Iri(predicate_iri)) = parse_term_display(&p)? else {
        return Ok(None);
    };
    let object = parse_term_display(&o)?;
    Ok(Some(RdfStatement {
        subject,
        predicate_iri,
        object,
    }))
}

/// Parse a whole document into statements.
pub(crate) fn parse_statements(bytes: &[u8], format: RdfFormat) -> Result<Vec<RdfStatement>, String> {
    let reader = std::io::BufReader::new(std::io::Cursor::new(bytes));
    let mut out: Vec<RdfStatement> = Vec::new();
    let mut sink = |s: String, p: String, o: String| -> Result<(), RdfSinkError> {
        if let Some(stmt) = statement_from_display(s, p, o)? {
            out.push(stmt);
        }
        Ok(())
    };

    match format {
        RdfFormat::NTriples => sophia::turtle::parser::nt::parse_bufread(reader)
            .try_for_each_triple(|t| sink(t.s().to_string(), t.p().to_string(), t.o().to_string()))
            .map_err(|e| format!("failed to parse N-Triples: {e}"))?,
        RdfFormat::Turtle => sophia::turtle::parser::turtle::parse_bufread(reader)
            .try_for_each_triple(|t| sink(t.s().to_string(), t.p().to_string(), t.o().to_string()))
            .map_err(|e| format!("failed to parse Turtle: {e}"))?,
        RdfFormat::RdfXml => sophia::xml::parser::parse_bufread(reader)
            .try_for_each_triple(|t| sink(t.s().to_string(), t.p().to_string(), t.o().to_string()))
            .map_err(|e| format!("failed to parse RDF/XML: {e}"))?,
    }
    Ok(out)
}
