//! Identifier newtypes shared by every compilation stage.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::digest::{concept_id_v1, CONCEPT_ID_V1_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid concept id `{0}` (expected `{CONCEPT_ID_V1_PREFIX}<32 hex digits>`)")]
    ConceptId(String),
    #[error("invalid run id `{0}` (expected `run-<number>`)")]
    RunId(String),
    #[error("invalid slice key `{0}` (expected `vocab:<name>` or `xmap:<name>`)")]
    SliceKey(String),
    #[error("vocabulary name must not be empty")]
    EmptyVocabulary,
}

/// Name of one source terminology (e.g. `HGNC`, `HPO`).
///
/// Names are canonicalised to upper case so that `hgnc` and `HGNC` share one
/// identity namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Vocabulary(String);

impl Vocabulary {
    pub fn new(name: &str) -> Result<Self, IdParseError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdParseError::EmptyVocabulary);
        }
        Ok(Self(name.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Vocabulary {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Vocabulary> for String {
    fn from(value: Vocabulary) -> Self {
        value.0
    }
}

impl FromStr for Vocabulary {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique concept identifier, derived from `(vocabulary, native_code)`.
///
/// Recompiling unchanged source data always yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConceptId(String);

impl ConceptId {
    pub fn derive(vocabulary: &Vocabulary, native_code: &str) -> Self {
        Self(concept_id_v1(vocabulary.as_str(), native_code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ConceptId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let ok = s
            .strip_prefix(CONCEPT_ID_V1_PREFIX)
            .is_some_and(|hex| hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if !ok {
            return Err(IdParseError::ConceptId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ConceptId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConceptId> for String {
    fn from(value: ConceptId) -> Self {
        value.0
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic compilation run identifier.
///
/// Ordering matters: a relationship may only reference concepts committed in
/// the same or an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(u64);

impl RunId {
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub const fn seq(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:06}", self.0)
    }
}

impl FromStr for RunId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        s.strip_prefix("run-")
            .unwrap_or(s)
            .parse::<u64>()
            .map(Self)
            .map_err(|_| IdParseError::RunId(s.to_string()))
    }
}

impl TryFrom<String> for RunId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.to_string()
    }
}

/// Unit of all-or-nothing graph writes.
///
/// Each vocabulary's concepts + native relationships form one slice; each
/// cross-map source forms another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SliceKey {
    Vocabulary(Vocabulary),
    CrossMap(String),
}

impl SliceKey {
    pub fn vocabulary(&self) -> Option<&Vocabulary> {
        match self {
            SliceKey::Vocabulary(v) => Some(v),
            SliceKey::CrossMap(_) => None,
        }
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceKey::Vocabulary(v) => write!(f, "vocab:{v}"),
            SliceKey::CrossMap(name) => write!(f, "xmap:{name}"),
        }
    }
}

impl FromStr for SliceKey {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(v) = s.strip_prefix("vocab:") {
            return Vocabulary::new(v)
                .map(SliceKey::Vocabulary)
                .map_err(|_| IdParseError::SliceKey(s.to_string()));
        }
        match s.strip_prefix("xmap:") {
            Some(name) if !name.is_empty() => Ok(SliceKey::CrossMap(name.to_string())),
            _ => Err(IdParseError::SliceKey(s.to_string())),
        }
    }
}

impl Serialize for SliceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SliceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_names_are_case_insensitive() {
        assert_eq!(Vocabulary::new("hgnc").unwrap(), Vocabulary::new("HGNC").unwrap());
        assert!(Vocabulary::new("  ").is_err());
    }

    #[test]
    fn concept_id_round_trips_through_text() {
        let v = Vocabulary::new("HGNC").unwrap();
        let id = ConceptId::derive(&v, "HGNC:1100");
        let parsed: ConceptId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("tg1:xyz".parse::<ConceptId>().is_err());
    }

    #[test]
    fn run_ids_order_and_print() {
        let a = RunId::new(7);
        assert!(a < a.next());
        assert_eq!(a.to_string(), "run-000007");
        assert_eq!("run-000007".parse::<RunId>().unwrap(), a);
        assert_eq!("7".parse::<RunId>().unwrap(), a);
    }

    #[test]
    fn slice_keys_serialize_as_strings() {
        let key = SliceKey::Vocabulary(Vocabulary::new("hpo").unwrap());
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"vocab:HPO\"");
        let back: SliceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert_eq!(
            "xmap:gene_hpo".parse::<SliceKey>().unwrap(),
            SliceKey::CrossMap("gene_hpo".to_string())
        );
        assert!("xmap:".parse::<SliceKey>().is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn concept_ids_are_stable_and_parseable(vocab in "[A-Za-z]{2,8}", code in "[A-Za-z0-9:_.-]{1,24}") {
                let v = Vocabulary::new(&vocab).unwrap();
                let id = ConceptId::derive(&v, &code);
                prop_assert_eq!(&id, &ConceptId::derive(&Vocabulary::new(&vocab.to_lowercase()).unwrap(), &code));
                prop_assert_eq!(id.to_string().parse::<ConceptId>().unwrap(), id);
            }

            #[test]
            fn distinct_codes_get_distinct_ids(a in "[A-Z]{2}:[0-9]{1,7}", b in "[A-Z]{2}:[0-9]{1,7}") {
                prop_assume!(a != b);
                let v = Vocabulary::new("HPO").unwrap();
                prop_assert_ne!(ConceptId::derive(&v, &a), ConceptId::derive(&v, &b));
            }
        }
    }
}
