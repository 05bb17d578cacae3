use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocType {
    Cpf,
    Cnpj,
    Unknown,
}

impl DocType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpf => "CPF",
            Self::Cnpj => "CNPJ",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Strips everything but ASCII digits; `None` when nothing is left.
pub fn sanitize_doc(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|ch| ch.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

pub fn doc_type_for(digits: &str) -> DocType {
    match digits.len() {
        11 => DocType::Cpf,
        14 => DocType::Cnpj,
        _ => DocType::Unknown,
    }
}

/// Sanitizes and deduplicates documents, keeping first-seen order.
pub fn normalize_documents<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|value| sanitize_doc(value.as_ref()))
        .filter(|digits| seen.insert(digits.clone()))
        .collect()
}
