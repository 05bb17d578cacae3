//! Registry metadata read out of a feature's attribute pack.
//!
//! Pack keys vary between registry snapshots (`MUNICIPIO`, `município`,
//! `cod_estado`, ...), so keys are compared after accent, case and
//! punctuation folding, and a pattern pass catches the remaining spellings.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMeta {
    pub municipio: Option<String>,
    pub uf: Option<String>,
    pub status: Option<String>,
}

struct FieldRule {
    keys: &'static [&'static str],
    patterns: Vec<Regex>,
}

struct MetaRules {
    municipio: FieldRule,
    uf: FieldRule,
    status: FieldRule,
}

static RULES: LazyLock<MetaRules> = LazyLock::new(|| MetaRules {
    municipio: FieldRule {
        keys: &["municipio"],
        patterns: compile(&["municip"]),
    },
    uf: FieldRule {
        keys: &["cod_estado", "uf"],
        patterns: compile(&["^uf$", "estado", "sigla", "unidadefeder"]),
    },
    status: FieldRule {
        keys: &["ind_status", "des_condic", "status"],
        patterns: compile(&["status", "situac", "condic"]),
    },
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

/// NFD, combining marks dropped, lower-cased, anything outside `[a-z0-9]` removed.
pub fn normalize_pack_key(key: &str) -> String {
    key.nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
        .collect()
}

pub fn registry_meta_from_pack(pack: &Value) -> RegistryMeta {
    let Some(object) = pack.as_object() else {
        return RegistryMeta::default();
    };
    let rules = &*RULES;
    RegistryMeta {
        municipio: pick(object, &rules.municipio),
        uf: pick(object, &rules.uf),
        status: pick(object, &rules.status),
    }
}

fn pick(object: &Map<String, Value>, rule: &FieldRule) -> Option<String> {
    let normalized: HashMap<String, &Value> = object
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (normalize_pack_key(key), value))
        .collect();

    rule.keys
        .iter()
        .find_map(|key| normalized.get(&normalize_pack_key(key)).and_then(|value| text_value(value)))
        .or_else(|| {
            object
                .iter()
                .filter(|(key, _)| !key.is_empty())
                .filter(|(key, _)| {
                    let key = normalize_pack_key(key);
                    rule.patterns.iter().any(|pattern| pattern.is_match(&key))
                })
                .find_map(|(_, value)| text_value(value))
        })
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
