//! Dataset classification for the analysis report.
//!
//! Each catalog dataset is routed by an ordered rule table; the first rule
//! that matches decides its bucket. Buckets then become titled groups in a
//! fixed order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use landwatch_core::sanitize_doc;
use landwatch_store::{DatasetRow, DocMatchRow};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

pub const SOCIAL_GROUP: &str = "Análise Social";
pub const ENVIRONMENTAL_GROUP: &str = "Análise Ambiental";
pub const CONSERVATION_GROUP: &str = "Unidades de conservação";
pub const DETER_GROUP: &str = "Monitoramento DETER";
pub const LDI_ITEM_CODE: &str = "LDI_SEMAS";

const CADASTRO_EMPREGADORES: &str = "CADASTRO_EMPREGADORES";
const LISTA_EMBARGOS_IBAMA: &str = "LISTA_EMBARGOS_IBAMA";
const SOCIAL_CODES: &[&str] = &[CADASTRO_EMPREGADORES, LISTA_EMBARGOS_IBAMA];
const ENVIRONMENTAL_CODES: &[&str] = &[
    "INDIGENAS",
    "QUILOMBOLAS",
    "UCS_SNIRH",
    "UCS",
    "EMBARGOS_IBAMA",
    "EMBARGOS_ICMBIO",
];
const REPORTED_ELSEWHERE: &[&str] = &["SICAR", "BIOMAS", "DETER"];

const UCS_LABELS: &[(&str, &str)] = &[
    ("APA", "Área de Proteção Ambiental"),
    ("ARIE", "Área de Relevante Interesse Ecológico"),
    ("ESEC", "Estação Ecológica"),
    ("FLONA", "Floresta Nacional"),
    ("MONA", "Monumento Natural"),
    ("PARNA", "Parque Nacional"),
    ("REBIO", "Reserva Biológica"),
    ("RDS", "Reserva de Desenvolvimento Sustentável"),
    ("RESEX", "Reserva Extrativista"),
    ("RPPN", "Reserva Particular do Patrimônio Natural"),
    ("REVIS", "Refúgio de Vida Silvestre"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetItem {
    pub dataset_code: String,
    pub hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl DatasetItem {
    fn plain(dataset_code: &str, hit: bool) -> Self {
        Self {
            dataset_code: dataset_code.to_owned(),
            hit,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetGroup {
    pub title: String,
    pub items: Vec<DatasetItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProdesBiome {
    Amazonia,
    AmazoniaLegal,
    Cerrado,
    Caatinga,
    MataAtlantica,
    Pampa,
    Pantanal,
    Other,
}

impl ProdesBiome {
    /// Report order.
    pub const ALL: [ProdesBiome; 8] = [
        Self::Amazonia,
        Self::AmazoniaLegal,
        Self::Cerrado,
        Self::Caatinga,
        Self::MataAtlantica,
        Self::Pampa,
        Self::Pantanal,
        Self::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Amazonia => "Amazônia",
            Self::AmazoniaLegal => "Amazônia Legal",
            Self::Cerrado => "Cerrado",
            Self::Caatinga => "Caatinga",
            Self::MataAtlantica => "Mata Atlântica",
            Self::Pampa => "Pampa",
            Self::Pantanal => "Pantanal",
            Self::Other => "Outros",
        }
    }

    /// Keyword match on the dataset code. Legal Amazon is checked before the
    /// bare Amazon keywords since its codes contain both.
    pub fn infer(dataset_code: &str) -> Self {
        let code = dataset_code.to_uppercase();
        let has = |needle: &str| code.contains(needle);
        if has("CERRADO") {
            Self::Cerrado
        } else if has("CAATINGA") {
            Self::Caatinga
        } else if has("PAMPA") {
            Self::Pampa
        } else if has("PANTANAL") {
            Self::Pantanal
        } else if has("MATA_ATLANTICA") || has("MATAATLANTICA") {
            Self::MataAtlantica
        } else if has("LEGAL_AMZ") || has("AMZ_LEGAL") {
            Self::AmazoniaLegal
        } else if has("AMZ") || has("AMAZ") {
            Self::Amazonia
        } else {
            Self::Other
        }
    }

    pub fn group_title(self) -> String {
        format!("Desmatamento Prodes {}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetBucket {
    /// Reported through dedicated fields, never as a group item.
    Excluded,
    Indigena,
    Ucs,
    Ldi,
    Prodes(ProdesBiome),
    Social,
    Quilombola,
    EmbargoIbama,
    EmbargoIcmbio,
    Environmental,
}

/// Upper-cased codes of one catalog dataset.
struct Codes {
    category: String,
    code: String,
}

type Rule = fn(&Codes) -> Option<DatasetBucket>;

/// First match wins; reordering changes the report.
const RULES: &[Rule] = &[
    reported_elsewhere,
    alternate_encoding,
    indigena_rule,
    ucs_rule,
    ldi_rule,
    prodes_rule,
    social_rule,
    environmental_rule,
];

fn reported_elsewhere(codes: &Codes) -> Option<DatasetBucket> {
    REPORTED_ELSEWHERE
        .contains(&codes.category.as_str())
        .then_some(DatasetBucket::Excluded)
}

fn alternate_encoding(codes: &Codes) -> Option<DatasetBucket> {
    let code = codes.code.as_str();
    (code.starts_with("CAR_") || code.starts_with("CAR-") || code.starts_with("DETER"))
        .then_some(DatasetBucket::Excluded)
}

fn indigena_rule(codes: &Codes) -> Option<DatasetBucket> {
    is_indigena_dataset(&codes.category, &codes.code).then_some(DatasetBucket::Indigena)
}

fn ucs_rule(codes: &Codes) -> Option<DatasetBucket> {
    is_ucs_dataset(&codes.category, &codes.code).then_some(DatasetBucket::Ucs)
}

fn ldi_rule(codes: &Codes) -> Option<DatasetBucket> {
    (codes.category.starts_with("LDI") || codes.code.contains("LDI"))
        .then_some(DatasetBucket::Ldi)
}

fn prodes_rule(codes: &Codes) -> Option<DatasetBucket> {
    (codes.category == "PRODES").then(|| DatasetBucket::Prodes(ProdesBiome::infer(&codes.code)))
}

fn social_rule(codes: &Codes) -> Option<DatasetBucket> {
    (SOCIAL_CODES.contains(&codes.category.as_str()) || SOCIAL_CODES.contains(&codes.code.as_str()))
        .then_some(DatasetBucket::Social)
}

fn environmental_rule(codes: &Codes) -> Option<DatasetBucket> {
    let (category, code) = (codes.category.as_str(), codes.code.as_str());
    let environmental = ENVIRONMENTAL_CODES.contains(&category)
        || ENVIRONMENTAL_CODES.contains(&code)
        || code.contains("UCS");
    if !environmental {
        return None;
    }
    let bucket = if category == "QUILOMBOLAS" || code.contains("QUILOMB") {
        DatasetBucket::Quilombola
    } else if category == "EMBARGOS_IBAMA" || code.contains("EMBARGOS_IBAMA") {
        DatasetBucket::EmbargoIbama
    } else if category == "EMBARGOS_ICMBIO" || code.contains("EMBARGOS_ICMBIO") {
        DatasetBucket::EmbargoIcmbio
    } else {
        DatasetBucket::Environmental
    };
    Some(bucket)
}

pub fn classify_dataset(category_code: &str, dataset_code: &str) -> DatasetBucket {
    let codes = Codes {
        category: category_code.to_uppercase(),
        code: dataset_code.to_uppercase(),
    };
    RULES
        .iter()
        .find_map(|rule| rule(&codes))
        .unwrap_or(DatasetBucket::Environmental)
}

pub fn is_indigena_dataset(category_code: &str, dataset_code: &str) -> bool {
    let category = category_code.to_uppercase();
    let code = dataset_code.to_uppercase();
    category == "TI"
        || code.starts_with("TI_")
        || code.starts_with("TI-")
        || (category.contains("TERRA") && category.contains("INDIG"))
        || (code.contains("TERRA") && code.contains("INDIG"))
        || category.contains("INDIGEN")
        || code.contains("INDIGEN")
}

pub fn is_ucs_dataset(category_code: &str, dataset_code: &str) -> bool {
    let category = category_code.to_uppercase();
    let code = dataset_code.to_uppercase();
    category.contains("UCS")
        || category.contains("CONSERVAC")
        || code.contains("UCS")
        || code.contains("CONSERVAC")
}

/// Phase and conservation-unit inputs for the enriched groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupEnrichment {
    pub indigena_phases: Vec<String>,
    pub indigena_hits: BTreeSet<String>,
    pub ucs_categories: Vec<String>,
    pub ucs_hits: BTreeSet<String>,
}

pub fn build_dataset_groups(
    datasets: &[DatasetRow],
    spatial_hits: &BTreeSet<String>,
    doc_hits: &BTreeSet<String>,
    enrichment: &GroupEnrichment,
) -> Vec<DatasetGroup> {
    let mut social = Vec::new();
    let mut quilombolas = Vec::new();
    let mut embargos_ibama = Vec::new();
    let mut embargos_icmbio = Vec::new();
    let mut other_environmental = Vec::new();
    let mut prodes: BTreeMap<ProdesBiome, Vec<DatasetItem>> = BTreeMap::new();
    let mut ldi: Option<bool> = None;

    for dataset in datasets {
        let bucket = classify_dataset(&dataset.category_code, &dataset.dataset_code);
        let hit = if dataset.is_spatial {
            spatial_hits.contains(&dataset.dataset_code)
        } else {
            doc_hits.contains(&dataset.dataset_code)
        };
        let item = DatasetItem::plain(&dataset.dataset_code, hit);
        match bucket {
            DatasetBucket::Excluded | DatasetBucket::Indigena | DatasetBucket::Ucs => {}
            DatasetBucket::Ldi => ldi = Some(ldi.unwrap_or(false) || hit),
            DatasetBucket::Prodes(biome) => prodes.entry(biome).or_default().push(item),
            DatasetBucket::Social => social.push(item),
            DatasetBucket::Quilombola => quilombolas.push(item),
            DatasetBucket::EmbargoIbama => embargos_ibama.push(item),
            DatasetBucket::EmbargoIcmbio => embargos_icmbio.push(item),
            DatasetBucket::Environmental => other_environmental.push(item),
        }
    }

    let mut groups = Vec::new();

    let social = order_social(social, ldi);
    if !social.is_empty() {
        groups.push(DatasetGroup {
            title: SOCIAL_GROUP.to_owned(),
            items: social,
        });
    }

    let mut environmental =
        build_indigena_items(&enrichment.indigena_phases, &enrichment.indigena_hits);
    for mut bucket in [quilombolas, embargos_ibama, embargos_icmbio, other_environmental] {
        bucket.sort_by(|left, right| collate(&left.dataset_code, &right.dataset_code));
        environmental.extend(bucket);
    }
    if !environmental.is_empty() {
        groups.push(DatasetGroup {
            title: ENVIRONMENTAL_GROUP.to_owned(),
            items: environmental,
        });
    }

    let ucs = build_ucs_items(&enrichment.ucs_categories, &enrichment.ucs_hits);
    if !ucs.is_empty() {
        groups.push(DatasetGroup {
            title: CONSERVATION_GROUP.to_owned(),
            items: ucs,
        });
    }

    for biome in ProdesBiome::ALL {
        let Some(mut items) = prodes.remove(&biome) else {
            continue;
        };
        items.sort_by(|left, right| collate(&left.dataset_code, &right.dataset_code));
        groups.push(DatasetGroup {
            title: biome.group_title(),
            items,
        });
    }

    groups
}

/// Cadastro first, then the IBAMA embargo list, then the collapsed LDI item,
/// then every other social dataset in catalog order.
fn order_social(social: Vec<DatasetItem>, ldi: Option<bool>) -> Vec<DatasetItem> {
    let mut ordered = Vec::with_capacity(social.len() + 1);
    let mut rest = social;
    for code in [CADASTRO_EMPREGADORES, LISTA_EMBARGOS_IBAMA] {
        if let Some(index) = rest
            .iter()
            .position(|item| item.dataset_code.eq_ignore_ascii_case(code))
        {
            ordered.push(rest.remove(index));
        }
    }
    if let Some(hit) = ldi {
        ordered.push(DatasetItem::plain(LDI_ITEM_CODE, hit));
    }
    ordered.extend(rest);
    ordered
}

/// One item per distinct phase; with no known phases the hit set stands in.
pub fn build_indigena_items(phases: &[String], hits: &BTreeSet<String>) -> Vec<DatasetItem> {
    let effective = effective_values(phases.iter().map(|phase| phase.trim().to_owned()), hits);
    let mut items: Vec<DatasetItem> = effective
        .into_iter()
        .map(|phase| DatasetItem {
            dataset_code: format!("INDIGENAS_{phase}"),
            hit: hits.contains(&phase),
            label: Some(format!("Terra Indigena {phase}")),
        })
        .collect();
    sort_by_label(&mut items);
    items
}

pub fn build_ucs_items(categories: &[String], hits: &BTreeSet<String>) -> Vec<DatasetItem> {
    let hits: BTreeSet<String> = hits.iter().map(|hit| hit.trim().to_uppercase()).collect();
    let effective = effective_values(
        categories.iter().map(|sigla| sigla.trim().to_uppercase()),
        &hits,
    );
    let mut items: Vec<DatasetItem> = effective
        .into_iter()
        .map(|sigla| DatasetItem {
            dataset_code: format!("UCS_{sigla}"),
            hit: hits.contains(&sigla),
            label: Some(ucs_label(&sigla).to_owned()),
        })
        .collect();
    sort_by_label(&mut items);
    items
}

fn ucs_label(sigla: &str) -> &str {
    UCS_LABELS
        .iter()
        .find(|(abbreviation, _)| *abbreviation == sigla)
        .map_or(sigla, |(_, label)| label)
}

fn effective_values(
    values: impl Iterator<Item = String>,
    hits: &BTreeSet<String>,
) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for value in values.filter(|value| !value.is_empty()) {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    if unique.is_empty() {
        hits.iter().cloned().collect()
    } else {
        unique
    }
}

fn sort_by_label(items: &mut [DatasetItem]) {
    items.sort_by(|left, right| {
        collate(
            left.label.as_deref().unwrap_or_default(),
            right.label.as_deref().unwrap_or_default(),
        )
    });
}

/// Accent- and case-insensitive ordering, ties broken by the raw text.
fn collate(left: &str, right: &str) -> Ordering {
    collation_key(left)
        .cmp(&collation_key(right))
        .then_with(|| left.cmp(right))
}

fn collation_key(value: &str) -> String {
    value
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .collect()
}

/// DETER reports list every alert dataset as a hit.
pub fn build_deter_dataset_groups<'a>(
    results: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<DatasetGroup> {
    let codes: BTreeSet<&str> = results
        .into_iter()
        .filter(|(category, _)| !category.eq_ignore_ascii_case("SICAR"))
        .map(|(_, dataset)| dataset)
        .collect();
    if codes.is_empty() {
        return Vec::new();
    }
    let mut codes: Vec<&str> = codes.into_iter().collect();
    codes.sort_by(|left, right| collate(left, right));
    vec![DatasetGroup {
        title: DETER_GROUP.to_owned(),
        items: codes
            .into_iter()
            .map(|code| DatasetItem {
                dataset_code: code.to_owned(),
                hit: true,
                label: Some(code.to_owned()),
            })
            .collect(),
    }]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocFlags {
    pub mte: bool,
    pub ibama: bool,
}

/// Flags per normalized document: `mte` for the employer registry, `ibama`
/// for the IBAMA embargo list.
pub fn doc_flags_for(matches: &[DocMatchRow]) -> BTreeMap<String, DocFlags> {
    let mut flags: BTreeMap<String, DocFlags> = BTreeMap::new();
    for row in matches {
        let Some(doc) = sanitize_doc(&row.doc_normalized) else {
            continue;
        };
        let text = format!(
            "{} {}",
            row.dataset_code.to_uppercase(),
            row.category_code.to_uppercase()
        );
        let entry = flags.entry(doc).or_default();
        if text.contains(CADASTRO_EMPREGADORES)
            || text.contains("CADASTRO_DE_EMPREGADORES")
            || (text.contains("CADASTRO") && text.contains("EMPREGADOR"))
        {
            entry.mte = true;
        }
        if text.contains(LISTA_EMBARGOS_IBAMA) || (text.contains("IBAMA") && text.contains("EMBARGO"))
        {
            entry.ibama = true;
        }
    }
    flags
}
