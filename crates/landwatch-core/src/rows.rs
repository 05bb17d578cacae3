//! Row predicates shared by the runner, the detail builder and alerting.
//!
//! Category and dataset codes are compared upper-cased. Keeping these in one
//! place means "total intersections" and "new intersections" always agree.

use crate::{AnalysisKind, FeatureId};

pub const SICAR_CATEGORY: &str = "SICAR";
pub const BIOMAS_CATEGORY: &str = "BIOMAS";
pub const DETER_CATEGORY: &str = "DETER";

/// The farm's own registry polygon: category `SICAR` with no area metrics.
pub fn is_base_registry_row(
    category: &str,
    feature_area: Option<&str>,
    overlap_area: Option<&str>,
) -> bool {
    category.eq_ignore_ascii_case(SICAR_CATEGORY) && feature_area.is_none() && overlap_area.is_none()
}

pub fn is_deter_row(category: &str, dataset: &str) -> bool {
    category.eq_ignore_ascii_case(DETER_CATEGORY)
        || dataset.to_ascii_uppercase().starts_with(DETER_CATEGORY)
}

/// Kind filter applied to raw intersection rows and to stored results.
///
/// Non-base `CAR_` datasets are always dropped. DETER analyses keep the base
/// registry row plus DETER rows; standard analyses drop every DETER row.
pub fn should_keep_intersection(
    category: &str,
    dataset: &str,
    is_base_registry: bool,
    kind: AnalysisKind,
) -> bool {
    let dataset_upper = dataset.to_ascii_uppercase();
    if dataset_upper.starts_with("CAR_") && !is_base_registry {
        return false;
    }
    match kind {
        AnalysisKind::Deter => is_base_registry || is_deter_row(category, dataset),
        AnalysisKind::Standard => !is_deter_row(category, dataset),
    }
}

/// Same rule as [`should_keep_intersection`], named for the report path.
pub fn should_include_detail_result(
    category: &str,
    dataset: &str,
    is_base_registry: bool,
    kind: AnalysisKind,
) -> bool {
    should_keep_intersection(category, dataset, is_base_registry, kind)
}

/// Rows that count as compliance intersections for `kind`.
pub fn is_intersection_row(
    category: &str,
    dataset: &str,
    is_base_registry: bool,
    kind: AnalysisKind,
) -> bool {
    if is_base_registry {
        return false;
    }
    match kind {
        AnalysisKind::Deter => is_deter_row(category, dataset),
        AnalysisKind::Standard => {
            !category.eq_ignore_ascii_case(BIOMAS_CATEGORY)
                && !category.eq_ignore_ascii_case(DETER_CATEGORY)
        }
    }
}

/// Biome rows never render; DETER maps show the registry polygon and alerts only.
pub fn should_keep_map_row(category: &str, dataset: &str, kind: AnalysisKind) -> bool {
    if category.eq_ignore_ascii_case(BIOMAS_CATEGORY) {
        return false;
    }
    match kind {
        AnalysisKind::Deter => {
            category.eq_ignore_ascii_case(SICAR_CATEGORY) || is_deter_row(category, dataset)
        }
        AnalysisKind::Standard => !is_deter_row(category, dataset),
    }
}

/// `"{dataset}:{feature|null}"`, the unit compared between two runs.
pub fn intersection_key(dataset: &str, feature_id: Option<&FeatureId>) -> String {
    match feature_id {
        Some(id) => format!("{dataset}:{id}"),
        None => format!("{dataset}:null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_registry_row_requires_sicar_without_areas() {
        assert!(is_base_registry_row("SICAR", None, None));
        assert!(is_base_registry_row("sicar", None, None));
        assert!(!is_base_registry_row("SICAR", Some("10.5"), None));
        assert!(!is_base_registry_row("SICAR", None, Some("1")));
        assert!(!is_base_registry_row("PRODES", None, None));
    }

    #[test]
    fn standard_kind_drops_deter_and_non_base_car_rows() {
        let kind = AnalysisKind::Standard;
        assert!(should_keep_intersection("SICAR", "CAR_PA", true, kind));
        assert!(!should_keep_intersection("SICAR", "CAR_PA", false, kind));
        assert!(!should_keep_intersection("DETER", "DETER_AMZ", false, kind));
        assert!(!should_keep_intersection("OTHER", "deter_cerrado", false, kind));
        assert!(should_keep_intersection("BIOMAS", "BIOMAS_IBGE", false, kind));
        assert!(should_keep_intersection("PRODES", "PRODES_AMZ_2023", false, kind));
    }

    #[test]
    fn deter_kind_keeps_base_registry_and_alert_rows_only() {
        let kind = AnalysisKind::Deter;
        assert!(should_keep_intersection("SICAR", "CAR_PA", true, kind));
        assert!(should_keep_intersection("DETER", "DETER_AMZ", false, kind));
        assert!(should_keep_intersection("X", "DETER_CERRADO", false, kind));
        assert!(!should_keep_intersection("PRODES", "PRODES_AMZ_2023", false, kind));
        assert!(!should_keep_intersection("BIOMAS", "BIOMAS_IBGE", false, kind));
    }

    #[test]
    fn intersection_rows_exclude_base_biome_and_deter_for_standard() {
        let kind = AnalysisKind::Standard;
        assert!(!is_intersection_row("SICAR", "CAR_PA", true, kind));
        assert!(!is_intersection_row("BIOMAS", "BIOMAS_IBGE", false, kind));
        assert!(!is_intersection_row("DETER", "DETER_AMZ", false, kind));
        assert!(is_intersection_row("PRODES", "PRODES_AMZ_2023", false, kind));
        assert!(is_intersection_row("SICAR", "CAR_PA", false, kind));
    }

    #[test]
    fn intersection_rows_for_deter_are_deter_only() {
        let kind = AnalysisKind::Deter;
        assert!(is_intersection_row("DETER", "DETER_AMZ", false, kind));
        assert!(is_intersection_row("ALERTS", "DETER_CERRADO", false, kind));
        assert!(!is_intersection_row("PRODES", "PRODES_AMZ", false, kind));
        assert!(!is_intersection_row("DETER", "DETER_AMZ", true, kind));
    }

    #[test]
    fn map_rows_drop_biomes_and_follow_kind() {
        let rows = [
            ("BIOMAS", "BIOMAS_IBGE"),
            ("DETER", "DETER_AMZ"),
            ("PRODES", "PRODES_AMZ_2023"),
            ("SICAR", "CAR_PA"),
        ];
        let standard: Vec<_> = rows
            .iter()
            .filter(|(category, dataset)| should_keep_map_row(category, dataset, AnalysisKind::Standard))
            .map(|(category, _)| *category)
            .collect();
        assert_eq!(standard, vec!["PRODES", "SICAR"]);

        let deter: Vec<_> = rows
            .iter()
            .filter(|(category, dataset)| should_keep_map_row(category, dataset, AnalysisKind::Deter))
            .map(|(category, _)| *category)
            .collect();
        assert_eq!(deter, vec!["DETER", "SICAR"]);
    }

    #[test]
    fn intersection_key_uses_literal_null_for_missing_feature() {
        let id: FeatureId = "42".parse().expect("feature id");
        assert_eq!(intersection_key("PRODES_AMZ", Some(&id)), "PRODES_AMZ:42");
        assert_eq!(intersection_key("EMBARGOS", None), "EMBARGOS:null");
    }
}
