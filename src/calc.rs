use serde::{Deserialize, Serialize};

use crate::formula;

pub const DEFAULT_R_TERM: f64 = 9.0;
pub const PASS_THRESHOLD: f64 = 5.5;

/// One weighted sub-component of a composite test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    pub name: String,
    pub max_points: f64,
    pub weight: f64,
    pub sort_order: i64,
}

/// A student's raw score on one element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementGrade {
    pub element_id: String,
    pub points_earned: f64,
}

/// Formula variant selector for the scaled model. Only the legacy CvTE
/// formula exists today; the flag is kept so stored tests round-trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaledMode {
    #[default]
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScoringModel {
    Scaled {
        max_points: f64,
        n_term: f64,
        r_term: f64,
        #[serde(default)]
        mode: ScaledMode,
    },
    Composite {
        elements: Vec<Element>,
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_formula: Option<String>,
    },
}

/// Why a computation fell back to its sentinel instead of a real result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    ZeroMaxPoints,
    ZeroTotalWeight,
    BadFormula,
}

impl DegradeReason {
    pub fn code(self) -> &'static str {
        match self {
            DegradeReason::ZeroMaxPoints => "zero_max_points",
            DegradeReason::ZeroTotalWeight => "zero_total_weight",
            DegradeReason::BadFormula => "bad_formula",
        }
    }
}

/// A grade computation either produced a real number or degraded to a
/// defined fallback. Grade display must never hard-fail, so degradation
/// is a value with a reason, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradeOutcome {
    Computed(f64),
    Degraded { value: f64, reason: DegradeReason },
}

impl GradeOutcome {
    pub fn value(&self) -> f64 {
        match self {
            GradeOutcome::Computed(v) => *v,
            GradeOutcome::Degraded { value, .. } => *value,
        }
    }

    pub fn degrade_reason(&self) -> Option<DegradeReason> {
        match self {
            GradeOutcome::Computed(_) => None,
            GradeOutcome::Degraded { reason, .. } => Some(*reason),
        }
    }
}

fn sanitize_points(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// One-decimal rounding applied to every displayed grade.
pub fn round_grade(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// CvTE scaled formula: `rTerm × (earned / max) + nTerm`, 2-dp rounded.
/// A test with maxPoints 0 yields nTerm exactly; that is the configured
/// floor, not an error.
pub fn calculate_scaled_grade(
    points_earned: f64,
    max_points: f64,
    n_term: f64,
    r_term: f64,
) -> GradeOutcome {
    let points = sanitize_points(points_earned);
    if !(max_points.is_finite() && max_points > 0.0) {
        log::warn!("scaled grade with maxPoints {max_points}, falling back to nTerm");
        return GradeOutcome::Degraded {
            value: n_term,
            reason: DegradeReason::ZeroMaxPoints,
        };
    }
    GradeOutcome::Computed(round_2dp(r_term * (points / max_points) + n_term))
}

/// Composite calculation. With a custom formula the element names are
/// substituted and the expression evaluated; without one the elements
/// that have a submitted grade are averaged on a common 0-10 scale,
/// weighted, with absent elements excluded from both sides of the
/// division.
pub fn calculate_composite_grade(
    element_grades: &[ElementGrade],
    elements: &[Element],
    custom_formula: Option<&str>,
) -> GradeOutcome {
    let formula_text = custom_formula.map(str::trim).filter(|s| !s.is_empty());
    if let Some(text) = formula_text {
        return calculate_with_formula(element_grades, elements, text);
    }

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for element in elements {
        let Some(grade) = element_grades
            .iter()
            .find(|g| g.element_id == element.id)
        else {
            continue;
        };
        let points = sanitize_points(grade.points_earned);
        let normalized = if element.max_points > 0.0 {
            points / element.max_points * 10.0
        } else {
            0.0
        };
        weighted_sum += normalized * element.weight;
        total_weight += element.weight;
    }

    if total_weight <= 0.0 {
        log::warn!("composite grade with zero total weight, falling back to 0");
        return GradeOutcome::Degraded {
            value: 0.0,
            reason: DegradeReason::ZeroTotalWeight,
        };
    }
    GradeOutcome::Computed(round_2dp(weighted_sum / total_weight))
}

fn calculate_with_formula(
    element_grades: &[ElementGrade],
    elements: &[Element],
    formula_text: &str,
) -> GradeOutcome {
    let values: Vec<(String, f64)> = elements
        .iter()
        .map(|e| {
            let points = element_grades
                .iter()
                .find(|g| g.element_id == e.id)
                .map(|g| sanitize_points(g.points_earned))
                .unwrap_or(0.0);
            (e.name.clone(), points)
        })
        .collect();

    let substituted = formula::substitute(formula_text, &values);
    match formula::evaluate(&substituted) {
        Ok(v) => GradeOutcome::Computed(round_2dp(v)),
        Err(e) => {
            log::warn!("custom formula rejected ({e}); substituted text: {substituted:?}");
            GradeOutcome::Degraded {
                value: 0.0,
                reason: DegradeReason::BadFormula,
            }
        }
    }
}

/// Raw input stored for a grade, as entered. The scoring model decides
/// how it is interpreted; recalculation always starts from this.
#[derive(Debug, Clone)]
pub enum RawScore {
    Points(f64),
    Elements(Vec<ElementGrade>),
}

pub fn compute_grade(model: &ScoringModel, raw: &RawScore) -> GradeOutcome {
    match (model, raw) {
        (
            ScoringModel::Scaled {
                max_points,
                n_term,
                r_term,
                mode: ScaledMode::Legacy,
            },
            RawScore::Points(points),
        ) => calculate_scaled_grade(*points, *max_points, *n_term, *r_term),
        (
            ScoringModel::Composite {
                elements,
                custom_formula,
            },
            RawScore::Elements(grades),
        ) => calculate_composite_grade(grades, elements, custom_formula.as_deref()),
        (ScoringModel::Scaled { .. }, RawScore::Elements(_)) => {
            // Model switched from composite to scaled; stored element
            // grades carry no usable point total.
            calculate_scaled_grade(0.0, 0.0, 0.0, 0.0)
        }
        (
            ScoringModel::Composite {
                elements,
                custom_formula,
            },
            RawScore::Points(_),
        ) => calculate_composite_grade(&[], elements, custom_formula.as_deref()),
    }
}

/// Override wins verbatim; otherwise the calculated grade is rounded to
/// one decimal.
pub fn finalize_grade(calculated: f64, manual_override: Option<f64>) -> f64 {
    match manual_override {
        Some(v) => v,
        None => round_grade(calculated),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatistics {
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub under_threshold: usize,
    pub above_threshold: usize,
    pub total_graded: usize,
}

/// Aggregate statistics over the final grades of one test. Empty input
/// yields the all-zero object.
pub fn compute_test_statistics(final_grades: &[f64]) -> TestStatistics {
    if final_grades.is_empty() {
        return TestStatistics::default();
    }

    let mut sum = 0.0;
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    let mut under = 0;
    let mut above = 0;
    for &g in final_grades {
        sum += g;
        if g > highest {
            highest = g;
        }
        if g < lowest {
            lowest = g;
        }
        if g < PASS_THRESHOLD {
            under += 1;
        } else {
            above += 1;
        }
    }

    TestStatistics {
        average: round_grade(sum / final_grades.len() as f64),
        highest,
        lowest,
        under_threshold: under,
        above_threshold: above,
        total_graded: final_grades.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &str, name: &str, max_points: f64, weight: f64, sort_order: i64) -> Element {
        Element {
            id: id.to_string(),
            name: name.to_string(),
            max_points,
            weight,
            sort_order,
        }
    }

    fn eg(element_id: &str, points: f64) -> ElementGrade {
        ElementGrade {
            element_id: element_id.to_string(),
            points_earned: points,
        }
    }

    #[test]
    fn scaled_grade_endpoints() {
        // 0 points gives nTerm, full marks give rTerm + nTerm.
        assert_eq!(calculate_scaled_grade(0.0, 40.0, 1.0, 9.0).value(), 1.0);
        assert_eq!(calculate_scaled_grade(40.0, 40.0, 1.0, 9.0).value(), 10.0);
        assert_eq!(calculate_scaled_grade(20.0, 40.0, 1.0, 9.0).value(), 5.5);
    }

    #[test]
    fn scaled_grade_is_linear_in_points() {
        let at = |p: f64| calculate_scaled_grade(p, 60.0, 0.5, 9.0).value();
        let step = at(30.0) - at(15.0);
        assert!((step - (at(45.0) - at(30.0))).abs() < 1e-9);
    }

    #[test]
    fn scaled_grade_rounds_to_two_decimals() {
        // 9 * (7/27) + 1 = 3.3333... -> 3.33
        assert_eq!(calculate_scaled_grade(7.0, 27.0, 1.0, 9.0).value(), 3.33);
    }

    #[test]
    fn scaled_grade_zero_max_points_degrades_to_n_term() {
        let out = calculate_scaled_grade(12.0, 0.0, 1.5, 9.0);
        assert_eq!(out.value(), 1.5);
        assert_eq!(out.degrade_reason(), Some(DegradeReason::ZeroMaxPoints));
    }

    #[test]
    fn scaled_grade_clamps_bad_points() {
        assert_eq!(calculate_scaled_grade(-5.0, 40.0, 1.0, 9.0).value(), 1.0);
        assert_eq!(
            calculate_scaled_grade(f64::NAN, 40.0, 1.0, 9.0).value(),
            1.0
        );
    }

    #[test]
    fn composite_weighted_average() {
        let elements = vec![
            element("e1", "essay", 10.0, 1.0, 0),
            element("e2", "exam", 20.0, 1.0, 1),
        ];
        let grades = vec![eg("e1", 7.0), eg("e2", 10.0)];
        // 7/10*10 = 7.0 and 10/20*10 = 5.0, equal weights -> 6.0
        let out = calculate_composite_grade(&grades, &elements, None);
        assert_eq!(out, GradeOutcome::Computed(6.0));
    }

    #[test]
    fn composite_absent_elements_excluded_from_denominator() {
        let elements = vec![
            element("e1", "essay", 10.0, 3.0, 0),
            element("e2", "exam", 10.0, 7.0, 1),
        ];
        let grades = vec![eg("e1", 8.0)];
        // Only the essay counts: 8.0, not diluted by the absent exam.
        assert_eq!(
            calculate_composite_grade(&grades, &elements, None),
            GradeOutcome::Computed(8.0)
        );
    }

    #[test]
    fn composite_zero_total_weight_degrades() {
        let elements = vec![element("e1", "essay", 10.0, 0.0, 0)];
        let grades = vec![eg("e1", 8.0)];
        let out = calculate_composite_grade(&grades, &elements, None);
        assert_eq!(out.value(), 0.0);
        assert_eq!(out.degrade_reason(), Some(DegradeReason::ZeroTotalWeight));

        let out = calculate_composite_grade(&[], &elements, None);
        assert_eq!(out.degrade_reason(), Some(DegradeReason::ZeroTotalWeight));
    }

    #[test]
    fn composite_custom_formula() {
        let elements = vec![
            element("e1", "A", 20.0, 1.0, 0),
            element("e2", "B", 20.0, 1.0, 1),
        ];
        let grades = vec![eg("e1", 8.0), eg("e2", 12.0)];
        let out = calculate_composite_grade(&grades, &elements, Some("(A + B) / 2"));
        assert_eq!(out, GradeOutcome::Computed(10.0));
    }

    #[test]
    fn composite_formula_missing_element_defaults_to_zero() {
        let elements = vec![
            element("e1", "A", 20.0, 1.0, 0),
            element("e2", "B", 20.0, 1.0, 1),
        ];
        let grades = vec![eg("e1", 8.0)];
        let out = calculate_composite_grade(&grades, &elements, Some("(A + B) / 2"));
        assert_eq!(out, GradeOutcome::Computed(4.0));
    }

    #[test]
    fn composite_bad_formula_degrades_to_zero() {
        let elements = vec![element("e1", "A", 20.0, 1.0, 0)];
        let grades = vec![eg("e1", 8.0)];
        // "bonus" is not an element name, so a letter survives the
        // substitution and the whitelist gate must reject it.
        let out = calculate_composite_grade(&grades, &elements, Some("A + bonus"));
        assert_eq!(out.value(), 0.0);
        assert_eq!(out.degrade_reason(), Some(DegradeReason::BadFormula));
    }

    #[test]
    fn composite_blank_formula_falls_back_to_weighted_average() {
        let elements = vec![element("e1", "A", 10.0, 1.0, 0)];
        let grades = vec![eg("e1", 5.0)];
        assert_eq!(
            calculate_composite_grade(&grades, &elements, Some("   ")),
            GradeOutcome::Computed(5.0)
        );
    }

    #[test]
    fn finalize_prefers_override_verbatim() {
        assert_eq!(finalize_grade(6.44, None), 6.4);
        assert_eq!(finalize_grade(6.45, None), 6.5);
        assert_eq!(finalize_grade(6.44, Some(7.25)), 7.25);
    }

    #[test]
    fn statistics_empty_is_all_zero() {
        assert_eq!(compute_test_statistics(&[]), TestStatistics::default());
    }

    #[test]
    fn statistics_thresholds_and_mean() {
        let stats = compute_test_statistics(&[4.0, 5.25, 8.5, 6.25]);
        assert_eq!(stats.total_graded, 4);
        assert_eq!(stats.highest, 8.5);
        assert_eq!(stats.lowest, 4.0);
        assert_eq!(stats.under_threshold, 2);
        assert_eq!(stats.above_threshold, 2);
        // (4.0 + 5.25 + 8.5 + 6.25) / 4 = 6.0
        assert_eq!(stats.average, 6.0);
    }
}
