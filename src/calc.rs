use crate::error::{GradebookError, Result};
use crate::model::GradebookCategory;
use crate::repo;
use rusqlite::Connection;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Largest points value (earned or possible) the engine accepts.
pub const POINTS_CEILING: i64 = 1_000_000_000_000;

pub fn points_ceiling() -> Decimal {
    Decimal::from(POINTS_CEILING)
}

/// Smallest non-zero `maxPoints` an assignment may declare.
pub fn min_points_possible() -> Decimal {
    Decimal::new(1, 2)
}

fn out_of_range(what: &str) -> GradebookError {
    GradebookError::invalid(format!("{what} is out of range"))
}

/// Two-decimal rounding with ties going up, the rule every stored number
/// follows. Inputs here are never negative, so away-from-zero is half-up.
pub fn round2(x: Decimal) -> Decimal {
    x.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `points * 100 / possible`, rounded. A zero maximum yields 0.
pub fn percentage(points: Decimal, possible: Decimal) -> Result<Decimal> {
    if possible.is_zero() {
        return Ok(Decimal::ZERO);
    }
    points
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|scaled| scaled.checked_div(possible))
        .map(round2)
        .ok_or_else(|| out_of_range("percentage"))
}

/// Reads a JSON number (or numeric string) as an exact decimal.
pub fn parse_decimal(v: &serde_json::Value) -> Option<Decimal> {
    let text = match v {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Rounded mean, `None` for an empty slice.
pub fn average(values: &[Decimal]) -> Result<Option<Decimal>> {
    if values.is_empty() {
        return Ok(None);
    }
    let sum = values
        .iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))
        .ok_or_else(|| out_of_range("sum of percentages"))?;
    let mean = sum
        .checked_div(Decimal::from(values.len() as i64))
        .ok_or_else(|| out_of_range("average"))?;
    Ok(Some(round2(mean)))
}

/// One graded attempt as seen by aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedItem {
    pub assignment_id: String,
    pub category_id: Option<String>,
    pub percentage: Decimal,
    pub excused: bool,
}

/// Average of a category's qualifying percentages after dropping the
/// `drop_lowest` smallest. `None` means the category has no score: either
/// nothing qualifies or every qualifying grade would be dropped.
pub fn category_score(percentages: &[Decimal], drop_lowest: i64) -> Result<Option<Decimal>> {
    let mut sorted = percentages.to_vec();
    sorted.sort();
    let drop = usize::try_from(drop_lowest).unwrap_or(0);
    if drop >= sorted.len() {
        return Ok(None);
    }
    average(&sorted[drop..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    Weighted,
    FlatAverage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    pub category_id: String,
    pub name: String,
    pub weight: Decimal,
    pub drop_lowest: i64,
    pub qualifying_count: usize,
    pub score: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseScore {
    pub percentage: Decimal,
    pub method: ScoreMethod,
    pub categories: Vec<CategoryBreakdown>,
}

/// Rolls graded items into one course percentage.
///
/// Active categories with a score contribute `score * weight`, normalized by
/// the weights that actually contributed. When no category produced a score
/// the result is the flat average of every qualifying item in the course,
/// categorized or not. Scored categories whose weights sum to zero give 0.
pub fn weighted_course_score(
    categories: &[GradebookCategory],
    items: &[GradedItem],
) -> Result<CourseScore> {
    let qualifying: Vec<&GradedItem> = items.iter().filter(|i| !i.excused).collect();

    let mut by_category: HashMap<&str, Vec<Decimal>> = HashMap::new();
    for item in &qualifying {
        if let Some(cat) = item.category_id.as_deref() {
            by_category.entry(cat).or_default().push(item.percentage);
        }
    }

    let mut numerator = Decimal::ZERO;
    let mut denominator = Decimal::ZERO;
    let mut any_scored = false;
    let mut breakdown = Vec::new();

    for c in categories.iter().filter(|c| c.active) {
        let percentages = by_category.get(c.id.as_str()).cloned().unwrap_or_default();
        let score = category_score(&percentages, c.drop_lowest)?;
        if let Some(s) = score {
            any_scored = true;
            numerator = s
                .checked_mul(c.weight)
                .and_then(|part| numerator.checked_add(part))
                .ok_or_else(|| out_of_range("weighted score"))?;
            denominator += c.weight;
        }
        breakdown.push(CategoryBreakdown {
            category_id: c.id.clone(),
            name: c.name.clone(),
            weight: c.weight,
            drop_lowest: c.drop_lowest,
            qualifying_count: percentages.len(),
            score,
        });
    }

    if !any_scored {
        let flat: Vec<Decimal> = qualifying.iter().map(|i| i.percentage).collect();
        return Ok(CourseScore {
            percentage: average(&flat)?.unwrap_or(Decimal::ZERO),
            method: ScoreMethod::FlatAverage,
            categories: breakdown,
        });
    }

    let percentage = if denominator > Decimal::ZERO {
        numerator
            .checked_div(denominator)
            .map(round2)
            .ok_or_else(|| out_of_range("weighted score"))?
    } else {
        Decimal::ZERO
    };
    Ok(CourseScore {
        percentage,
        method: ScoreMethod::Weighted,
        categories: breakdown,
    })
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub course_id: &'a str,
    pub learner_id: &'a str,
}

/// Loads the learner's graded attempts and the course's categories and
/// computes the course score. Callers that need a consistent snapshot run
/// this inside a transaction.
pub fn compute_course_score(ctx: &CalcContext<'_>) -> Result<CourseScore> {
    let categories = repo::list_categories(ctx.conn, ctx.course_id, true)?;
    let items = repo::graded_items(ctx.conn, ctx.course_id, ctx.learner_id)?;
    weighted_course_score(&categories, &items)
}

/// Score of a single category for one learner, `None` when it has no score.
pub fn compute_category_score(
    conn: &Connection,
    category: &GradebookCategory,
    learner_id: &str,
) -> Result<Option<Decimal>> {
    let items = repo::graded_items(conn, &category.course_id, learner_id)?;
    let percentages: Vec<Decimal> = items
        .iter()
        .filter(|i| !i.excused && i.category_id.as_deref() == Some(category.id.as_str()))
        .map(|i| i.percentage)
        .collect();
    category_score(&percentages, category.drop_lowest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    fn category(id: &str, weight: Decimal, drop_lowest: i64) -> GradebookCategory {
        GradebookCategory {
            id: id.to_string(),
            course_id: "c1".to_string(),
            name: id.to_uppercase(),
            weight,
            drop_lowest,
            active: true,
            position: 0,
        }
    }

    fn item(assignment: &str, cat: Option<&str>, pct: Decimal, excused: bool) -> GradedItem {
        GradedItem {
            assignment_id: assignment.to_string(),
            category_id: cat.map(|c| c.to_string()),
            percentage: pct,
            excused,
        }
    }

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(d("87.505")), d("87.51"));
        assert_eq!(round2(d("87.504")), d("87.50"));
        assert_eq!(round2(d("0.005")), d("0.01"));
        assert_eq!(percentage(d("2"), d("3")).expect("pct"), d("66.67"));
        assert_eq!(percentage(d("5"), d("0")).expect("pct"), Decimal::ZERO);
    }

    #[test]
    fn parse_decimal_reads_numbers_and_strings() {
        assert_eq!(parse_decimal(&serde_json::json!(87.5)), Some(d("87.5")));
        assert_eq!(parse_decimal(&serde_json::json!(90)), Some(d("90")));
        assert_eq!(parse_decimal(&serde_json::json!("12.25")), Some(d("12.25")));
        assert_eq!(parse_decimal(&serde_json::json!(true)), None);
    }

    #[test]
    fn overflowing_arithmetic_is_a_typed_error() {
        let huge = Decimal::from_scientific("1e27").expect("decimal");
        let err = percentage(huge, d("0.5")).unwrap_err();
        assert_eq!(err.code(), "bad_params");
        assert!(percentage(points_ceiling(), min_points_possible()).is_ok());

        let err = average(&[Decimal::MAX, Decimal::MAX]).unwrap_err();
        assert_eq!(err.code(), "bad_params");

        let cats = vec![category("a", d("100"), 0)];
        let items = vec![item("x1", Some("a"), Decimal::MAX, false)];
        let err = weighted_course_score(&cats, &items).unwrap_err();
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn drop_lowest_discards_smallest_before_mean() {
        let got = category_score(&[d("80"), d("70"), d("95")], 1).expect("score");
        assert_eq!(got, Some(d("87.50")));
    }

    #[test]
    fn drop_lowest_at_or_above_count_is_no_score() {
        assert_eq!(category_score(&[d("80"), d("70")], 2).expect("score"), None);
        assert_eq!(category_score(&[d("80")], 3).expect("score"), None);
        assert_eq!(category_score(&[d("80"), d("70")], 1).expect("score"), Some(d("80.00")));
    }

    #[test]
    fn empty_category_has_no_score() {
        assert_eq!(category_score(&[], 0).expect("score"), None);
    }

    #[test]
    fn weighted_normalizes_by_contributing_weights() {
        let cats = vec![
            category("a", d("40"), 0),
            category("b", d("60"), 0),
            category("c", d("25"), 0),
        ];
        let items = vec![
            item("x1", Some("a"), d("90"), false),
            item("x2", Some("b"), d("70"), false),
        ];
        let score = weighted_course_score(&cats, &items).expect("course score");
        assert_eq!(score.method, ScoreMethod::Weighted);
        assert_eq!(score.percentage, d("78.00"));
        assert_eq!(score.categories[2].score, None);
    }

    #[test]
    fn no_categories_falls_back_to_flat_average() {
        let items = vec![
            item("x1", None, d("100"), false),
            item("x2", None, d("80"), false),
            item("x3", Some("gone"), d("60"), false),
        ];
        let score = weighted_course_score(&[], &items).expect("course score");
        assert_eq!(score.method, ScoreMethod::FlatAverage);
        assert_eq!(score.percentage, d("80.00"));
    }

    #[test]
    fn excused_grades_are_ignored_everywhere() {
        let cats = vec![category("hw", d("30"), 0)];
        let items = vec![
            item("x1", Some("hw"), d("90"), false),
            item("x2", Some("hw"), d("100"), false),
            item("x3", Some("hw"), Decimal::ZERO, true),
        ];
        let weighted = weighted_course_score(&cats, &items).expect("course score");
        assert_eq!(weighted.percentage, d("95.00"));

        let flat = weighted_course_score(&[], &items).expect("course score");
        assert_eq!(flat.percentage, d("95.00"));
    }

    #[test]
    fn scored_categories_with_zero_weight_give_zero() {
        let cats = vec![category("a", Decimal::ZERO, 0)];
        let items = vec![item("x1", Some("a"), d("88"), false)];
        let score = weighted_course_score(&cats, &items).expect("course score");
        assert_eq!(score.method, ScoreMethod::Weighted);
        assert_eq!(score.percentage, Decimal::ZERO);
    }

    #[test]
    fn inactive_categories_do_not_contribute() {
        let mut inactive = category("b", d("50"), 0);
        inactive.active = false;
        let cats = vec![category("a", d("50"), 0), inactive];
        let items = vec![
            item("x1", Some("a"), d("60"), false),
            item("x2", Some("b"), d("100"), false),
        ];
        let score = weighted_course_score(&cats, &items).expect("course score");
        assert_eq!(score.percentage, d("60.00"));
    }

    #[test]
    fn nothing_graded_is_zero() {
        let cats = vec![category("a", d("50"), 0)];
        let score = weighted_course_score(&cats, &[]).expect("course score");
        assert_eq!(score.method, ScoreMethod::FlatAverage);
        assert_eq!(score.percentage, Decimal::ZERO);
    }

    proptest! {
        #[test]
        fn drop_lowest_equals_mean_of_upper_tail(
            raw in proptest::collection::vec(0u32..=10_000, 1..12),
            k in 0i64..12,
        ) {
            let grades: Vec<Decimal> = raw.iter().map(|v| Decimal::new(*v as i64, 2)).collect();
            let got = category_score(&grades, k).expect("score");
            let n = grades.len();
            if k > 0 && (k as usize) >= n {
                prop_assert_eq!(got, None);
            } else {
                let mut sorted = grades.clone();
                sorted.sort();
                let tail = &sorted[k as usize..];
                let sum: Decimal = tail.iter().copied().sum();
                let expected = round2(sum / Decimal::from(tail.len() as i64));
                prop_assert_eq!(got, Some(expected));
            }
        }

        #[test]
        fn percentage_matches_rounded_ratio(earned in 0u32..=100_000, possible in 1u32..=100_000) {
            let e = Decimal::new(earned as i64, 2);
            let p = Decimal::new(possible as i64, 2);
            prop_assert_eq!(percentage(e, p).expect("pct"), round2(e * Decimal::ONE_HUNDRED / p));
        }
    }
}
