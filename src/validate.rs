use crate::calc::EvaluationDef;
use serde_json::json;

/// Per-corte percentage caps (cortes 1/2/3) plus the global subject cap.
/// The uncapped-corte policy is intentionally not supported.
pub const CORTE_CAPS: [f64; 3] = [30.0, 30.0, 40.0];
pub const TOTAL_CAP: f64 = 100.0;

// Tolerate f64 drift when a sum of percentages lands exactly on a cap.
const BUDGET_EPSILON: f64 = 1e-9;

pub fn corte_cap(corte: i64) -> Option<f64> {
    match corte {
        1..=3 => Some(CORTE_CAPS[(corte - 1) as usize]),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ProposedEvaluation<'a> {
    pub name: &'a str,
    pub corte: i64,
    /// None when the caller could not parse a number out of the input.
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingField { field: &'static str },
    InvalidPercentage { percentage: f64 },
    CorteBudgetExceeded { corte: i64, cap: f64, remaining: f64 },
    TotalBudgetExceeded { remaining: f64 },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingField { .. } => "missing_field",
            ValidationError::InvalidPercentage { .. } => "invalid_percentage",
            ValidationError::CorteBudgetExceeded { .. } => "corte_budget_exceeded",
            ValidationError::TotalBudgetExceeded { .. } => "total_budget_exceeded",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ValidationError::MissingField { field } => {
                format!("missing or invalid {}", field)
            }
            ValidationError::InvalidPercentage { percentage } => {
                format!("percentage must be greater than 0, got {}", percentage)
            }
            ValidationError::CorteBudgetExceeded {
                corte,
                cap,
                remaining,
            } => format!(
                "corte {} allows up to {}%; {}% remaining",
                corte, cap, remaining
            ),
            ValidationError::TotalBudgetExceeded { remaining } => format!(
                "subject percentages may not exceed {}%; {}% remaining",
                TOTAL_CAP, remaining
            ),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ValidationError::MissingField { field } => Some(json!({ "field": field })),
            ValidationError::InvalidPercentage { percentage } => {
                Some(json!({ "percentage": percentage }))
            }
            ValidationError::CorteBudgetExceeded {
                corte,
                cap,
                remaining,
            } => Some(json!({ "corte": corte, "cap": cap, "remaining": remaining })),
            ValidationError::TotalBudgetExceeded { remaining } => {
                Some(json!({ "cap": TOTAL_CAP, "remaining": remaining }))
            }
        }
    }
}

/// Decides whether a proposed evaluation (new or edited) may be committed.
///
/// The budget checks exclude the evaluation being edited (`editing_id`), so
/// an edit never double-counts its own prior percentage. The `remaining`
/// allowance reported on failure is computed from the committed evaluation
/// set as stored, i.e. the headroom the instructor currently sees.
pub fn validate_evaluation(
    proposed: &ProposedEvaluation<'_>,
    existing: &[EvaluationDef],
    editing_id: Option<&str>,
) -> Result<(), ValidationError> {
    if proposed.name.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "name" });
    }
    let percentage = match proposed.percentage {
        Some(p) if p.is_finite() => p,
        _ => return Err(ValidationError::MissingField { field: "percentage" }),
    };
    let Some(cap) = corte_cap(proposed.corte) else {
        return Err(ValidationError::MissingField { field: "corte" });
    };
    if percentage <= 0.0 {
        return Err(ValidationError::InvalidPercentage { percentage });
    }

    let keeps = |e: &&EvaluationDef| {
        editing_id
            .map(|id| e.evaluation_id != id)
            .unwrap_or(true)
    };

    let corte_used: f64 = existing
        .iter()
        .filter(|e| e.corte == proposed.corte)
        .filter(keeps)
        .map(|e| e.percentage)
        .sum();
    if corte_used + percentage > cap + BUDGET_EPSILON {
        let committed: f64 = existing
            .iter()
            .filter(|e| e.corte == proposed.corte)
            .map(|e| e.percentage)
            .sum();
        return Err(ValidationError::CorteBudgetExceeded {
            corte: proposed.corte,
            cap,
            remaining: cap - committed,
        });
    }

    let total_used: f64 = existing.iter().filter(keeps).map(|e| e.percentage).sum();
    if total_used + percentage > TOTAL_CAP + BUDGET_EPSILON {
        let committed: f64 = existing.iter().map(|e| e.percentage).sum();
        return Err(ValidationError::TotalBudgetExceeded {
            remaining: TOTAL_CAP - committed,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(id: &str, corte: i64, percentage: f64) -> EvaluationDef {
        EvaluationDef {
            evaluation_id: id.to_string(),
            corte,
            name: format!("eval {}", id),
            percentage,
            sort_order: 0,
        }
    }

    fn proposed(name: &str, corte: i64, percentage: Option<f64>) -> ProposedEvaluation<'_> {
        ProposedEvaluation {
            name,
            corte,
            percentage,
        }
    }

    #[test]
    fn rejects_blank_name_and_missing_percentage() {
        let err = validate_evaluation(&proposed("   ", 1, Some(10.0)), &[], None).unwrap_err();
        assert_eq!(err.code(), "missing_field");

        let err = validate_evaluation(&proposed("Quiz", 1, None), &[], None).unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "percentage" });

        let err = validate_evaluation(&proposed("Quiz", 1, Some(f64::NAN)), &[], None).unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "percentage" });
    }

    #[test]
    fn rejects_non_positive_percentage() {
        let err = validate_evaluation(&proposed("Quiz", 1, Some(0.0)), &[], None).unwrap_err();
        assert_eq!(err.code(), "invalid_percentage");

        let err = validate_evaluation(&proposed("Quiz", 1, Some(-5.0)), &[], None).unwrap_err();
        assert_eq!(err.code(), "invalid_percentage");
    }

    #[test]
    fn rejects_corte_outside_range() {
        let err = validate_evaluation(&proposed("Quiz", 4, Some(10.0)), &[], None).unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "corte" });
    }

    #[test]
    fn enforces_corte_cap_on_create() {
        let existing = vec![eval("a", 1, 20.0)];

        assert!(validate_evaluation(&proposed("Quiz", 1, Some(10.0)), &existing, None).is_ok());

        let err =
            validate_evaluation(&proposed("Quiz", 1, Some(15.0)), &existing, None).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CorteBudgetExceeded {
                corte: 1,
                cap: 30.0,
                remaining: 10.0
            }
        );
        assert!(err.message().contains("10"));
    }

    #[test]
    fn editing_excludes_own_percentage() {
        let existing = vec![eval("a", 1, 20.0)];

        // Keeping the same weight can never fail the budget checks.
        assert!(validate_evaluation(&proposed("Quiz", 1, Some(20.0)), &existing, Some("a")).is_ok());
        assert!(validate_evaluation(&proposed("Quiz", 1, Some(25.0)), &existing, Some("a")).is_ok());

        let err = validate_evaluation(&proposed("Quiz", 1, Some(35.0)), &existing, Some("a"))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::CorteBudgetExceeded {
                corte: 1,
                cap: 30.0,
                remaining: 10.0
            }
        );
    }

    #[test]
    fn allows_landing_exactly_on_the_cap() {
        let existing = vec![eval("a", 1, 10.1), eval("b", 1, 9.9)];
        assert!(validate_evaluation(&proposed("Quiz", 1, Some(10.0)), &existing, None).is_ok());
    }

    #[test]
    fn enforces_total_cap_over_oversized_stored_data() {
        // A subject imported from an older workspace can hold corte sums
        // beyond today's caps; the global cap still binds.
        let existing = vec![eval("a", 1, 50.0), eval("b", 2, 30.0)];
        let err =
            validate_evaluation(&proposed("Final", 3, Some(25.0)), &existing, None).unwrap_err();
        assert_eq!(err, ValidationError::TotalBudgetExceeded { remaining: 20.0 });
        assert!(err.message().contains("20"));
    }
}
