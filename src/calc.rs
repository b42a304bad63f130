use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Scores live on the 0-20 scale used by the corte grading system.
pub const MAX_SCORE: f64 = 20.0;
pub const PASS_THRESHOLD: f64 = 10.0;
pub const CORTES: [i64; 3] = [1, 2, 3];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradeState {
    NotGraded,
    Scored(f64),
}

/// 2-decimal display rounding: `Int(100*x + 0.5) / 100`.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub subject_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDef {
    pub evaluation_id: String,
    pub corte: i64,
    pub name: String,
    pub percentage: f64,
    pub sort_order: i64,
}

/// Grades keyed by (evaluation_id, student_id). A pair with no entry is
/// NotGraded; placeholder rows with a NULL score load as NotGraded too.
pub type GradeMap = HashMap<(String, String), GradeState>;

/// Contribution of one corte to the student's final grade:
/// sum of score * (percentage / 100) over the corte's evaluations.
/// NotGraded contributes 0.
pub fn weighted_corte_sum(
    student_id: &str,
    corte: i64,
    evaluations: &[EvaluationDef],
    grades: &GradeMap,
) -> f64 {
    let mut sum = 0.0_f64;
    for e in evaluations.iter().filter(|e| e.corte == corte) {
        let state = grades
            .get(&(e.evaluation_id.clone(), student_id.to_string()))
            .copied()
            .unwrap_or(GradeState::NotGraded);
        if let GradeState::Scored(score) = state {
            sum += score * (e.percentage / 100.0);
        }
    }
    sum
}

pub fn corte_percentage_total(corte: i64, evaluations: &[EvaluationDef]) -> f64 {
    evaluations
        .iter()
        .filter(|e| e.corte == corte)
        .map(|e| e.percentage)
        .sum()
}

/// Rescales a partially-weighted corte onto the 0-20 display scale.
/// A corte with no evaluations (or a non-positive percentage total) is
/// exactly 0 rather than a division by zero.
pub fn normalized_corte_grade(
    student_id: &str,
    corte: i64,
    evaluations: &[EvaluationDef],
    grades: &GradeMap,
) -> f64 {
    let total = corte_percentage_total(corte, evaluations);
    if total <= 0.0 {
        return 0.0;
    }
    weighted_corte_sum(student_id, corte, evaluations, grades) / (total / 100.0)
}

/// Already on the 0-20 scale: evaluation percentages are shares of the
/// whole subject, so the corte sums add up directly.
pub fn final_grade(student_id: &str, evaluations: &[EvaluationDef], grades: &GradeMap) -> f64 {
    CORTES
        .iter()
        .map(|&c| weighted_corte_sum(student_id, c, evaluations, grades))
        .sum()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeStats {
    pub count: usize,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub distribution: [usize; 5],
    pub passed_entries: Vec<ScoreEntry>,
    pub failed_entries: Vec<ScoreEntry>,
}

/// Histogram bucket over [0,4) [4,8) [8,12) [12,16) [16,20].
/// Every score on the 0-20 scale lands in exactly one bucket.
pub fn distribution_bucket(score: f64) -> usize {
    if score < 4.0 {
        0
    } else if score < 8.0 {
        1
    } else if score < 12.0 {
        2
    } else if score < 16.0 {
        3
    } else {
        4
    }
}

pub fn compute_statistics(entries: &[ScoreEntry]) -> GradeStats {
    if entries.is_empty() {
        return GradeStats {
            count: 0,
            average: 0.0,
            highest: 0.0,
            lowest: 0.0,
            passed: 0,
            failed: 0,
            pass_rate: 0.0,
            distribution: [0; 5],
            passed_entries: Vec::new(),
            failed_entries: Vec::new(),
        };
    }

    let mut sum = 0.0_f64;
    let mut highest = f64::NEG_INFINITY;
    let mut lowest = f64::INFINITY;
    let mut distribution = [0_usize; 5];
    let mut passed_entries: Vec<ScoreEntry> = Vec::new();
    let mut failed_entries: Vec<ScoreEntry> = Vec::new();

    for entry in entries {
        sum += entry.score;
        highest = highest.max(entry.score);
        lowest = lowest.min(entry.score);
        distribution[distribution_bucket(entry.score)] += 1;
        if entry.score >= PASS_THRESHOLD {
            passed_entries.push(entry.clone());
        } else {
            failed_entries.push(entry.clone());
        }
    }

    let by_score_desc =
        |a: &ScoreEntry, b: &ScoreEntry| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
    passed_entries.sort_by(by_score_desc);
    failed_entries.sort_by(by_score_desc);

    let count = entries.len();
    let passed = passed_entries.len();
    let failed = failed_entries.len();

    GradeStats {
        count,
        average: round_off_2_decimals(sum / count as f64),
        highest,
        lowest,
        passed,
        failed,
        pass_rate: round_off_2_decimals(100.0 * passed as f64 / count as f64),
        distribution,
        passed_entries,
        failed_entries,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub id: String,
    pub name: String,
    pub period_label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorteTotal {
    pub corte: i64,
    pub percentage_total: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorteBreakdown {
    pub corte: i64,
    pub weighted_sum: f64,
    pub normalized_grade: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub student_id: String,
    pub national_id: String,
    pub name: String,
    pub email: String,
    /// One slot per evaluation, in gradebook column order. None = not graded.
    pub scores: Vec<Option<f64>>,
    pub cortes: Vec<CorteBreakdown>,
    pub final_grade: f64,
    pub graded_count: usize,
    pub not_graded_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGradebook {
    pub subject: SubjectInfo,
    pub evaluations: Vec<EvaluationDef>,
    /// Only cortes that have at least one evaluation appear here.
    pub corte_totals: Vec<CorteTotal>,
    pub students: Vec<StudentRow>,
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    national_id: String,
    name: String,
    email: String,
}

pub fn load_subject_evaluations(
    conn: &Connection,
    subject_id: &str,
) -> Result<Vec<EvaluationDef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, corte, name, percentage, sort_order
             FROM evaluations
             WHERE subject_id = ?
             ORDER BY corte, sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([subject_id], |r| {
        Ok(EvaluationDef {
            evaluation_id: r.get(0)?,
            corte: r.get(1)?,
            name: r.get(2)?,
            percentage: r.get(3)?,
            sort_order: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

fn load_grade_map(
    conn: &Connection,
    evaluations: &[EvaluationDef],
    students: &[RosterStudent],
) -> Result<GradeMap, CalcError> {
    let mut grade_by_pair: GradeMap = HashMap::new();
    if students.is_empty() || evaluations.is_empty() {
        return Ok(grade_by_pair);
    }

    let evaluation_ids: Vec<String> = evaluations.iter().map(|e| e.evaluation_id.clone()).collect();
    let student_ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();

    let eval_placeholders = std::iter::repeat("?")
        .take(evaluation_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let stud_placeholders = std::iter::repeat("?")
        .take(student_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT evaluation_id, student_id, score
         FROM grades
         WHERE evaluation_id IN ({}) AND student_id IN ({})",
        eval_placeholders, stud_placeholders
    );
    let mut bind_values: Vec<Value> = Vec::with_capacity(evaluation_ids.len() + student_ids.len());
    for id in &evaluation_ids {
        bind_values.push(Value::Text(id.clone()));
    }
    for id in &student_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            let evaluation_id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let score: Option<f64> = r.get(2)?;
            Ok((evaluation_id, student_id, score))
        })
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for row in rows {
        let (evaluation_id, student_id, score) =
            row.map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let state = score.map(GradeState::Scored).unwrap_or(GradeState::NotGraded);
        grade_by_pair.insert((evaluation_id, student_id), state);
    }
    Ok(grade_by_pair)
}

/// Loads a full snapshot for the subject and assembles the one table model
/// every consumer (grid, CSV export, email bodies, statistics) renders from.
/// Recomputed on every call; the snapshot is never cached.
pub fn compute_subject_gradebook(ctx: &CalcContext<'_>) -> Result<SubjectGradebook, CalcError> {
    let conn = ctx.conn;
    let subject_id = ctx.subject_id;

    let subject_row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, period_label FROM subjects WHERE id = ?",
            [subject_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((subject_name, period_label)) = subject_row else {
        return Err(CalcError::new("not_found", "subject not found"));
    };

    let mut students_stmt = conn
        .prepare(
            "SELECT s.id, s.national_id, s.name, s.email
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
             WHERE e.subject_id = ?
             ORDER BY s.name, s.national_id",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let students: Vec<RosterStudent> = students_stmt
        .query_map([subject_id], |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                national_id: r.get(1)?,
                name: r.get(2)?,
                email: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let evaluations = load_subject_evaluations(conn, subject_id)?;
    let grades = load_grade_map(conn, &evaluations, &students)?;

    let corte_totals: Vec<CorteTotal> = CORTES
        .iter()
        .filter(|&&c| evaluations.iter().any(|e| e.corte == c))
        .map(|&c| CorteTotal {
            corte: c,
            percentage_total: corte_percentage_total(c, &evaluations),
        })
        .collect();

    let mut rows: Vec<StudentRow> = Vec::with_capacity(students.len());
    for s in &students {
        let mut scores: Vec<Option<f64>> = Vec::with_capacity(evaluations.len());
        let mut graded_count = 0_usize;
        let mut not_graded_count = 0_usize;
        for e in &evaluations {
            let state = grades
                .get(&(e.evaluation_id.clone(), s.id.clone()))
                .copied()
                .unwrap_or(GradeState::NotGraded);
            match state {
                GradeState::NotGraded => {
                    not_graded_count += 1;
                    scores.push(None);
                }
                GradeState::Scored(v) => {
                    graded_count += 1;
                    scores.push(Some(v));
                }
            }
        }

        let cortes: Vec<CorteBreakdown> = CORTES
            .iter()
            .map(|&c| CorteBreakdown {
                corte: c,
                weighted_sum: round_off_2_decimals(weighted_corte_sum(
                    &s.id,
                    c,
                    &evaluations,
                    &grades,
                )),
                normalized_grade: round_off_2_decimals(normalized_corte_grade(
                    &s.id,
                    c,
                    &evaluations,
                    &grades,
                )),
            })
            .collect();

        rows.push(StudentRow {
            student_id: s.id.clone(),
            national_id: s.national_id.clone(),
            name: s.name.clone(),
            email: s.email.clone(),
            scores,
            cortes,
            final_grade: round_off_2_decimals(final_grade(&s.id, &evaluations, &grades)),
            graded_count,
            not_graded_count,
        });
    }

    Ok(SubjectGradebook {
        subject: SubjectInfo {
            id: subject_id.to_string(),
            name: subject_name,
            period_label,
        },
        evaluations,
        corte_totals,
        students: rows,
    })
}
