use crate::calc::{self, ElementGrade, RawScore, ScoringModel};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

fn sanitize_points(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

fn parse_element_grades(
    req: &Request,
    config: &db::TestConfig,
) -> Result<Vec<ElementGrade>, serde_json::Value> {
    let Some(raw) = req.params.get("elementGrades").and_then(|v| v.as_array()) else {
        return Err(err(
            &req.id,
            "bad_params",
            "composite test requires an elementGrades array",
            None,
        ));
    };
    let ScoringModel::Composite { elements, .. } = &config.model else {
        return Err(err(
            &req.id,
            "bad_params",
            "elementGrades only apply to composite tests",
            None,
        ));
    };
    let known: HashSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();

    let mut grades = Vec::with_capacity(raw.len());
    for entry in raw {
        let element_id = entry
            .get("elementId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let Some(element_id) = element_id else {
            return Err(err(
                &req.id,
                "bad_params",
                "elementGrades entries require elementId",
                None,
            ));
        };
        if !known.contains(element_id) {
            return Err(err(
                &req.id,
                "not_found",
                "unknown element",
                Some(json!({ "elementId": element_id })),
            ));
        }
        // Missing, negative or non-numeric inputs all count as 0.
        let points = entry
            .get("pointsEarned")
            .and_then(|v| v.as_f64())
            .map(sanitize_points)
            .unwrap_or(0.0);
        grades.push(ElementGrade {
            element_id: element_id.to_string(),
            points_earned: points,
        });
    }
    Ok(grades)
}

/// A save may carry only a subset of a test's elements. The grade is
/// always computed over the full stored set, so overlay the submitted
/// entries on whatever element rows the student already has. The merged
/// set is also what gets written back, keeping the stored raw input and
/// the stored calculated grade in step.
fn merged_element_grades(
    conn: &Connection,
    test_id: &str,
    student_id: &str,
    submitted: Vec<ElementGrade>,
) -> anyhow::Result<Vec<ElementGrade>> {
    let mut stmt = conn.prepare(
        "SELECT element_id, points_earned
         FROM element_grades
         WHERE test_id = ? AND student_id = ?",
    )?;
    let mut merged = stmt
        .query_map((test_id, student_id), |r| {
            Ok(ElementGrade {
                element_id: r.get(0)?,
                points_earned: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<ElementGrade>, _>>()?;
    for entry in submitted {
        match merged.iter_mut().find(|g| g.element_id == entry.element_id) {
            Some(existing) => existing.points_earned = entry.points_earned,
            None => merged.push(entry),
        }
    }
    Ok(merged)
}

fn load_config(
    conn: &Connection,
    req: &Request,
    test_id: &str,
) -> Result<db::TestConfig, serde_json::Value> {
    match db::load_test_config(conn, test_id) {
        Ok(Some(c)) => Ok(c),
        Ok(None) => Err(err(&req.id, "not_found", "test not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_grades_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let config = match load_config(conn, req, &test_id) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let (points_earned, raw) = match &config.model {
        ScoringModel::Scaled { .. } => {
            let points = req
                .params
                .get("pointsEarned")
                .and_then(|v| v.as_f64())
                .map(sanitize_points)
                .unwrap_or(0.0);
            (Some(points), RawScore::Points(points))
        }
        ScoringModel::Composite { .. } => {
            let submitted = match parse_element_grades(req, &config) {
                Ok(v) => v,
                Err(e) => return e,
            };
            let merged = match merged_element_grades(conn, &test_id, &student_id, submitted) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            (None, RawScore::Elements(merged))
        }
    };

    let existing_override: Option<f64> = match conn
        .query_row(
            "SELECT manual_override FROM grades WHERE test_id = ? AND student_id = ?",
            (&test_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v.flatten(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let outcome = calc::compute_grade(&config.model, &raw);
    let calculated = outcome.value();
    let final_grade = calc::finalize_grade(calculated, existing_override);
    let now = now_ts();

    let result: anyhow::Result<()> = (|| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO grades(test_id, student_id, school_year, points_earned,
                                calculated_grade, final_grade, manual_override, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(test_id, student_id) DO UPDATE SET
               school_year = excluded.school_year,
               points_earned = excluded.points_earned,
               calculated_grade = excluded.calculated_grade,
               final_grade = excluded.final_grade,
               updated_at = excluded.updated_at",
            (
                &test_id,
                &student_id,
                &config.school_year,
                points_earned,
                calculated,
                final_grade,
                existing_override,
                &now,
            ),
        )?;
        if let RawScore::Elements(grades) = &raw {
            for g in grades {
                tx.execute(
                    "INSERT INTO element_grades(test_id, student_id, element_id, points_earned)
                     VALUES(?, ?, ?, ?)
                     ON CONFLICT(test_id, student_id, element_id) DO UPDATE SET
                       points_earned = excluded.points_earned",
                    (&test_id, &student_id, &g.element_id, g.points_earned),
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    })();
    if let Err(e) = result {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    let mut result = json!({
        "testId": test_id,
        "studentId": student_id,
        "calculatedGrade": calculated,
        "finalGrade": final_grade,
    });
    if let Some(reason) = outcome.degrade_reason() {
        result["degraded"] = json!(reason.code());
    }
    ok(&req.id, result)
}

fn handle_grades_set_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(value) = req.params.get("value").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing numeric value", None);
    };
    if !value.is_finite() {
        return err(&req.id, "bad_params", "value must be finite", None);
    }

    // The override is the final grade verbatim; the calculated grade
    // stays behind for audit and later recalculation.
    let updated = conn.execute(
        "UPDATE grades SET manual_override = ?, final_grade = ?, updated_at = ?
         WHERE test_id = ? AND student_id = ?",
        (value, value, now_ts(), &test_id, &student_id),
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "grade not found", None),
        Ok(_) => ok(
            &req.id,
            json!({ "testId": test_id, "studentId": student_id, "finalGrade": value }),
        ),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_grades_clear_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let calculated: Option<f64> = match conn
        .query_row(
            "SELECT calculated_grade FROM grades WHERE test_id = ? AND student_id = ?",
            (&test_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(calculated) = calculated else {
        return err(&req.id, "not_found", "grade not found", None);
    };

    let final_grade = calc::finalize_grade(calculated, None);
    match conn.execute(
        "UPDATE grades SET manual_override = NULL, final_grade = ?, updated_at = ?
         WHERE test_id = ? AND student_id = ?",
        (final_grade, now_ts(), &test_id, &student_id),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({ "testId": test_id, "studentId": student_id, "finalGrade": final_grade }),
        ),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_config(conn, req, &test_id) {
        return e;
    }

    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT student_id, school_year, points_earned, calculated_grade,
                    final_grade, manual_override, updated_at
             FROM grades
             WHERE test_id = ?
             ORDER BY student_id",
        )?;
        let rows = stmt
            .query_map([&test_id], |r| {
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "schoolYear": r.get::<_, String>(1)?,
                    "pointsEarned": r.get::<_, Option<f64>>(2)?,
                    "calculatedGrade": r.get::<_, f64>(3)?,
                    "finalGrade": r.get::<_, f64>(4)?,
                    "manualOverride": r.get::<_, Option<f64>>(5)?,
                    "updatedAt": r.get::<_, Option<String>>(6)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();

    match rows {
        Ok(grades) => ok(&req.id, json!({ "testId": test_id, "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_config(conn, req, &test_id) {
        return e;
    }

    let finals: Result<Vec<f64>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare("SELECT final_grade FROM grades WHERE test_id = ?")?;
        let finals = stmt
            .query_map([&test_id], |r| r.get::<_, f64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(finals)
    })();

    match finals {
        Ok(finals) => {
            let stats = calc::compute_test_statistics(&finals);
            ok(
                &req.id,
                json!({ "testId": test_id, "stats": stats }),
            )
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.save" => Some(handle_grades_save(state, req)),
        "grades.setOverride" => Some(handle_grades_set_override(state, req)),
        "grades.clearOverride" => Some(handle_grades_clear_override(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.stats" => Some(handle_grades_stats(state, req)),
        _ => None,
    }
}
