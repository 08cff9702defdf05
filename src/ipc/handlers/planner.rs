use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::weekcal::{self, YearPolicy};
use chrono::{Datelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

/// Week params are clamped, not rejected: the calendar is total over any
/// numeric input, matching the week-field defaults in the UI.
fn week_param(req: &Request, key: &str, default: Option<u32>) -> Result<u32, serde_json::Value> {
    match req.params.get(key) {
        Some(v) => match v.as_f64() {
            Some(n) => Ok(weekcal::clamp_week(n)),
            None => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                None,
            )),
        },
        None => match default {
            Some(d) => Ok(d),
            None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
        },
    }
}

/// Accepts "YYYY-YYYY", "YYYY/YYYY" or a bare "YYYY" and stores the
/// canonical dashed form.
fn normalize_school_year(req: &Request, raw: &str) -> Result<String, serde_json::Value> {
    let masked = weekcal::mask_school_year_input(raw);
    let span = weekcal::parse_school_year(&masked);
    match span.start_year {
        Some(start) => Ok(weekcal::format_school_year(start)),
        None => Err(err(
            &req.id,
            "bad_params",
            "schoolYear must contain a 4-digit year",
            Some(json!({ "schoolYear": raw })),
        )),
    }
}

struct Plan {
    id: String,
    name: String,
    school_year: String,
    week_range_start: u32,
    week_range_end: u32,
}

fn load_plan(
    conn: &Connection,
    req: &Request,
    plan_id: &str,
) -> Result<Plan, serde_json::Value> {
    let row: Option<(String, String, i64, i64)> = conn
        .query_row(
            "SELECT name, school_year, week_range_start, week_range_end
             FROM curriculum_plans
             WHERE id = ?",
            [plan_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((name, school_year, start, end)) = row else {
        return Err(err(&req.id, "not_found", "plan not found", None));
    };
    Ok(Plan {
        id: plan_id.to_string(),
        name,
        school_year,
        week_range_start: weekcal::clamp_week_i64(start),
        week_range_end: weekcal::clamp_week_i64(end),
    })
}

fn plan_json(plan: &Plan) -> serde_json::Value {
    json!({
        "planId": plan.id,
        "name": plan.name,
        "schoolYear": plan.school_year,
        "weekRangeStart": plan.week_range_start,
        "weekRangeEnd": plan.week_range_end,
    })
}

fn handle_create_plan(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year_raw = match required_str(req, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year = match normalize_school_year(req, &school_year_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_start = match week_param(req, "weekRangeStart", None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_end = match week_param(req, "weekRangeEnd", None) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let plan_id = Uuid::new_v4().to_string();
    let now = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO curriculum_plans(id, name, school_year, week_range_start, week_range_end,
                                      created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&plan_id, &name, &school_year, week_start, week_end, &now, &now),
    ) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    match load_plan(conn, req, &plan_id) {
        Ok(plan) => ok(&req.id, plan_json(&plan)),
        Err(e) => e,
    }
}

fn handle_update_plan(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let plan = match load_plan(conn, req, &plan_id) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(plan.name);
    let school_year = match req.params.get("schoolYear").and_then(|v| v.as_str()) {
        Some(raw) => match normalize_school_year(req, raw) {
            Ok(v) => v,
            Err(e) => return e,
        },
        None => plan.school_year,
    };
    let week_start = match week_param(req, "weekRangeStart", Some(plan.week_range_start)) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_end = match week_param(req, "weekRangeEnd", Some(plan.week_range_end)) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE curriculum_plans
         SET name = ?, school_year = ?, week_range_start = ?, week_range_end = ?, updated_at = ?
         WHERE id = ?",
        (&name, &school_year, week_start, week_end, now_ts(), &plan_id),
    ) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }
    match load_plan(conn, req, &plan_id) {
        Ok(plan) => ok(&req.id, plan_json(&plan)),
        Err(e) => e,
    }
}

fn handle_list_plans(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, name, school_year, week_range_start, week_range_end
             FROM curriculum_plans
             ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(json!({
                    "planId": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "schoolYear": r.get::<_, String>(2)?,
                    "weekRangeStart": r.get::<_, i64>(3)?,
                    "weekRangeEnd": r.get::<_, i64>(4)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    match rows {
        Ok(plans) => ok(&req.id, json!({ "plans": plans })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get_plan(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_plan(conn, req, &plan_id) {
        Ok(plan) => ok(&req.id, plan_json(&plan)),
        Err(e) => e,
    }
}

/// The plan's display/export order: the wraparound week sequence with a
/// calendar-year label per week.
fn handle_weeks(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let plan = match load_plan(conn, req, &plan_id) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let policy = match req.params.get("yearPolicy") {
        None => YearPolicy::default(),
        Some(v) => match serde_json::from_value::<YearPolicy>(v.clone()) {
            Ok(p) => p,
            Err(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "yearPolicy must be 'summerThreshold' or 'rangeRelative'",
                    None,
                )
            }
        },
    };

    let span = weekcal::parse_school_year(&plan.school_year);
    let fallback_year = Utc::now().year();
    let weeks: Vec<serde_json::Value> =
        weekcal::week_sequence(plan.week_range_start, plan.week_range_end)
            .into_iter()
            .map(|week| {
                let year = weekcal::year_for_week(
                    week,
                    plan.week_range_start,
                    plan.week_range_end,
                    span,
                    fallback_year,
                    policy,
                );
                json!({ "week": week, "year": year })
            })
            .collect();

    ok(&req.id, json!({ "planId": plan.id, "weeks": weeks }))
}

fn next_sort_order(
    conn: &Connection,
    table: &str,
    plan_id: &str,
) -> Result<i64, rusqlite::Error> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM {} WHERE plan_id = ?",
        table
    );
    conn.query_row(&sql, [plan_id], |r| r.get(0))
}

fn handle_add_topic(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let topic_id = Uuid::new_v4().to_string();
    let insert = next_sort_order(conn, "topics", &plan_id).and_then(|sort_order| {
        conn.execute(
            "INSERT INTO topics(id, plan_id, title, sort_order) VALUES(?, ?, ?, ?)",
            (&topic_id, &plan_id, &title, sort_order),
        )
    });
    match insert {
        Ok(_) => ok(&req.id, json!({ "topicId": topic_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_add_paragraph(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = req
        .params
        .get("label")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let topic_id = req
        .params
        .get("topicId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(tid) = &topic_id {
        if let Err(e) = require_row(conn, req, "topics", tid, "topic not found") {
            return e;
        }
    }

    let paragraph_id = Uuid::new_v4().to_string();
    let insert = next_sort_order(conn, "paragraphs", &plan_id).and_then(|sort_order| {
        conn.execute(
            "INSERT INTO paragraphs(id, plan_id, topic_id, label, title, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&paragraph_id, &plan_id, &topic_id, &label, &title, sort_order),
        )
    });
    match insert {
        Ok(_) => ok(&req.id, json!({ "paragraphId": paragraph_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_list_topics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, title
             FROM topics
             WHERE plan_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([&plan_id], |r| {
                Ok(json!({
                    "topicId": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    match rows {
        Ok(topics) => ok(&req.id, json!({ "planId": plan_id, "topics": topics })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_paragraphs(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, topic_id, label, title
             FROM paragraphs
             WHERE plan_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([&plan_id], |r| {
                Ok(json!({
                    "paragraphId": r.get::<_, String>(0)?,
                    "topicId": r.get::<_, Option<String>>(1)?,
                    "label": r.get::<_, Option<String>>(2)?,
                    "title": r.get::<_, String>(3)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    match rows {
        Ok(paragraphs) => ok(&req.id, json!({ "planId": plan_id, "paragraphs": paragraphs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn require_row(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    missing: &str,
) -> Result<(), serde_json::Value> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(&req.id, "not_found", missing, Some(json!({ "id": id }))));
    }
    Ok(())
}

fn handle_add_goal(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_start = match week_param(req, "weekStart", None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    // A goal with no explicit end covers its start week only.
    let week_end = match week_param(req, "weekEnd", Some(week_start)) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let topic_id = req
        .params
        .get("topicId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(tid) = &topic_id {
        if let Err(e) = require_row(conn, req, "topics", tid, "topic not found") {
            return e;
        }
    }
    let paragraph_id = req
        .params
        .get("paragraphId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(pid) = &paragraph_id {
        if let Err(e) = require_row(conn, req, "paragraphs", pid, "paragraph not found") {
            return e;
        }
    }

    let goal_id = Uuid::new_v4().to_string();
    let insert = next_sort_order(conn, "study_goals", &plan_id).and_then(|sort_order| {
        conn.execute(
            "INSERT INTO study_goals(id, plan_id, title, week_start, week_end, topic_id,
                                     paragraph_id, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &goal_id,
                &plan_id,
                &title,
                week_start,
                week_end,
                &topic_id,
                &paragraph_id,
                sort_order,
            ),
        )
    });
    match insert {
        Ok(_) => ok(
            &req.id,
            json!({ "goalId": goal_id, "weekStart": week_start, "weekEnd": week_end }),
        ),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_update_goal(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let goal_id = match required_str(req, "goalId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing: Option<(String, i64, i64)> = match conn
        .query_row(
            "SELECT title, week_start, week_end FROM study_goals WHERE id = ?",
            [&goal_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((old_title, old_start, old_end)) = existing else {
        return err(&req.id, "not_found", "goal not found", None);
    };

    let title = req
        .params
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(old_title);
    let week_start = match week_param(req, "weekStart", Some(weekcal::clamp_week_i64(old_start))) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_end = match week_param(req, "weekEnd", Some(weekcal::clamp_week_i64(old_end))) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match conn.execute(
        "UPDATE study_goals SET title = ?, week_start = ?, week_end = ? WHERE id = ?",
        (&title, week_start, week_end, &goal_id),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({ "goalId": goal_id, "weekStart": week_start, "weekEnd": week_end }),
        ),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete_goal(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let goal_id = match required_str(req, "goalId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM study_goals WHERE id = ?", [&goal_id]) {
        Ok(0) => err(&req.id, "not_found", "goal not found", None),
        Ok(_) => ok(&req.id, json!({ "goalId": goal_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_list_goals(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, title, week_start, week_end, topic_id, paragraph_id
             FROM study_goals
             WHERE plan_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([&plan_id], |r| {
                Ok(json!({
                    "goalId": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "weekStart": r.get::<_, i64>(2)?,
                    "weekEnd": r.get::<_, i64>(3)?,
                    "topicId": r.get::<_, Option<String>>(4)?,
                    "paragraphId": r.get::<_, Option<String>>(5)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    match rows {
        Ok(goals) => ok(&req.id, json!({ "planId": plan_id, "goals": goals })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_add_blocked_week(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let reason = match required_str(req, "reason") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_start = match week_param(req, "weekStart", None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_end = match week_param(req, "weekEnd", Some(week_start)) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let blocked_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO blocked_weeks(id, plan_id, week_start, week_end, reason)
         VALUES(?, ?, ?, ?, ?)",
        (&blocked_id, &plan_id, week_start, week_end, &reason),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({ "blockedWeekId": blocked_id, "weekStart": week_start, "weekEnd": week_end }),
        ),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_delete_blocked_week(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let blocked_id = match required_str(req, "blockedWeekId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM blocked_weeks WHERE id = ?", [&blocked_id]) {
        Ok(0) => err(&req.id, "not_found", "blocked week not found", None),
        Ok(_) => ok(&req.id, json!({ "blockedWeekId": blocked_id })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_list_blocked_weeks(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let rows: Result<Vec<serde_json::Value>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, week_start, week_end, reason
             FROM blocked_weeks
             WHERE plan_id = ?
             ORDER BY week_start, id",
        )?;
        let rows = stmt
            .query_map([&plan_id], |r| {
                Ok(json!({
                    "blockedWeekId": r.get::<_, String>(0)?,
                    "weekStart": r.get::<_, i64>(1)?,
                    "weekEnd": r.get::<_, i64>(2)?,
                    "reason": r.get::<_, String>(3)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();
    match rows {
        Ok(blocked) => ok(&req.id, json!({ "planId": plan_id, "blockedWeeks": blocked })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Everything that covers a given week, for the per-week planner view:
/// goals and blocked weeks share the one span predicate.
fn handle_week_coverage(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "planId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = load_plan(conn, req, &plan_id) {
        return e;
    }
    let week = match week_param(req, "week", None) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let result: Result<(Vec<serde_json::Value>, Vec<serde_json::Value>), rusqlite::Error> =
        (|| {
            let mut goal_stmt = conn.prepare(
                "SELECT id, title, week_start, week_end
                 FROM study_goals
                 WHERE plan_id = ?
                 ORDER BY sort_order",
            )?;
            let goals = goal_stmt
                .query_map([&plan_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut blocked_stmt = conn.prepare(
                "SELECT id, week_start, week_end, reason
                 FROM blocked_weeks
                 WHERE plan_id = ?
                 ORDER BY week_start, id",
            )?;
            let blocked = blocked_stmt
                .query_map([&plan_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let covering_goals = goals
                .into_iter()
                .filter(|(_, _, start, end)| {
                    weekcal::span_covers_week(
                        weekcal::clamp_week_i64(*start),
                        weekcal::clamp_week_i64(*end),
                        week,
                    )
                })
                .map(|(id, title, start, end)| {
                    json!({ "goalId": id, "title": title, "weekStart": start, "weekEnd": end })
                })
                .collect();
            let covering_blocked = blocked
                .into_iter()
                .filter(|(_, start, end, _)| {
                    weekcal::span_covers_week(
                        weekcal::clamp_week_i64(*start),
                        weekcal::clamp_week_i64(*end),
                        week,
                    )
                })
                .map(|(id, start, end, reason)| {
                    json!({
                        "blockedWeekId": id,
                        "weekStart": start,
                        "weekEnd": end,
                        "reason": reason
                    })
                })
                .collect();
            Ok((covering_goals, covering_blocked))
        })();

    match result {
        Ok((goals, blocked)) => {
            let is_blocked = !blocked.is_empty();
            ok(
                &req.id,
                json!({
                    "planId": plan_id,
                    "week": week,
                    "goals": goals,
                    "blockedWeeks": blocked,
                    "blocked": is_blocked,
                }),
            )
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "planner.createPlan" => Some(handle_create_plan(state, req)),
        "planner.updatePlan" => Some(handle_update_plan(state, req)),
        "planner.listPlans" => Some(handle_list_plans(state, req)),
        "planner.getPlan" => Some(handle_get_plan(state, req)),
        "planner.weeks" => Some(handle_weeks(state, req)),
        "planner.addTopic" => Some(handle_add_topic(state, req)),
        "planner.addParagraph" => Some(handle_add_paragraph(state, req)),
        "planner.listTopics" => Some(handle_list_topics(state, req)),
        "planner.listParagraphs" => Some(handle_list_paragraphs(state, req)),
        "planner.addGoal" => Some(handle_add_goal(state, req)),
        "planner.updateGoal" => Some(handle_update_goal(state, req)),
        "planner.deleteGoal" => Some(handle_delete_goal(state, req)),
        "planner.listGoals" => Some(handle_list_goals(state, req)),
        "planner.addBlockedWeek" => Some(handle_add_blocked_week(state, req)),
        "planner.deleteBlockedWeek" => Some(handle_delete_blocked_week(state, req)),
        "planner.listBlockedWeeks" => Some(handle_list_blocked_weeks(state, req)),
        "planner.weekCoverage" => Some(handle_week_coverage(state, req)),
        _ => None,
    }
}
