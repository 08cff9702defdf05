use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::calc::{self, Element, ElementGrade, RawScore, ScaledMode, ScoringModel};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("cijferd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tests(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            school_year TEXT NOT NULL,
            kind TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1,
            max_points REAL,
            n_term REAL,
            r_term REAL,
            calc_mode TEXT,
            custom_formula TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tests_school_year ON tests(school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS test_groups(
            test_id TEXT NOT NULL,
            group_name TEXT NOT NULL,
            PRIMARY KEY(test_id, group_name),
            FOREIGN KEY(test_id) REFERENCES tests(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS test_elements(
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_points REAL NOT NULL,
            weight REAL NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(test_id) REFERENCES tests(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_test_elements_test ON test_elements(test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            points_earned REAL,
            calculated_grade REAL NOT NULL DEFAULT 0,
            final_grade REAL NOT NULL DEFAULT 0,
            manual_override REAL,
            updated_at TEXT,
            PRIMARY KEY(test_id, student_id),
            FOREIGN KEY(test_id) REFERENCES tests(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_test ON grades(test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS element_grades(
            test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            element_id TEXT NOT NULL,
            points_earned REAL NOT NULL,
            PRIMARY KEY(test_id, student_id, element_id),
            FOREIGN KEY(test_id) REFERENCES tests(id),
            FOREIGN KEY(element_id) REFERENCES test_elements(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_element_grades_test ON element_grades(test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS curriculum_plans(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            school_year TEXT NOT NULL,
            week_range_start INTEGER NOT NULL,
            week_range_end INTEGER NOT NULL,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS topics(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            title TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(plan_id) REFERENCES curriculum_plans(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_topics_plan ON topics(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS paragraphs(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            topic_id TEXT,
            label TEXT,
            title TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(plan_id) REFERENCES curriculum_plans(id),
            FOREIGN KEY(topic_id) REFERENCES topics(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_paragraphs_plan ON paragraphs(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS study_goals(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            title TEXT NOT NULL,
            week_start INTEGER NOT NULL,
            week_end INTEGER NOT NULL,
            topic_id TEXT,
            paragraph_id TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(plan_id) REFERENCES curriculum_plans(id),
            FOREIGN KEY(topic_id) REFERENCES topics(id),
            FOREIGN KEY(paragraph_id) REFERENCES paragraphs(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_study_goals_plan ON study_goals(plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS blocked_weeks(
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            week_start INTEGER NOT NULL,
            week_end INTEGER NOT NULL,
            reason TEXT NOT NULL,
            FOREIGN KEY(plan_id) REFERENCES curriculum_plans(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_blocked_weeks_plan ON blocked_weeks(plan_id)",
        [],
    )?;

    Ok(conn)
}

/// A test's full scoring configuration as stored.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub id: String,
    pub name: String,
    pub school_year: String,
    pub weight: f64,
    pub model: ScoringModel,
}

pub fn load_test_config(conn: &Connection, test_id: &str) -> anyhow::Result<Option<TestConfig>> {
    let row: Option<(String, String, f64, String, Option<f64>, Option<f64>, Option<f64>, Option<String>)> =
        conn.query_row(
            "SELECT name, school_year, weight, kind, max_points, n_term, r_term, custom_formula
             FROM tests
             WHERE id = ?",
            [test_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()?;
    let Some((name, school_year, weight, kind, max_points, n_term, r_term, custom_formula)) = row
    else {
        return Ok(None);
    };

    let model = match kind.as_str() {
        "scaled" => ScoringModel::Scaled {
            max_points: max_points.unwrap_or(0.0),
            n_term: n_term.unwrap_or(0.0),
            r_term: r_term.unwrap_or(calc::DEFAULT_R_TERM),
            mode: ScaledMode::Legacy,
        },
        _ => ScoringModel::Composite {
            elements: load_test_elements(conn, test_id)?,
            custom_formula,
        },
    };

    Ok(Some(TestConfig {
        id: test_id.to_string(),
        name,
        school_year,
        weight,
        model,
    }))
}

pub fn load_test_elements(conn: &Connection, test_id: &str) -> anyhow::Result<Vec<Element>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, max_points, weight, sort_order
         FROM test_elements
         WHERE test_id = ?
         ORDER BY sort_order",
    )?;
    let elements = stmt
        .query_map([test_id], |r| {
            Ok(Element {
                id: r.get(0)?,
                name: r.get(1)?,
                max_points: r.get(2)?,
                weight: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(elements)
}

pub fn load_raw_score(
    conn: &Connection,
    config: &TestConfig,
    student_id: &str,
    points_earned: Option<f64>,
) -> anyhow::Result<RawScore> {
    match &config.model {
        ScoringModel::Scaled { .. } => Ok(RawScore::Points(points_earned.unwrap_or(0.0))),
        ScoringModel::Composite { .. } => {
            let mut stmt = conn.prepare(
                "SELECT element_id, points_earned
                 FROM element_grades
                 WHERE test_id = ? AND student_id = ?",
            )?;
            let grades = stmt
                .query_map((&config.id, student_id), |r| {
                    Ok(ElementGrade {
                        element_id: r.get(0)?,
                        points_earned: r.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(RawScore::Elements(grades))
        }
    }
}

/// Recompute every grade of a test from its stored raw input under the
/// test's current configuration. Callers must wrap this in a transaction
/// (tests.update does) so no mix of old- and new-formula grades is ever
/// observable. Manual overrides are preserved; only calculated_grade,
/// final_grade and updated_at move.
pub fn recalculate_test_grades(
    conn: &Connection,
    config: &TestConfig,
    now: &str,
) -> anyhow::Result<usize> {
    let rows: Vec<(String, Option<f64>, Option<f64>)> = {
        let mut stmt = conn.prepare(
            "SELECT student_id, points_earned, manual_override
             FROM grades
             WHERE test_id = ?",
        )?;
        let rows = stmt
            .query_map([&config.id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut recalculated = 0;
    for (student_id, points_earned, manual_override) in &rows {
        let raw = load_raw_score(conn, config, student_id, *points_earned)?;
        let outcome = calc::compute_grade(&config.model, &raw);
        let calculated = outcome.value();
        let final_grade = calc::finalize_grade(calculated, *manual_override);
        conn.execute(
            "UPDATE grades
             SET calculated_grade = ?, final_grade = ?, updated_at = ?
             WHERE test_id = ? AND student_id = ?",
            (calculated, final_grade, now, &config.id, student_id),
        )?;
        recalculated += 1;
    }
    Ok(recalculated)
}

/// Deleting a test removes all of its dependents in one transaction:
/// element grades, grades, elements, class-group rows, then the test row.
pub fn delete_test_cascade(conn: &Connection, test_id: &str) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM element_grades WHERE test_id = ?", [test_id])?;
    let grades_deleted = tx.execute("DELETE FROM grades WHERE test_id = ?", [test_id])?;
    tx.execute("DELETE FROM test_elements WHERE test_id = ?", [test_id])?;
    tx.execute("DELETE FROM test_groups WHERE test_id = ?", [test_id])?;
    tx.execute("DELETE FROM tests WHERE id = ?", [test_id])?;
    tx.commit()?;
    Ok(grades_deleted)
}
