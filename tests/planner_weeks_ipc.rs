use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_cijferd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cijferd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn week_numbers(result: &serde_json::Value) -> Vec<i64> {
    result
        .get("weeks")
        .and_then(|v| v.as_array())
        .expect("weeks array")
        .iter()
        .map(|w| w.get("week").and_then(|v| v.as_i64()).expect("week"))
        .collect()
}

fn year_of_week(result: &serde_json::Value, week: i64) -> i64 {
    result
        .get("weeks")
        .and_then(|v| v.as_array())
        .expect("weeks array")
        .iter()
        .find(|w| w.get("week").and_then(|v| v.as_i64()) == Some(week))
        .and_then(|w| w.get("year").and_then(|v| v.as_i64()))
        .unwrap_or_else(|| panic!("week {} not in sequence", week))
}

#[test]
fn week_sequence_wraps_and_labels_calendar_years() {
    let workspace = temp_dir("cijferd-planner-weeks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Slash form is normalized to the dashed canonical school year.
    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "planner.createPlan",
        json!({
            "name": "Wiskunde 4HAVO",
            "schoolYear": "2024/2025",
            "weekRangeStart": 35,
            "weekRangeEnd": 30
        }),
    );
    assert_eq!(plan.get("schoolYear"), Some(&json!("2024-2025")));
    let plan_id = plan
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "planner.weeks",
        json!({ "planId": plan_id }),
    );
    let weeks = week_numbers(&result);
    // 35..52 then 1..30; week 53 is never touched, so the wrap cap is 52.
    assert_eq!(weeks.len(), 48);
    assert_eq!(weeks[0], 35);
    assert_eq!(weeks[17], 52);
    assert_eq!(weeks[18], 1);
    assert_eq!(weeks[47], 30);
    assert!(!weeks.contains(&53));

    // Default summer-threshold policy: autumn weeks carry the start
    // year, spring weeks the end year.
    assert_eq!(year_of_week(&result, 35), 2024);
    assert_eq!(year_of_week(&result, 52), 2024);
    assert_eq!(year_of_week(&result, 1), 2025);
    assert_eq!(year_of_week(&result, 29), 2025);
    assert_eq!(year_of_week(&result, 30), 2024);

    // The older range-relative policy stays available by name.
    let relative = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "planner.weeks",
        json!({ "planId": plan_id, "yearPolicy": "rangeRelative" }),
    );
    assert_eq!(year_of_week(&relative, 40), 2024);
    assert_eq!(year_of_week(&relative, 10), 2025);
}

#[test]
fn week_sequence_includes_week_53_when_range_touches_it() {
    let workspace = temp_dir("cijferd-planner-week53");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "planner.createPlan",
        json!({
            "name": "Blokplanning",
            "schoolYear": "2020",
            "weekRangeStart": 51,
            "weekRangeEnd": 53
        }),
    );
    // Bare year expands to the full school-year span.
    assert_eq!(plan.get("schoolYear"), Some(&json!("2020-2021")));
    let plan_id = plan
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "planner.weeks",
        json!({ "planId": plan_id }),
    );
    assert_eq!(week_numbers(&result), vec![51, 52, 53]);
    assert_eq!(year_of_week(&result, 53), 2020);
}

#[test]
fn single_week_plan_yields_single_entry() {
    let workspace = temp_dir("cijferd-planner-single");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "planner.createPlan",
        json!({
            "name": "Projectweek",
            "schoolYear": "2024-2025",
            "weekRangeStart": 5,
            "weekRangeEnd": 5
        }),
    );
    let plan_id = plan
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "planner.weeks",
        json!({ "planId": plan_id }),
    );
    assert_eq!(week_numbers(&result), vec![5]);
}
