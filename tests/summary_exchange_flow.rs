use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_homeworkd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn homeworkd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn result(v: serde_json::Value) -> serde_json::Value {
    assert_eq!(v["ok"], json!(true), "expected ok: {}", v);
    v["result"].clone()
}

fn error_code(v: &serde_json::Value) -> String {
    assert_eq!(v["ok"], json!(false), "expected error: {}", v);
    v["error"]["code"].as_str().unwrap_or_default().to_string()
}

fn seed(call: &mut impl FnMut(&str, &str, serde_json::Value) -> serde_json::Value) {
    result(call(
        "seed-s1",
        "students.create",
        json!({ "student": {
            "studentId": "S1", "name": "张三", "grade": "高一", "className": "高一1班"
        }}),
    ));
    result(call(
        "seed-s2",
        "students.create",
        json!({ "student": {
            "studentId": "S2", "name": "李四", "grade": "高一", "className": "高一2班"
        }}),
    ));
    result(call(
        "seed-t1",
        "teachers.create",
        json!({ "teacher": { "teacherId": "T1", "name": "王老师", "subject": "语文" } }),
    ));
    result(call(
        "seed-t2",
        "teachers.create",
        json!({ "teacher": { "teacherId": "T2", "name": "赵老师", "subject": "数学" } }),
    ));
    let rows = [
        ("语文", json!(8), "2024-03-01", "T1"),
        ("语文", json!(6), "2024-03-02", "T1"),
        ("数学", json!(9), "2024-03-01", "T2"),
    ];
    for (i, (subject, score, date, teacher)) in rows.into_iter().enumerate() {
        result(call(
            &format!("seed-r{}", i),
            "records.create",
            json!({ "record": {
                "studentId": "S1", "subject": subject, "score": score,
                "date": date, "teacherId": teacher
            }}),
        ));
    }
}

#[test]
fn summaries_grade_and_export() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let mut call = |id: &str, method: &str, params: serde_json::Value| {
        request(&mut stdin, &mut reader, id, method, params)
    };

    result(call(
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    ));
    seed(&mut call);

    let summary = result(call("2", "summary.scores", json!({})));
    assert_eq!(summary["subjectColumns"], json!(["语文", "数学"]));
    let students = summary["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["id"], json!(1));
    assert_eq!(students[0]["subjects"]["语文"], json!(7.0));
    assert_eq!(students[0]["subjects"]["数学"], json!(9.0));
    assert_eq!(students[0]["totalScore"], json!(16.0));
    assert_eq!(students[0]["gradeLetter"], json!("C"));
    assert_eq!(students[0]["gradeColor"], json!("#FFB6C1"));

    let code = error_code(&call("3", "summary.subjectByDate", json!({ "filters": {} })));
    assert_eq!(code, "bad_params");
    let code = error_code(&call(
        "4",
        "summary.scores",
        json!({ "filters": { "startDate": "2024-03-05", "endDate": "2024-03-01" } }),
    ));
    assert_eq!(code, "bad_params");

    let by_date = result(call(
        "5",
        "summary.subjectByDate",
        json!({ "filters": { "subject": "语文" } }),
    ));
    assert_eq!(by_date["dateColumns"], json!(["2024-03-01", "2024-03-02"]));
    assert_eq!(by_date["students"][0]["totalScore"], json!(14.0));
    assert_eq!(by_date["students"][0]["count"], json!(2));

    let sheet = result(call("6", "summary.scoresSheet", json!({})));
    let header = sheet["columns"].as_array().expect("columns");
    assert_eq!(header.first(), Some(&json!("学号")));
    assert_eq!(header.last(), Some(&json!("等级")));
    let letter = sheet["rows"][0]
        .as_array()
        .and_then(|r| r.last())
        .expect("letter cell");
    assert_eq!(letter["fill"], json!("#FFB6C1"));

    let out = workspace.path().join("out").join("summary.csv");
    let exported = result(call(
        "7",
        "exchange.exportScoreSummary",
        json!({ "outPath": out.to_string_lossy() }),
    ));
    assert_eq!(exported["rowCount"], json!(1));
    let text = std::fs::read_to_string(&out).expect("read export");
    assert!(text.starts_with('\u{feff}'));
    assert!(text.contains("学号,姓名,年级,班级,小组,语文,数学,总分,等级"));
    assert!(text.contains("S1,张三,高一,高一1班,,7,9,16,C"), "{}", text);

    let empty = call(
        "8",
        "exchange.exportSubjectSummary",
        json!({
            "filters": { "subject": "物理" },
            "outPath": workspace.path().join("none.csv").to_string_lossy()
        }),
    );
    assert_eq!(error_code(&empty), "not_found");

    drop(call);
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn template_export_and_record_import() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let mut call = |id: &str, method: &str, params: serde_json::Value| {
        request(&mut stdin, &mut reader, id, method, params)
    };

    result(call(
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    ));
    seed(&mut call);

    let template = workspace.path().join("template.csv");
    let exported = result(call(
        "2",
        "exchange.exportTemplate",
        json!({ "grade": "高一", "classNames": ["高一2班"], "outPath": template.to_string_lossy() }),
    ));
    assert_eq!(exported["rowCount"], json!(1));
    let text = std::fs::read_to_string(&template).expect("read template");
    assert!(text.contains("学号,姓名,班级,学科,分数,日期,批次,教师ID"));
    assert!(text.contains("S2,李四,高一2班"));

    let missing = call(
        "3",
        "exchange.exportTemplate",
        json!({ "grade": "高三", "outPath": workspace.path().join("x.csv").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let import = workspace.path().join("import.csv");
    std::fs::write(
        &import,
        "\u{feff}学号,姓名,学科,分数,日期,批次,教师ID\n\
         S2,李四,数学,7.5,2024/03/04,第2周,T2\n\
         S404,无名,数学,5,2024-03-04,,T2\n\
         S2,李四,数学,abc,2024-03-04,,T2\n\
         S2,李四,语文,,2024-03-04 08:00:00,,T1\n",
    )
    .expect("write import");
    let imported = result(call(
        "4",
        "exchange.importRecords",
        json!({ "inPath": import.to_string_lossy() }),
    ));
    assert_eq!(imported["importedCount"], json!(2));
    let failed = imported["failedRecords"].as_array().expect("failedRecords");
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[0]["studentId"], json!("S404"));
    assert_eq!(failed[1]["line"], json!(4));

    let listed = result(call(
        "5",
        "records.list",
        json!({ "filters": { "className": "高一2班" } }),
    ));
    let records = listed["records"].as_array().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["date"], json!("2024-03-04"));
    assert_eq!(records[0]["batch"], json!("第2周"));
    assert!(records[1]["score"].is_null());

    std::fs::write(workspace.path().join("bad.csv"), "学号,姓名\nS2,李四\n").expect("write bad csv");
    let code = error_code(&call(
        "6",
        "exchange.importRecords",
        json!({ "inPath": workspace.path().join("bad.csv").to_string_lossy() }),
    ));
    assert_eq!(code, "bad_params");

    drop(call);
    drop(stdin);
    let _ = child.wait();
}
