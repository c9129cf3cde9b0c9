use crate::grading::{color_for_grade, GradeCalculator};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("{0}")]
    Validation(String),
    #[error("database query failed: {0}")]
    Db(#[from] rusqlite::Error),
}

impl CalcError {
    pub fn code(&self) -> &'static str {
        match self {
            CalcError::Validation(_) => "bad_params",
            CalcError::Db(_) => "db_query_failed",
        }
    }
}

/// Record filter. `cohort` is the student's year label (also accepted as
/// `grade` on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub cohort: Option<String>,
    pub class_name: Option<String>,
    pub group: Option<String>,
    pub subject: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFilter {
    #[serde(alias = "grade")]
    cohort: Option<String>,
    class_name: Option<String>,
    group: Option<String>,
    subject: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, CalcError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| {
        CalcError::Validation(format!("{} must be a YYYY-MM-DD date, got {:?}", field, raw))
    })
}

fn parse_opt_date(field: &str, raw: Option<String>) -> Result<Option<NaiveDate>, CalcError> {
    non_blank(raw).map(|s| parse_date(field, &s)).transpose()
}

impl Filter {
    pub fn validate(&self) -> Result<(), CalcError> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(CalcError::Validation(format!(
                    "endDate {} is earlier than startDate {}",
                    end, start
                )));
            }
        }
        Ok(())
    }

    pub fn require_subject(&self) -> Result<&str, CalcError> {
        self.subject
            .as_deref()
            .ok_or_else(|| CalcError::Validation("subject required".into()))
    }
}

/// Parses `params.filters`. Missing or null filters mean "everything"; blank
/// strings are treated as unset.
pub fn parse_filter(raw: Option<&serde_json::Value>) -> Result<Filter, CalcError> {
    let raw: RawFilter = match raw {
        None => RawFilter::default(),
        Some(v) if v.is_null() => RawFilter::default(),
        Some(v) if !v.is_object() => {
            return Err(CalcError::Validation("filters must be an object".into()))
        }
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| CalcError::Validation(format!("invalid filters: {}", e)))?,
    };

    let filter = Filter {
        cohort: non_blank(raw.cohort),
        class_name: non_blank(raw.class_name),
        group: non_blank(raw.group),
        subject: non_blank(raw.subject),
        start_date: parse_opt_date("startDate", raw.start_date)?,
        end_date: parse_opt_date("endDate", raw.end_date)?,
    };
    filter.validate()?;
    Ok(filter)
}

/// One homework record joined with its student.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub student_id: String,
    pub name: String,
    pub cohort: String,
    pub class_name: String,
    pub group: Option<String>,
    pub subject: String,
    pub score: Option<f64>,
    pub date: String,
}

/// Appends the filter's predicates to `sql`. Expects `records r` joined with
/// `students s`.
pub fn push_filter_sql(filter: &Filter, sql: &mut String, binds: &mut Vec<Value>) {
    let mut text = |clause: &str, v: &Option<String>| {
        if let Some(v) = v {
            sql.push_str(clause);
            binds.push(Value::Text(v.clone()));
        }
    };
    text(" AND s.grade = ?", &filter.cohort);
    text(" AND s.class_name = ?", &filter.class_name);
    text(" AND s.group_name = ?", &filter.group);
    text(" AND r.subject = ?", &filter.subject);
    let start = filter.start_date.map(|d| d.format(DATE_FORMAT).to_string());
    let end = filter.end_date.map(|d| d.format(DATE_FORMAT).to_string());
    text(" AND r.date >= ?", &start);
    text(" AND r.date <= ?", &end);
}

/// Fetches the rows matching `filter`, in record id order.
pub fn load_score_rows(conn: &Connection, filter: &Filter) -> Result<Vec<ScoreRow>, CalcError> {
    let mut sql = String::from(
        "SELECT s.student_id, s.name, s.grade, s.class_name, s.group_name,
                r.subject, r.score, r.date
         FROM records r
         JOIN students s ON s.student_id = r.student_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    push_filter_sql(filter, &mut sql, &mut binds);
    sql.push_str(" ORDER BY r.id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ScoreRow {
                student_id: r.get(0)?,
                name: r.get(1)?,
                cohort: r.get(2)?,
                class_name: r.get(3)?,
                group: r.get(4)?,
                subject: r.get(5)?,
                score: r.get(6)?,
                date: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insertion-ordered column values (subject or date keyed). Serialized as a
/// JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValues<V>(Vec<(String, V)>);

impl<V> Default for ColumnValues<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> ColumnValues<V> {
    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replaces an existing value in place, otherwise appends.
    pub fn set(&mut self, key: &str, value: V) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<V: Serialize> Serialize for ColumnValues<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentScoreSummary {
    pub id: usize,
    pub student_id: String,
    pub name: String,
    pub cohort: String,
    pub class_name: String,
    pub group: Option<String>,
    pub subjects: ColumnValues<f64>,
    pub total_score: f64,
    pub grade_letter: String,
    pub grade_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    /// Subjects with at least one average, in first-seen order.
    pub subject_columns: Vec<String>,
    pub students: Vec<StudentScoreSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDateSummary {
    pub id: usize,
    pub student_id: String,
    pub name: String,
    pub cohort: String,
    pub class_name: String,
    pub dates: ColumnValues<Option<f64>>,
    pub total_score: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDateReport {
    pub subject: String,
    /// Every date present in the rows, ascending.
    pub date_columns: Vec<String>,
    pub students: Vec<SubjectDateSummary>,
}

struct StudentAcc<'a> {
    head: &'a ScoreRow,
    // subject -> (sum, non-null count), subjects kept in first-seen order
    subjects: Vec<(&'a str, f64, usize)>,
}

/// Groups rows per student and subject, averages each subject over its
/// non-null scores, and sums the averages into the total.
pub fn summarize_scores(rows: &[ScoreRow], grading: &GradeCalculator) -> ScoreSummary {
    let mut order: Vec<StudentAcc<'_>> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for row in rows {
        let slot = *index.entry(row.student_id.as_str()).or_insert_with(|| {
            order.push(StudentAcc {
                head: row,
                subjects: Vec::new(),
            });
            order.len() - 1
        });
        let acc = &mut order[slot];
        let pos = match acc.subjects.iter().position(|(s, _, _)| *s == row.subject) {
            Some(p) => p,
            None => {
                acc.subjects.push((row.subject.as_str(), 0.0, 0));
                acc.subjects.len() - 1
            }
        };
        if let Some(score) = row.score {
            let entry = &mut acc.subjects[pos];
            entry.1 += score;
            entry.2 += 1;
        }
    }

    let mut subject_columns: Vec<String> = Vec::new();
    let students = order
        .into_iter()
        .enumerate()
        .map(|(i, acc)| {
            let mut subjects = ColumnValues::default();
            for (subject, sum, n) in acc.subjects {
                if n == 0 {
                    continue;
                }
                subjects.set(subject, sum / n as f64);
                if !subject_columns.iter().any(|c| c == subject) {
                    subject_columns.push(subject.to_string());
                }
            }
            let total_score: f64 = subjects.iter().map(|(_, avg)| *avg).sum();
            let grade_letter = grading.calculate_grade(total_score);
            let grade_color = color_for_grade(&grade_letter).to_string();
            StudentScoreSummary {
                id: i + 1,
                student_id: acc.head.student_id.clone(),
                name: acc.head.name.clone(),
                cohort: acc.head.cohort.clone(),
                class_name: acc.head.class_name.clone(),
                group: acc.head.group.clone(),
                subjects,
                total_score,
                grade_letter,
                grade_color,
            }
        })
        .collect();

    ScoreSummary {
        subject_columns,
        students,
    }
}

/// Per-student date series for one subject. Rows for other subjects are
/// skipped.
pub fn summarize_subject_by_date(subject: &str, rows: &[ScoreRow]) -> SubjectDateReport {
    let mut students: Vec<SubjectDateSummary> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut date_columns: Vec<String> = Vec::new();

    for row in rows.iter().filter(|r| r.subject == subject) {
        let slot = *index.entry(row.student_id.as_str()).or_insert_with(|| {
            students.push(SubjectDateSummary {
                id: students.len() + 1,
                student_id: row.student_id.clone(),
                name: row.name.clone(),
                cohort: row.cohort.clone(),
                class_name: row.class_name.clone(),
                dates: ColumnValues::default(),
                total_score: 0.0,
                count: 0,
            });
            students.len() - 1
        });
        let s = &mut students[slot];
        s.dates.set(&row.date, row.score);
        if let Some(score) = row.score {
            s.total_score += score;
            s.count += 1;
        }
        if !date_columns.contains(&row.date) {
            date_columns.push(row.date.clone());
        }
    }
    date_columns.sort();

    SubjectDateReport {
        subject: subject.to_string(),
        date_columns,
        students,
    }
}

pub fn score_summary_report(
    conn: &Connection,
    filter: &Filter,
    grading: &GradeCalculator,
) -> Result<ScoreSummary, CalcError> {
    filter.validate()?;
    let rows = load_score_rows(conn, filter)?;
    Ok(summarize_scores(&rows, grading))
}

pub fn subject_date_report(
    conn: &Connection,
    filter: &Filter,
) -> Result<SubjectDateReport, CalcError> {
    filter.validate()?;
    let subject = filter.require_subject()?;
    let rows = load_score_rows(conn, filter)?;
    Ok(summarize_subject_by_date(subject, &rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(student: &str, subject: &str, score: Option<f64>, date: &str) -> ScoreRow {
        ScoreRow {
            student_id: student.to_string(),
            name: format!("学生{}", student),
            cohort: "高一".to_string(),
            class_name: "高一1班".to_string(),
            group: Some("第一组".to_string()),
            subject: subject.to_string(),
            score,
            date: date.to_string(),
        }
    }

    #[test]
    fn averages_within_subject_then_sums() {
        let rows = vec![
            row("S1", "语文", Some(8.0), "2024-03-01"),
            row("S1", "语文", Some(6.0), "2024-03-02"),
            row("S1", "数学", Some(9.0), "2024-03-01"),
        ];
        let out = summarize_scores(&rows, &GradeCalculator::default());
        assert_eq!(out.students.len(), 1);
        let s1 = &out.students[0];
        assert_eq!(s1.subjects.get("语文"), Some(&7.0));
        assert_eq!(s1.subjects.get("数学"), Some(&9.0));
        assert_eq!(s1.total_score, 16.0);
        assert_eq!(s1.grade_letter, "C");
        assert_eq!(s1.grade_color, "#FFB6C1");
        assert_eq!(out.subject_columns, vec!["语文", "数学"]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let out = summarize_scores(&[], &GradeCalculator::default());
        assert!(out.students.is_empty());
        assert!(out.subject_columns.is_empty());
        let by_date = summarize_subject_by_date("数学", &[]);
        assert!(by_date.students.is_empty());
        assert!(by_date.date_columns.is_empty());
    }

    #[test]
    fn ids_follow_first_seen_order() {
        let rows = vec![
            row("S9", "数学", Some(5.0), "2024-03-01"),
            row("S1", "数学", Some(6.0), "2024-03-01"),
            row("S9", "英语", Some(4.0), "2024-03-01"),
            row("S5", "语文", Some(3.0), "2024-03-01"),
        ];
        let out = summarize_scores(&rows, &GradeCalculator::default());
        let ids: Vec<(usize, &str)> = out
            .students
            .iter()
            .map(|s| (s.id, s.student_id.as_str()))
            .collect();
        assert_eq!(ids, vec![(1, "S9"), (2, "S1"), (3, "S5")]);
        assert_eq!(out.subject_columns, vec!["数学", "英语", "语文"]);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let rows = vec![
            row("S2", "数学", Some(7.5), "2024-03-01"),
            row("S1", "英语", None, "2024-03-01"),
            row("S2", "英语", Some(5.0), "2024-03-02"),
        ];
        let calc = GradeCalculator::default();
        assert_eq!(summarize_scores(&rows, &calc), summarize_scores(&rows, &calc));
        assert_eq!(
            summarize_subject_by_date("英语", &rows),
            summarize_subject_by_date("英语", &rows)
        );
    }

    #[test]
    fn null_scores_drop_out_of_averages() {
        let rows = vec![
            row("S1", "语文", Some(9.0), "2024-03-01"),
            row("S1", "语文", None, "2024-03-02"),
            row("S1", "英语", None, "2024-03-02"),
        ];
        let out = summarize_scores(&rows, &GradeCalculator::default());
        let s1 = &out.students[0];
        assert_eq!(s1.subjects.get("语文"), Some(&9.0));
        assert_eq!(s1.subjects.get("英语"), None);
        assert_eq!(s1.subjects.iter().count(), 1);
        assert_eq!(s1.total_score, 9.0);
        assert_eq!(out.subject_columns, vec!["语文"]);
    }

    #[test]
    fn student_with_only_ungraded_rows_still_listed() {
        let rows = vec![row("S1", "数学", None, "2024-03-01")];
        let out = summarize_scores(&rows, &GradeCalculator::default());
        assert_eq!(out.students.len(), 1);
        assert_eq!(out.students[0].subjects.iter().count(), 0);
        assert_eq!(out.students[0].total_score, 0.0);
        assert_eq!(out.students[0].grade_letter, "D");
    }

    #[test]
    fn subject_by_date_records_nulls_without_counting_them() {
        let rows = vec![
            row("S1", "数学", Some(8.0), "2024-03-02"),
            row("S1", "数学", None, "2024-03-01"),
            row("S2", "数学", Some(6.0), "2024-03-03"),
            row("S1", "数学", Some(7.0), "2024-03-03"),
            row("S1", "语文", Some(1.0), "2024-03-04"),
        ];
        let out = summarize_subject_by_date("数学", &rows);
        assert_eq!(out.date_columns, vec!["2024-03-01", "2024-03-02", "2024-03-03"]);
        assert_eq!(out.students.len(), 2);

        let s1 = &out.students[0];
        assert_eq!(s1.id, 1);
        assert_eq!(s1.dates.get("2024-03-01"), Some(&None));
        assert_eq!(s1.dates.get("2024-03-02"), Some(&Some(8.0)));
        assert_eq!(s1.dates.get("2024-03-04"), None);
        assert_eq!(s1.total_score, 15.0);
        assert_eq!(s1.count, 2);

        let s2 = &out.students[1];
        assert_eq!(s2.id, 2);
        assert_eq!(s2.dates.get("2024-03-01"), None);
        assert_eq!(s2.count, 1);
    }

    #[test]
    fn subject_by_date_same_day_later_row_wins_display() {
        let rows = vec![
            row("S1", "数学", Some(4.0), "2024-03-01"),
            row("S1", "数学", Some(6.0), "2024-03-01"),
        ];
        let out = summarize_subject_by_date("数学", &rows);
        let s1 = &out.students[0];
        assert_eq!(s1.dates.iter().count(), 1);
        assert_eq!(s1.dates.get("2024-03-01"), Some(&Some(6.0)));
        assert_eq!(s1.total_score, 10.0);
        assert_eq!(s1.count, 2);
    }

    #[test]
    fn subject_required_before_any_query() {
        // No schema at all: a query would fail with a db error.
        let conn = Connection::open_in_memory().expect("open");
        let err = subject_date_report(&conn, &Filter::default()).expect_err("must fail");
        assert!(matches!(err, CalcError::Validation(_)));
        assert_eq!(err.code(), "bad_params");
        assert_eq!(err.to_string(), "subject required");
    }

    #[test]
    fn reversed_range_rejected_before_any_query() {
        let conn = Connection::open_in_memory().expect("open");
        let filter = Filter {
            start_date: NaiveDate::from_ymd_opt(2024, 3, 10),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            ..Filter::default()
        };
        let err = score_summary_report(&conn, &filter, &GradeCalculator::default())
            .expect_err("must fail");
        assert!(matches!(err, CalcError::Validation(_)));
    }

    #[test]
    fn parse_filter_accepts_blank_and_null() {
        let f = parse_filter(Some(&json!({
            "grade": "高一",
            "className": "  ",
            "group": null,
            "startDate": "2024-03-01",
            "endDate": "2024-03-01"
        })))
        .expect("parse");
        assert_eq!(f.cohort.as_deref(), Some("高一"));
        assert_eq!(f.class_name, None);
        assert_eq!(f.group, None);
        assert_eq!(f.start_date, f.end_date);

        assert_eq!(parse_filter(None).expect("none"), Filter::default());
        assert_eq!(parse_filter(Some(&json!(null))).expect("null"), Filter::default());
    }

    #[test]
    fn parse_filter_rejects_bad_input() {
        assert!(parse_filter(Some(&json!("nope"))).is_err());
        assert!(parse_filter(Some(&json!({ "startDate": "03/01/2024" }))).is_err());
        assert!(parse_filter(Some(&json!({
            "startDate": "2024-03-02",
            "endDate": "2024-03-01"
        })))
        .is_err());
    }

    #[test]
    fn load_rows_applies_student_and_record_predicates() {
        let conn = Connection::open_in_memory().expect("open");
        crate::db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO students(student_id, name, grade, class_name, group_name, subjects)
               VALUES('S1','甲','高一','高一1班','第一组',NULL),
                     ('S2','乙','高一','高一2班',NULL,NULL),
                     ('S3','丙','高二','高二1班','第一组',NULL);
             INSERT INTO teachers(teacher_id, name, subject) VALUES('T1','王','数学');
             INSERT INTO records(student_id, subject, score, type, date, batch, teacher_id)
               VALUES('S1','数学',8,NULL,'2024-03-01',NULL,'T1'),
                     ('S2','数学',7,NULL,'2024-03-05',NULL,'T1'),
                     ('S3','数学',6,NULL,'2024-03-01',NULL,'T1'),
                     ('S1','语文',NULL,NULL,'2024-03-09',NULL,'T1');",
        )
        .expect("seed");

        let all = load_score_rows(&conn, &Filter::default()).expect("all");
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].score, None);

        let f = Filter {
            cohort: Some("高一".into()),
            subject: Some("数学".into()),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 4),
            ..Filter::default()
        };
        let rows = load_score_rows(&conn, &f).expect("filtered");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].student_id, "S1");

        let f = Filter {
            group: Some("第一组".into()),
            ..Filter::default()
        };
        let ids: Vec<String> = load_score_rows(&conn, &f)
            .expect("group")
            .into_iter()
            .map(|r| r.student_id)
            .collect();
        assert_eq!(ids, vec!["S1", "S3", "S1"]);
    }
}
