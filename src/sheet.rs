//! Tabular boundary: summary sheets for export and record rows for import.
//!
//! A [`SheetModel`] is what a spreadsheet renderer needs (headers, cells and
//! per-cell fills). CSV is the on-disk format; fills are dropped there.

use crate::calc::{ScoreSummary, SubjectDateReport, DATE_FORMAT};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const UTF8_BOM: &str = "\u{feff}";

pub const COL_STUDENT_ID: &str = "学号";
pub const COL_NAME: &str = "姓名";
pub const COL_COHORT: &str = "年级";
pub const COL_CLASS: &str = "班级";
pub const COL_GROUP: &str = "小组";
pub const COL_TOTAL: &str = "总分";
pub const COL_GRADE_LETTER: &str = "等级";
pub const COL_COUNT: &str = "次数";
pub const COL_SUBJECT: &str = "学科";
pub const COL_SCORE: &str = "分数";
pub const COL_DATE: &str = "日期";
pub const COL_BATCH: &str = "批次";
pub const COL_TYPE: &str = "类型";
pub const COL_TEACHER_ID: &str = "教师ID";

pub const IMPORT_REQUIRED_COLUMNS: [&str; 5] =
    [COL_STUDENT_ID, COL_NAME, COL_SUBJECT, COL_DATE, COL_TEACHER_ID];

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("missing required column: {0}")]
    MissingColumn(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SheetError {
    pub fn code(&self) -> &'static str {
        match self {
            SheetError::MissingColumn(_) => "bad_params",
            SheetError::Csv(_) => "csv_failed",
            SheetError::Io(_) => "io_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Empty,
}

impl CellValue {
    fn text(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }

    fn opt_text(s: Option<&str>) -> Self {
        s.map(Self::text).unwrap_or(CellValue::Empty)
    }

    fn opt_number(v: Option<f64>) -> Self {
        v.map(CellValue::Number).unwrap_or(CellValue::Empty)
    }

    fn to_csv_field(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Empty => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetCell {
    pub value: CellValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
}

impl From<CellValue> for SheetCell {
    fn from(value: CellValue) -> Self {
        Self { value, fill: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetModel {
    pub sheet_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SheetCell>>,
}

/// `[学号, 姓名, 年级, 班级, 小组]`, one column per observed subject, then
/// `[总分, 等级]`. The letter cell is filled with the grade color.
pub fn score_summary_sheet(summary: &ScoreSummary) -> SheetModel {
    let mut columns: Vec<String> = [COL_STUDENT_ID, COL_NAME, COL_COHORT, COL_CLASS, COL_GROUP]
        .iter()
        .map(|c| c.to_string())
        .collect();
    columns.extend(summary.subject_columns.iter().cloned());
    columns.push(COL_TOTAL.to_string());
    columns.push(COL_GRADE_LETTER.to_string());

    let rows: Vec<Vec<SheetCell>> = summary
        .students
        .iter()
        .map(|s| {
            let mut row: Vec<SheetCell> = vec![
                CellValue::text(&s.student_id).into(),
                CellValue::text(&s.name).into(),
                CellValue::text(&s.cohort).into(),
                CellValue::text(&s.class_name).into(),
                CellValue::opt_text(s.group.as_deref()).into(),
            ];
            for subject in &summary.subject_columns {
                row.push(CellValue::opt_number(s.subjects.get(subject).copied()).into());
            }
            row.push(CellValue::Number(s.total_score).into());
            row.push(SheetCell {
                value: CellValue::text(&s.grade_letter),
                fill: Some(s.grade_color.clone()).filter(|c| !c.is_empty()),
            });
            row
        })
        .collect();

    SheetModel {
        sheet_name: "成绩汇总".to_string(),
        columns,
        rows,
    }
}

/// `[学号, 姓名, 年级, 班级]`, one column per date ascending, then
/// `[总分, 次数]`.
pub fn subject_date_sheet(report: &SubjectDateReport) -> SheetModel {
    let mut columns: Vec<String> = [COL_STUDENT_ID, COL_NAME, COL_COHORT, COL_CLASS]
        .iter()
        .map(|c| c.to_string())
        .collect();
    columns.extend(report.date_columns.iter().cloned());
    columns.push(COL_TOTAL.to_string());
    columns.push(COL_COUNT.to_string());

    let rows: Vec<Vec<SheetCell>> = report
        .students
        .iter()
        .map(|s| {
            let mut row: Vec<SheetCell> = vec![
                CellValue::text(&s.student_id).into(),
                CellValue::text(&s.name).into(),
                CellValue::text(&s.cohort).into(),
                CellValue::text(&s.class_name).into(),
            ];
            for date in &report.date_columns {
                let v = s.dates.get(date).copied().flatten();
                row.push(CellValue::opt_number(v).into());
            }
            row.push(CellValue::Number(s.total_score).into());
            row.push(CellValue::Number(s.count as f64).into());
            row
        })
        .collect();

    SheetModel {
        sheet_name: format!("{}学科作业汇总", report.subject),
        columns,
        rows,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateStudent {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
}

/// One blank entry row per student, dated `today`.
pub fn record_template_sheet(students: &[TemplateStudent], today: NaiveDate) -> SheetModel {
    let columns: Vec<String> = [
        COL_STUDENT_ID,
        COL_NAME,
        COL_CLASS,
        COL_SUBJECT,
        COL_SCORE,
        COL_DATE,
        COL_BATCH,
        COL_TEACHER_ID,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    let date = today.format(DATE_FORMAT).to_string();
    let rows: Vec<Vec<SheetCell>> = students
        .iter()
        .map(|s| {
            vec![
                CellValue::text(&s.student_id).into(),
                CellValue::text(&s.name).into(),
                CellValue::text(&s.class_name).into(),
                CellValue::Empty.into(),
                CellValue::Empty.into(),
                CellValue::text(&date).into(),
                CellValue::Empty.into(),
                CellValue::Empty.into(),
            ]
        })
        .collect();
    SheetModel {
        sheet_name: "作业录入".to_string(),
        columns,
        rows,
    }
}

/// Writes the sheet as UTF-8 CSV with a BOM so spreadsheet apps pick the
/// right encoding. Returns the number of data rows.
pub fn write_csv(model: &SheetModel, path: &Path) -> Result<usize, SheetError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(UTF8_BOM.as_bytes())?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(&model.columns)?;
    for row in &model.rows {
        writer.write_record(row.iter().map(|c| c.value.to_csv_field()))?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = model.rows.len(), "wrote csv");
    Ok(model.rows.len())
}

/// One data row of a record import, raw strings as found in the file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImportRow {
    /// 1-based line in the file, header included.
    pub line: usize,
    pub student_id: String,
    pub name: String,
    pub subject: String,
    pub date: String,
    pub teacher_id: String,
    pub score: Option<String>,
    pub kind: Option<String>,
    pub batch: Option<String>,
}

pub fn read_record_import(path: &Path) -> Result<Vec<ImportRow>, SheetError> {
    let bytes = std::fs::read(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());

    let headers: HashMap<String, usize> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim_start_matches(UTF8_BOM).trim().to_string(), i))
        .collect();
    for col in IMPORT_REQUIRED_COLUMNS {
        if !headers.contains_key(col) {
            return Err(SheetError::MissingColumn(col.to_string()));
        }
    }

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| content_line(&bytes, p));
        let cell = |col: &str| -> Option<String> {
            headers
                .get(col)
                .and_then(|idx| record.get(*idx))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        out.push(ImportRow {
            line,
            student_id: cell(COL_STUDENT_ID).unwrap_or_default(),
            name: cell(COL_NAME).unwrap_or_default(),
            subject: cell(COL_SUBJECT).unwrap_or_default(),
            date: cell(COL_DATE).unwrap_or_default(),
            teacher_id: cell(COL_TEACHER_ID).unwrap_or_default(),
            score: cell(COL_SCORE),
            kind: cell(COL_TYPE),
            batch: cell(COL_BATCH),
        });
    }
    Ok(out)
}

/// Line of the first non-blank byte at or after `pos`. Record positions point
/// at the end of the previous record, before any blank lines the reader skips.
fn content_line(bytes: &[u8], pos: &csv::Position) -> usize {
    let skipped = bytes
        .get(pos.byte() as usize..)
        .unwrap_or_default()
        .iter()
        .take_while(|b| **b == b'\n' || **b == b'\r')
        .filter(|b| **b == b'\n')
        .count();
    pos.line() as usize + skipped
}

/// Accepts `2024-03-01`, `2024/03/01` and either followed by a time part.
pub fn parse_import_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.trim().split(|c: char| c == ' ' || c == 'T').next()?;
    NaiveDate::parse_from_str(day, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y/%m/%d"))
        .ok()
}
