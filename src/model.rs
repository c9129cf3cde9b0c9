use crate::calc::{parse_date, CalcError, DATE_FORMAT};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub student_id: String,
    pub name: String,
    #[serde(alias = "grade")]
    pub cohort: String,
    pub class_name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub subjects: Option<Vec<String>>,
}

pub const STUDENT_COLUMNS: &str = "student_id, name, grade, class_name, group_name, subjects";

impl Student {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let subjects: Option<String> = r.get(5)?;
        Ok(Self {
            student_id: r.get(0)?,
            name: r.get(1)?,
            cohort: r.get(2)?,
            class_name: r.get(3)?,
            group: r.get(4)?,
            subjects: subjects.map(|s| split_subjects(&s)),
        })
    }

    /// Trims every field and checks the required ones.
    pub fn normalized(mut self) -> Result<Self, String> {
        self.student_id = required("studentId", &self.student_id)?;
        self.name = required("name", &self.name)?;
        self.cohort = required("cohort", &self.cohort)?;
        self.class_name = required("className", &self.class_name)?;
        self.group = optional(self.group);
        self.subjects = self
            .subjects
            .map(|list| {
                list.iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty());
        Ok(self)
    }

    pub fn subjects_text(&self) -> Option<String> {
        self.subjects.as_ref().map(|list| list.join(","))
    }
}

fn split_subjects(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub teacher_id: String,
    pub name: String,
    pub subject: String,
}

pub const TEACHER_COLUMNS: &str = "teacher_id, name, subject";

impl Teacher {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            teacher_id: r.get(0)?,
            name: r.get(1)?,
            subject: r.get(2)?,
        })
    }

    pub fn normalized(mut self) -> Result<Self, String> {
        self.teacher_id = required("teacherId", &self.teacher_id)?;
        self.name = required("name", &self.name)?;
        self.subject = required("subject", &self.subject)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: i64,
    pub student_id: String,
    pub subject: String,
    pub score: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub date: String,
    pub batch: Option<String>,
    pub teacher_id: String,
}

pub const RECORD_COLUMNS: &str = "id, student_id, subject, score, type, date, batch, teacher_id";

impl Record {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            subject: r.get(2)?,
            score: r.get(3)?,
            kind: r.get(4)?,
            date: r.get(5)?,
            batch: r.get(6)?,
            teacher_id: r.get(7)?,
        })
    }
}

/// Record body for create/update; the id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInput {
    pub student_id: String,
    pub subject: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub date: String,
    #[serde(default)]
    pub batch: Option<String>,
    pub teacher_id: String,
}

impl RecordInput {
    /// Trims fields and canonicalizes the date to `YYYY-MM-DD`.
    pub fn normalized(mut self) -> Result<Self, String> {
        self.student_id = required("studentId", &self.student_id)?;
        self.subject = required("subject", &self.subject)?;
        self.teacher_id = required("teacherId", &self.teacher_id)?;
        let date = parse_date("date", &self.date).map_err(|e: CalcError| e.to_string())?;
        self.date = date.format(DATE_FORMAT).to_string();
        if let Some(score) = self.score {
            if !score.is_finite() {
                return Err("score must be a finite number".into());
            }
        }
        self.kind = optional(self.kind);
        self.batch = optional(self.batch);
        Ok(self)
    }
}

fn required(field: &str, v: &str) -> Result<String, String> {
    let t = v.trim();
    if t.is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    Ok(t.to_string())
}

fn optional(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
