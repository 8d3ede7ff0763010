use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Staged exam-protocol metadata collected by the wizard before commit.
#[derive(Debug, Clone)]
pub struct ExamDraft {
    pub date: String,
    pub term: Option<u32>,
    pub academic_year: String,
    pub exam_type_id: String,
    pub discipline: String,
    pub department_id: String,
    pub commission_members: String,
}

/// Wizard progress for one caller session. Nothing is written to the
/// database until the grading stage commits; state lives in memory only and
/// is lost on restart.
#[derive(Debug, Clone)]
pub enum ExamWizard {
    Metadata(ExamDraft),
    Roster {
        draft: ExamDraft,
        student_ids: Vec<String>,
    },
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub shutdown: Arc<AtomicBool>,
    pub wizards: HashMap<String, ExamWizard>,
}

impl AppState {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        AppState {
            workspace: None,
            db: None,
            shutdown,
            wizards: HashMap::new(),
        }
    }
}
