use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use sim_core::Location;
use std::path::PathBuf;

use crate::ts;

/// Experiment query predicate. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub id_contains: Option<String>,
    pub name_contains: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub location: Option<Location>,
    pub suite_id: Option<String>,
    /// Some(true): at least one simulation non-terminal. Some(false): none.
    pub active: Option<bool>,
    pub working_directory: Option<PathBuf>,
    pub limit: Option<usize>,
}

impl ExperimentFilter {
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Self::default()
        }
    }

    pub(crate) fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = String::from(
            "SELECT id, name, location, block, working_directory, sim_root, revision, \
             command_line, suite_id, created_at FROM experiments e",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(id) = self.id_contains.as_deref().filter(|s| !s.is_empty()) {
            clauses.push("instr(e.id, ?) > 0");
            params.push(SqlValue::Text(id.to_string()));
        }
        if let Some(name) = self.name_contains.as_deref().filter(|s| !s.is_empty()) {
            clauses.push("instr(e.name, ?) > 0");
            params.push(SqlValue::Text(name.to_string()));
        }
        if let Some(after) = self.created_after {
            clauses.push("e.created_at >= ?");
            params.push(SqlValue::Text(ts(&after)));
        }
        if let Some(before) = self.created_before {
            clauses.push("e.created_at <= ?");
            params.push(SqlValue::Text(ts(&before)));
        }
        if let Some(location) = self.location {
            clauses.push("e.location = ?");
            params.push(SqlValue::Text(location.as_str().to_string()));
        }
        if let Some(suite) = self.suite_id.as_deref() {
            clauses.push("e.suite_id = ?");
            params.push(SqlValue::Text(suite.to_string()));
        }
        if let Some(dir) = self.working_directory.as_ref() {
            clauses.push("e.working_directory = ?");
            params.push(SqlValue::Text(dir.to_string_lossy().to_string()));
        }
        match self.active {
            Some(true) => clauses.push(ACTIVE_CLAUSE),
            Some(false) => clauses.push(INACTIVE_CLAUSE),
            None => {}
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY e.created_at DESC, e.id DESC");
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }
        (sql, params)
    }
}

const ACTIVE_CLAUSE: &str = "EXISTS (SELECT 1 FROM simulations s WHERE s.experiment_id = e.id \
     AND s.status NOT IN ('Succeeded', 'Failed', 'Canceled'))";

const INACTIVE_CLAUSE: &str = "NOT EXISTS (SELECT 1 FROM simulations s WHERE s.experiment_id = e.id \
     AND s.status NOT IN ('Succeeded', 'Failed', 'Canceled'))";
