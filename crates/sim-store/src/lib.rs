use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use sim_core::{
    AnalyzerBinding, Error, Experiment, Result, Simulation, SimulationDraft, SimulationStatus,
    StatusCounts, StatusUpdate,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

mod filter;

pub use filter::ExperimentFilter;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    location TEXT NOT NULL,
    block TEXT NOT NULL,
    working_directory TEXT NOT NULL,
    sim_root TEXT NOT NULL,
    revision TEXT,
    command_line TEXT NOT NULL,
    suite_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiments_created ON experiments(created_at);
CREATE TABLE IF NOT EXISTS simulations (
    id TEXT PRIMARY KEY,
    experiment_id TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL,
    config TEXT NOT NULL,
    pid INTEGER,
    retries INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(experiment_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_simulations_experiment ON simulations(experiment_id, status);
CREATE TABLE IF NOT EXISTS analyzers (
    experiment_id TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    args TEXT NOT NULL,
    PRIMARY KEY(experiment_id, position)
);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SIM_COLUMNS: &str =
    "id, experiment_id, seq, status, message, tags, config, pid, retries, created_at";

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<SimulationStatus> {
    let raw: String = row.get(idx)?;
    raw.parse::<SimulationStatus>()
        .map_err(|e| conversion_err(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let location: String = row.get(2)?;
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        location: location.parse().map_err(|e: Error| {
            conversion_err(
                2,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )
        })?,
        block: row.get(3)?,
        working_directory: PathBuf::from(row.get::<_, String>(4)?),
        sim_root: PathBuf::from(row.get::<_, String>(5)?),
        revision: row.get(6)?,
        command_line: row.get(7)?,
        suite_id: row.get(8)?,
        created_at: parse_ts(row, 9)?,
        analyzers: Vec::new(),
    })
}

fn simulation_from_row(row: &Row<'_>) -> rusqlite::Result<Simulation> {
    let tags = match parse_json(row, 5)? {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    Ok(Simulation {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        seq: row.get(2)?,
        status: parse_status(row, 3)?,
        message: row.get(4)?,
        tags,
        config: parse_json(row, 6)?,
        pid: row.get(7)?,
        retries: row.get(8)?,
        created_at: parse_ts(row, 9)?,
    })
}

/// Result of applying one tick of backend observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// Rows whose status, message or handle changed.
    pub changed: Vec<String>,
    /// Observations rejected by the status state machine.
    pub stale: Vec<String>,
    /// Observations for ids not in the store.
    pub unknown: Vec<String>,
}

/// Relational persistence for experiments and simulations.
///
/// One connection per process behind a mutex serializes writers inside the
/// process; WAL mode plus a busy timeout lets the daemon, interactive
/// commands and analysis workers share the database file across processes.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            sim_core::fsutil::ensure_dir(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(10)).map_err(db_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(db_err)?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(path = %path.display(), %mode, "job store is not in WAL mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), "job store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("job store connection mutex poisoned".to_string()))
    }

    pub fn create_experiment(&self, exp: &Experiment) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "INSERT INTO experiments (id, name, location, block, working_directory, sim_root, \
             revision, command_line, suite_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                exp.id,
                exp.name,
                exp.location.as_str(),
                exp.block,
                exp.working_directory.to_string_lossy(),
                exp.sim_root.to_string_lossy(),
                exp.revision,
                exp.command_line,
                exp.suite_id,
                ts(&exp.created_at),
            ],
        )
        .map_err(db_err)?;
        insert_analyzers(&tx, &exp.id, &exp.analyzers).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        info!(experiment = %exp.id, name = %exp.name, location = %exp.location, "experiment created");
        Ok(())
    }

    /// Replaces the registered analyzers of an experiment.
    pub fn set_analyzers(&self, exp_id: &str, bindings: &[AnalyzerBinding]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM analyzers WHERE experiment_id = ?1",
            params![exp_id],
        )
        .map_err(db_err)?;
        insert_analyzers(&tx, exp_id, bindings).map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    pub fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let conn = self.conn()?;
        let exp = conn
            .query_row(
                "SELECT id, name, location, block, working_directory, sim_root, revision, \
                 command_line, suite_id, created_at FROM experiments WHERE id = ?1",
                params![id],
                experiment_from_row,
            )
            .optional()
            .map_err(db_err)?;
        match exp {
            Some(mut exp) => {
                exp.analyzers = load_analyzers(&conn, &exp.id).map_err(db_err)?;
                Ok(Some(exp))
            }
            None => Ok(None),
        }
    }

    /// Experiments matching `filter`, newest first.
    pub fn query_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        let conn = self.conn()?;
        let (sql, params) = filter.to_sql();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), experiment_from_row)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let mut exp = row.map_err(db_err)?;
            exp.analyzers = load_analyzers(&conn, &exp.id).map_err(db_err)?;
            out.push(exp);
        }
        Ok(out)
    }

    /// Persists one creator batch. Sequence numbers continue after the
    /// highest existing one; either every row of the batch is stored or none.
    pub fn insert_simulations(
        &self,
        exp_id: &str,
        drafts: &[SimulationDraft],
    ) -> Result<Vec<Simulation>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let max_seq: u32 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM simulations WHERE experiment_id = ?1",
                params![exp_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(drafts.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO simulations (id, experiment_id, seq, status, message, tags, \
                     config, pid, retries, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, '', ?5, ?6, NULL, 0, ?7, ?7)",
                )
                .map_err(db_err)?;
            for (offset, draft) in drafts.iter().enumerate() {
                let seq = max_seq + 1 + offset as u32;
                let id = Simulation::local_id(exp_id, seq);
                let tags = serde_json::to_string(&draft.tags)?;
                let config = serde_json::to_string(&draft.config)?;
                stmt.execute(params![
                    id,
                    exp_id,
                    seq,
                    SimulationStatus::Created.as_str(),
                    tags,
                    config,
                    ts(&now),
                ])
                .map_err(db_err)?;
                created.push(Simulation {
                    id,
                    experiment_id: exp_id.to_string(),
                    seq,
                    status: SimulationStatus::Created,
                    message: String::new(),
                    tags: draft.tags.clone(),
                    config: draft.config.clone(),
                    pid: None,
                    retries: 0,
                    created_at: now,
                });
            }
        }
        tx.commit().map_err(db_err)?;
        debug!(experiment = %exp_id, count = created.len(), "simulation batch stored");
        Ok(created)
    }

    pub fn get_simulation(&self, id: &str) -> Result<Option<Simulation>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM simulations WHERE id = ?1", SIM_COLUMNS),
            params![id],
            simulation_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// All simulations of an experiment in creation order.
    pub fn simulations(&self, exp_id: &str) -> Result<Vec<Simulation>> {
        self.simulations_where(exp_id, None)
    }

    /// Simulations the backend still has to launch (`Created` or `Retry`).
    pub fn pending_simulations(&self, exp_id: &str) -> Result<Vec<Simulation>> {
        self.simulations_where(
            exp_id,
            Some(&[SimulationStatus::Created, SimulationStatus::Retry]),
        )
    }

    fn simulations_where(
        &self,
        exp_id: &str,
        statuses: Option<&[SimulationStatus]>,
    ) -> Result<Vec<Simulation>> {
        let conn = self.conn()?;
        let mut sql = format!(
            "SELECT {} FROM simulations WHERE experiment_id = ?",
            SIM_COLUMNS
        );
        let mut args = vec![exp_id.to_string()];
        if let Some(statuses) = statuses {
            let marks = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", marks));
            args.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
        sql.push_str(" ORDER BY seq");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), simulation_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn status_counts(&self, exp_id: &str) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(1) FROM simulations WHERE experiment_id = ?1 GROUP BY status",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![exp_id], |row| {
                Ok((parse_status(row, 0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row.map_err(db_err)?;
            counts.0.insert(status, n.max(0) as usize);
        }
        Ok(counts)
    }

    pub fn is_done(&self, exp_id: &str) -> Result<bool> {
        Ok(self.status_counts(exp_id)?.is_done())
    }

    /// Applies one tick of status observations in a single transaction.
    /// Each observation is checked against the persisted status; transitions
    /// the state machine forbids are dropped, so a stale replay never
    /// overwrites a fresher status. Entering `Retry` bumps the retry counter
    /// and terminal states release the process handle.
    pub fn apply_updates(&self, updates: &[StatusUpdate]) -> Result<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();
        if updates.is_empty() {
            return Ok(outcome);
        }
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let now = ts(&Utc::now());
        for update in updates {
            let current = tx
                .query_row(
                    "SELECT status, message, pid FROM simulations WHERE id = ?1",
                    params![update.sim_id],
                    |row| {
                        Ok((
                            parse_status(row, 0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<u32>>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;
            let Some((status, message, pid)) = current else {
                outcome.unknown.push(update.sim_id.clone());
                continue;
            };
            if !status.can_transition(update.status) {
                debug!(sim = %update.sim_id, from = %status, to = %update.status, "stale status dropped");
                outcome.stale.push(update.sim_id.clone());
                continue;
            }
            let next_pid = if update.status.is_terminal() || update.status == SimulationStatus::Retry {
                None
            } else {
                update.pid.or(pid)
            };
            if status == update.status && message == update.message && pid == next_pid {
                continue;
            }
            let bump = u32::from(update.status == SimulationStatus::Retry && status != SimulationStatus::Retry);
            tx.execute(
                "UPDATE simulations SET status = ?1, message = ?2, pid = ?3, \
                 retries = retries + ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    update.status.as_str(),
                    update.message,
                    next_pid,
                    bump,
                    now,
                    update.sim_id
                ],
            )
            .map_err(db_err)?;
            outcome.changed.push(update.sim_id.clone());
        }
        tx.commit().map_err(db_err)?;
        Ok(outcome)
    }

    /// Optimistically marks non-terminal simulations `CancelRequested`.
    /// `None` targets every simulation of the experiment. Returns the ids
    /// that were marked.
    pub fn request_cancel(&self, exp_id: &str, sim_ids: Option<&[String]>) -> Result<Vec<String>> {
        let sims = self.simulations(exp_id)?;
        let updates = sims
            .iter()
            .filter(|s| sim_ids.map(|ids| ids.contains(&s.id)).unwrap_or(true))
            .filter(|s| !s.status.is_terminal() && s.status != SimulationStatus::CancelRequested)
            .map(|s| {
                StatusUpdate::new(
                    s.id.clone(),
                    SimulationStatus::CancelRequested,
                    "cancel requested",
                )
            })
            .collect::<Vec<_>>();
        Ok(self.apply_updates(&updates)?.changed)
    }

    /// Replaces local simulation ids with backend-assigned ids in one
    /// transaction.
    pub fn rekey_simulations(&self, exp_id: &str, mapping: &BTreeMap<String, String>) -> Result<()> {
        if mapping.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        for (local, remote) in mapping {
            if local == remote {
                continue;
            }
            let n = tx
                .execute(
                    "UPDATE simulations SET id = ?1 WHERE id = ?2 AND experiment_id = ?3",
                    params![remote, local, exp_id],
                )
                .map_err(db_err)?;
            if n == 0 {
                warn!(experiment = %exp_id, %local, %remote, "backend id for unknown simulation");
            }
        }
        tx.commit().map_err(db_err)
    }

    /// Removes the experiment row; simulations and analyzer bindings follow
    /// through the cascade. Returns whether a row was removed.
    pub fn delete_experiment(&self, exp_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute("DELETE FROM experiments WHERE id = ?1", params![exp_id])
            .map_err(db_err)?;
        if n > 0 {
            info!(experiment = %exp_id, "experiment removed from store");
        }
        Ok(n > 0)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn clear_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])
            .map_err(db_err)?;
        Ok(())
    }
}

fn insert_analyzers(
    conn: &Connection,
    exp_id: &str,
    bindings: &[AnalyzerBinding],
) -> rusqlite::Result<()> {
    for (position, binding) in bindings.iter().enumerate() {
        conn.execute(
            "INSERT INTO analyzers (experiment_id, position, name, version, args) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                exp_id,
                position as i64,
                binding.name,
                binding.version,
                binding.args.to_string()
            ],
        )?;
    }
    Ok(())
}

fn load_analyzers(conn: &Connection, exp_id: &str) -> rusqlite::Result<Vec<AnalyzerBinding>> {
    let mut stmt = conn.prepare(
        "SELECT name, version, args FROM analyzers WHERE experiment_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![exp_id], |row| {
        Ok(AnalyzerBinding {
            name: row.get(0)?,
            version: row.get(1)?,
            args: parse_json(row, 2)?,
        })
    })?;
    rows.collect()
}
