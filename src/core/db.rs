use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::NexusError;

use super::job::{Job, JobStatus};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    artifact_id TEXT NOT NULL,
    git_repo_url TEXT,
    git_branch TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    created_at REAL NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    num_gpus INTEGER NOT NULL DEFAULT 1,
    env TEXT NOT NULL DEFAULT '{}',
    node TEXT,
    jobrc TEXT,
    integrations TEXT NOT NULL DEFAULT '',
    notifications TEXT NOT NULL DEFAULT '',
    notification_messages TEXT NOT NULL DEFAULT '{}',
    pid INTEGER,
    dir TEXT,
    started_at REAL,
    gpu_idxs TEXT,
    gpu_idxs_assigned TEXT NOT NULL DEFAULT '',
    wandb_url TEXT,
    marked_for_kill INTEGER NOT NULL DEFAULT 0,
    ignore_blacklist INTEGER NOT NULL DEFAULT 0,
    completed_at REAL,
    exit_code INTEGER,
    error_message TEXT,
    user TEXT NOT NULL,
    session_name TEXT,
    CHECK (status IN ('queued', 'running', 'completed', 'failed', 'killed'))
);

CREATE TABLE IF NOT EXISTS blacklisted_gpus (
    node TEXT NOT NULL,
    gpu_idx INTEGER NOT NULL,
    PRIMARY KEY (node, gpu_idx)
);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    created_at REAL NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_node ON jobs(node) WHERE node IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_artifact_queued ON jobs(artifact_id) WHERE status = 'queued';
"#;

/// Handle to the shared store with connection pooling. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl Database {
    /// Open (and if necessary create) the shared store.
    pub fn new(db_path: &Path) -> Result<Self, NexusError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NexusError::Database(format!("cannot create store directory: {e}")))?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .build(manager)
            .map_err(|e| NexusError::Database(format!("failed to create connection pool: {e}")))?;

        let db = Self {
            pool: Arc::new(pool),
            db_path: db_path.to_path_buf(),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<(), NexusError> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Verify store connectivity.
    pub fn health_check(&self) -> Result<(), NexusError> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Run `f` on a pooled connection without an explicit transaction. For
    /// reads; single statements are atomic on their own.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, NexusError>,
    ) -> Result<T, NexusError> {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Run `f` inside one IMMEDIATE transaction: committed when `f` returns
    /// Ok, rolled back on any Err. Every mutating request goes through here.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, NexusError>,
    ) -> Result<T, NexusError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(e)
            }
        }
    }
}

fn join_idxs(idxs: &[u32]) -> String {
    idxs.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_idxs(s: &str) -> Vec<u32> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect()
}

fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

fn split_tags(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let status_str: String = row.get("status")?;
    let env_json: String = row.get("env")?;
    let messages_json: String = row.get("notification_messages")?;
    let dir_str: Option<String> = row.get("dir")?;
    let gpu_idxs_str: Option<String> = row.get("gpu_idxs")?;
    let assigned_str: String = row.get("gpu_idxs_assigned")?;
    let integrations_str: String = row.get("integrations")?;
    let notifications_str: String = row.get("notifications")?;

    let as_conversion_err = |e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e)
    };

    Ok(Job {
        id: row.get("id")?,
        command: row.get("command")?,
        artifact_id: row.get("artifact_id")?,
        user: row.get("user")?,
        git_repo_url: row.get("git_repo_url")?,
        git_branch: row.get("git_branch")?,
        status: status_str
            .parse::<JobStatus>()
            .map_err(|e| as_conversion_err(Box::new(e)))?,
        created_at: row.get("created_at")?,
        priority: row.get("priority")?,
        num_gpus: row.get("num_gpus")?,
        gpu_idxs: gpu_idxs_str.map(|s| split_idxs(&s)),
        ignore_blacklist: row.get::<_, i64>("ignore_blacklist")? != 0,
        env: serde_json::from_str(&env_json).map_err(|e| as_conversion_err(Box::new(e)))?,
        jobrc: row.get("jobrc")?,
        integrations: split_tags(&integrations_str),
        notifications: split_tags(&notifications_str),
        notification_messages: serde_json::from_str(&messages_json)
            .map_err(|e| as_conversion_err(Box::new(e)))?,
        node: row.get("node")?,
        pid: row.get("pid")?,
        dir: dir_str.map(PathBuf::from),
        session_name: row.get("session_name")?,
        started_at: row.get("started_at")?,
        gpu_idxs_assigned: split_idxs(&assigned_str),
        wandb_url: row.get("wandb_url")?,
        marked_for_kill: row.get::<_, i64>("marked_for_kill")? != 0,
        completed_at: row.get("completed_at")?,
        exit_code: row.get("exit_code")?,
        error_message: row.get("error_message")?,
    })
}

/// Environment stored for a job row. Scrubbed once a job has finished so
/// credentials do not outlive their use (killed jobs keep theirs for the
/// tracker-update window).
fn env_for_row(job: &Job) -> Result<String, NexusError> {
    if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
        return Ok("{}".to_string());
    }
    serde_json::to_string(&job.env).map_err(|e| NexusError::Database(e.to_string()))
}

/// Insert a new job. The row always enters as queued.
pub fn add_job(conn: &Connection, job: &Job) -> Result<(), NexusError> {
    let result = conn.execute(
        "INSERT INTO jobs (
            id, command, artifact_id, git_repo_url, git_branch, status,
            created_at, priority, num_gpus, env, node, jobrc, integrations,
            notifications, notification_messages, pid, dir, started_at,
            gpu_idxs, gpu_idxs_assigned, wandb_url, marked_for_kill,
            ignore_blacklist, completed_at, exit_code, error_message, user,
            session_name
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                  ?27, ?28)",
        params![
            job.id,
            job.command,
            job.artifact_id,
            job.git_repo_url,
            job.git_branch,
            JobStatus::Queued.to_string(),
            job.created_at,
            job.priority,
            job.num_gpus,
            env_for_row(job)?,
            job.node,
            job.jobrc,
            join_tags(&job.integrations),
            join_tags(&job.notifications),
            serde_json::to_string(&job.notification_messages)
                .map_err(|e| NexusError::Database(e.to_string()))?,
            job.pid,
            job.dir.as_ref().map(|p| p.to_string_lossy().to_string()),
            job.started_at,
            job.gpu_idxs.as_ref().map(|v| join_idxs(v)),
            join_idxs(&job.gpu_idxs_assigned),
            job.wandb_url,
            job.marked_for_kill as i64,
            job.ignore_blacklist as i64,
            job.completed_at,
            job.exit_code,
            job.error_message,
            job.user,
            job.session_name,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(NexusError::InvalidState(format!(
                "job already exists: {}",
                job.id
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Overwrite a job row by id. The caller must be the owning node for any
/// transition past queued; the store only enforces the primary key.
pub fn update_job(conn: &Connection, job: &Job) -> Result<(), NexusError> {
    let changed = conn.execute(
        "UPDATE jobs SET
            command = ?2, artifact_id = ?3, git_repo_url = ?4, git_branch = ?5,
            status = ?6, created_at = ?7, priority = ?8, num_gpus = ?9,
            env = ?10, node = ?11, jobrc = ?12, integrations = ?13,
            notifications = ?14, notification_messages = ?15, pid = ?16,
            dir = ?17, started_at = ?18, gpu_idxs = ?19,
            gpu_idxs_assigned = ?20, wandb_url = ?21, marked_for_kill = ?22,
            ignore_blacklist = ?23, completed_at = ?24, exit_code = ?25,
            error_message = ?26, user = ?27, session_name = ?28
         WHERE id = ?1",
        params![
            job.id,
            job.command,
            job.artifact_id,
            job.git_repo_url,
            job.git_branch,
            job.status.to_string(),
            job.created_at,
            job.priority,
            job.num_gpus,
            env_for_row(job)?,
            job.node,
            job.jobrc,
            join_tags(&job.integrations),
            join_tags(&job.notifications),
            serde_json::to_string(&job.notification_messages)
                .map_err(|e| NexusError::Database(e.to_string()))?,
            job.pid,
            job.dir.as_ref().map(|p| p.to_string_lossy().to_string()),
            job.started_at,
            job.gpu_idxs.as_ref().map(|v| join_idxs(v)),
            join_idxs(&job.gpu_idxs_assigned),
            job.wandb_url,
            job.marked_for_kill as i64,
            job.ignore_blacklist as i64,
            job.completed_at,
            job.exit_code,
            job.error_message,
            job.user,
            job.session_name,
        ],
    )?;

    if changed == 0 {
        return Err(NexusError::NotFound(format!("job not found: {}", job.id)));
    }
    Ok(())
}

pub fn get_job(conn: &Connection, job_id: &str) -> Result<Option<Job>, NexusError> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], |row| {
            row_to_job(row)
        })
        .optional()?;
    Ok(job)
}

/// List jobs, optionally filtered by status and a command regex. The regex
/// is applied after the SQL fetch; results are identical to filtering the
/// full set in memory with the same pattern.
pub fn list_jobs(
    conn: &Connection,
    status: Option<JobStatus>,
    command_regex: Option<&str>,
) -> Result<Vec<Job>, NexusError> {
    let pattern = command_regex
        .map(regex::Regex::new)
        .transpose()
        .map_err(|e| NexusError::InvalidRequest(format!("invalid command regex: {e}")))?;

    let mut jobs = match status {
        Some(status) => {
            let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = ?1")?;
            let jobs = stmt
                .query_map(params![status.to_string()], row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            jobs
        }
        None => {
            let mut stmt = conn.prepare("SELECT * FROM jobs")?;
            let jobs = stmt
                .query_map([], row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            jobs
        }
    };

    if let Some(pattern) = pattern {
        jobs.retain(|j| pattern.is_match(&j.command));
    }

    Ok(jobs)
}

/// Atomic claim of a queued job for `node`. True iff exactly this call
/// transitioned the row; losers see zero rows changed.
pub fn claim_job(conn: &Connection, job_id: &str, node: &str) -> Result<bool, NexusError> {
    let changed = conn.execute(
        "UPDATE jobs SET node = ?1 WHERE id = ?2 AND node IS NULL AND status = 'queued'",
        params![node, job_id],
    )?;
    Ok(changed == 1)
}

/// Remove a queued job and garbage-collect its artifact when this was the
/// last queued reference. Must run inside the caller's transaction.
pub fn delete_queued_job(conn: &Connection, job_id: &str) -> Result<(), NexusError> {
    let job = get_job(conn, job_id)?
        .ok_or_else(|| NexusError::NotFound(format!("job not found: {job_id}")))?;

    if job.status != JobStatus::Queued {
        return Err(NexusError::InvalidState(format!(
            "cannot delete job {job_id} with status '{}'; only queued jobs can be deleted",
            job.status
        )));
    }

    conn.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;

    if !is_artifact_in_use(conn, &job.artifact_id)? {
        delete_artifact(conn, &job.artifact_id)?;
        tracing::info!(
            "Deleted artifact {} after removing its last queued reference {job_id}",
            job.artifact_id
        );
    }
    Ok(())
}

/// Add a GPU to this node's blacklist. True if the entry was created, false
/// if it was already present.
pub fn add_blacklisted_gpu(conn: &Connection, node: &str, gpu_idx: u32) -> Result<bool, NexusError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO blacklisted_gpus (node, gpu_idx) VALUES (?1, ?2)",
        params![node, gpu_idx],
    )?;
    Ok(changed == 1)
}

/// Remove a GPU from this node's blacklist. True if an entry was deleted.
pub fn remove_blacklisted_gpu(
    conn: &Connection,
    node: &str,
    gpu_idx: u32,
) -> Result<bool, NexusError> {
    let changed = conn.execute(
        "DELETE FROM blacklisted_gpus WHERE node = ?1 AND gpu_idx = ?2",
        params![node, gpu_idx],
    )?;
    Ok(changed == 1)
}

pub fn list_blacklisted_gpus(conn: &Connection, node: &str) -> Result<Vec<u32>, NexusError> {
    let mut stmt =
        conn.prepare("SELECT gpu_idx FROM blacklisted_gpus WHERE node = ?1 ORDER BY gpu_idx")?;
    let idxs = stmt
        .query_map(params![node], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(idxs)
}

/// Store an artifact blob under its content key. A second put of the same
/// key is accepted without touching the existing row.
pub fn add_artifact(conn: &Connection, artifact_id: &str, data: &[u8]) -> Result<(), NexusError> {
    conn.execute(
        "INSERT OR IGNORE INTO artifacts (id, size, created_at, data) VALUES (?1, ?2, ?3, ?4)",
        params![artifact_id, data.len() as i64, super::now_ts(), data],
    )?;
    Ok(())
}

pub fn get_artifact(conn: &Connection, artifact_id: &str) -> Result<Option<Vec<u8>>, NexusError> {
    let data = conn
        .query_row(
            "SELECT data FROM artifacts WHERE id = ?1",
            params![artifact_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data)
}

pub fn artifact_exists(conn: &Connection, artifact_id: &str) -> Result<bool, NexusError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM artifacts WHERE id = ?1",
            params![artifact_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// True iff any queued job still references the artifact. Running jobs have
/// already materialized the bytes into their workspace.
pub fn is_artifact_in_use(conn: &Connection, artifact_id: &str) -> Result<bool, NexusError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE artifact_id = ?1 AND status = 'queued'",
        params![artifact_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn delete_artifact(conn: &Connection, artifact_id: &str) -> Result<(), NexusError> {
    conn.execute("DELETE FROM artifacts WHERE id = ?1", params![artifact_id])?;
    Ok(())
}

/// Job counts keyed by status string, for the status endpoint.
pub fn count_jobs_by_status(conn: &Connection) -> Result<HashMap<String, i64>, NexusError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (db, temp_dir)
    }

    fn queued_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            command: "echo hi".to_string(),
            artifact_id: "art1".to_string(),
            user: "alice".to_string(),
            created_at: super::super::now_ts(),
            ..Job::default()
        }
    }

    #[test]
    fn test_database_creation() {
        let (db, _temp) = create_test_db();
        assert!(db.health_check().is_ok());
    }

    #[test]
    fn test_insert_and_get_job() {
        let (db, _temp) = create_test_db();

        let mut job = queued_job("aaaaaa");
        job.env
            .insert("WANDB_API_KEY".to_string(), "secret".to_string());
        job.notifications.push("discord".to_string());
        job.gpu_idxs = Some(vec![0, 2]);

        db.transaction(|tx| add_job(tx, &job)).unwrap();

        let retrieved = db.with_conn(|c| get_job(c, "aaaaaa")).unwrap().unwrap();
        assert_eq!(retrieved.command, "echo hi");
        assert_eq!(retrieved.status, JobStatus::Queued);
        assert_eq!(retrieved.env.get("WANDB_API_KEY").unwrap(), "secret");
        assert_eq!(retrieved.notifications, vec!["discord"]);
        assert_eq!(retrieved.gpu_idxs, Some(vec![0, 2]));
        assert!(retrieved.gpu_idxs_assigned.is_empty());
        assert!(retrieved.node.is_none());
    }

    #[test]
    fn test_insert_duplicate_id_is_invalid_state() {
        let (db, _temp) = create_test_db();
        let job = queued_job("dupdup");
        db.transaction(|tx| add_job(tx, &job)).unwrap();
        let err = db.transaction(|tx| add_job(tx, &job)).unwrap_err();
        assert!(matches!(err, NexusError::InvalidState(_)));
    }

    #[test]
    fn test_update_job_round_trip() {
        let (db, _temp) = create_test_db();
        let mut job = queued_job("bbbbbb");
        db.transaction(|tx| add_job(tx, &job)).unwrap();

        job.status = JobStatus::Running;
        job.node = Some("node-a".to_string());
        job.pid = Some(4321);
        job.started_at = Some(super::super::now_ts());
        job.gpu_idxs_assigned = vec![1];
        job.session_name = Some("nexus_job_bbbbbb".to_string());
        db.transaction(|tx| update_job(tx, &job)).unwrap();

        let retrieved = db.with_conn(|c| get_job(c, "bbbbbb")).unwrap().unwrap();
        assert_eq!(retrieved.status, JobStatus::Running);
        assert_eq!(retrieved.node.as_deref(), Some("node-a"));
        assert_eq!(retrieved.pid, Some(4321));
        assert_eq!(retrieved.gpu_idxs_assigned, vec![1]);
    }

    #[test]
    fn test_update_missing_job_is_not_found() {
        let (db, _temp) = create_test_db();
        let job = queued_job("nonono");
        let err = db.transaction(|tx| update_job(tx, &job)).unwrap_err();
        assert!(matches!(err, NexusError::NotFound(_)));
    }

    #[test]
    fn test_env_scrubbed_after_terminal_update() {
        let (db, _temp) = create_test_db();
        let mut job = queued_job("scrubs");
        job.env.insert("SECRET".to_string(), "v".to_string());
        db.transaction(|tx| add_job(tx, &job)).unwrap();

        job.status = JobStatus::Completed;
        job.completed_at = Some(super::super::now_ts());
        db.transaction(|tx| update_job(tx, &job)).unwrap();

        let retrieved = db.with_conn(|c| get_job(c, "scrubs")).unwrap().unwrap();
        assert!(retrieved.env.is_empty());
    }

    #[test]
    fn test_list_jobs_with_filters() {
        let (db, _temp) = create_test_db();
        for (id, command) in [
            ("job001", "python train.py"),
            ("job002", "python eval.py"),
            ("job003", "bash run.sh"),
        ] {
            let mut job = queued_job(id);
            job.command = command.to_string();
            db.transaction(|tx| add_job(tx, &job)).unwrap();
        }

        let all = db.with_conn(|c| list_jobs(c, None, None)).unwrap();
        assert_eq!(all.len(), 3);

        let queued = db
            .with_conn(|c| list_jobs(c, Some(JobStatus::Queued), None))
            .unwrap();
        assert_eq!(queued.len(), 3);

        let pythons = db
            .with_conn(|c| list_jobs(c, None, Some(r"^python .*\.py$")))
            .unwrap();
        assert_eq!(pythons.len(), 2);

        let err = db
            .with_conn(|c| list_jobs(c, None, Some("(unclosed")))
            .unwrap_err();
        assert!(matches!(err, NexusError::InvalidRequest(_)));
    }

    #[test]
    fn test_claim_job_exactly_once() {
        let (db, _temp) = create_test_db();
        let job = queued_job("claimy");
        db.transaction(|tx| add_job(tx, &job)).unwrap();

        let won_a = db
            .transaction(|tx| claim_job(tx, "claimy", "node-a"))
            .unwrap();
        let won_b = db
            .transaction(|tx| claim_job(tx, "claimy", "node-b"))
            .unwrap();
        assert!(won_a);
        assert!(!won_b);

        let claimed = db.with_conn(|c| get_job(c, "claimy")).unwrap().unwrap();
        assert_eq!(claimed.node.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_claim_races_with_delete() {
        let (db, _temp) = create_test_db();
        let job = queued_job("racing");
        db.transaction(|tx| add_job(tx, &job)).unwrap();
        db.transaction(|tx| delete_queued_job(tx, "racing")).unwrap();

        let won = db
            .transaction(|tx| claim_job(tx, "racing", "node-a"))
            .unwrap();
        assert!(!won);
    }

    #[test]
    fn test_delete_queued_job_guards_status() {
        let (db, _temp) = create_test_db();
        let mut job = queued_job("runnin");
        db.transaction(|tx| add_job(tx, &job)).unwrap();
        job.status = JobStatus::Running;
        db.transaction(|tx| update_job(tx, &job)).unwrap();

        let err = db
            .transaction(|tx| delete_queued_job(tx, "runnin"))
            .unwrap_err();
        assert!(matches!(err, NexusError::InvalidState(_)));
        assert!(db.with_conn(|c| get_job(c, "runnin")).unwrap().is_some());
    }

    #[test]
    fn test_delete_queued_job_collects_unreferenced_artifact() {
        let (db, _temp) = create_test_db();
        db.transaction(|tx| add_artifact(tx, "art1", b"tarball"))
            .unwrap();

        let a = queued_job("artjo1");
        let mut b = queued_job("artjo2");
        b.artifact_id = "art1".to_string();
        db.transaction(|tx| add_job(tx, &a)).unwrap();
        db.transaction(|tx| add_job(tx, &b)).unwrap();

        // Still referenced by the other queued job.
        db.transaction(|tx| delete_queued_job(tx, "artjo1")).unwrap();
        assert!(db.with_conn(|c| artifact_exists(c, "art1")).unwrap());

        db.transaction(|tx| delete_queued_job(tx, "artjo2")).unwrap();
        assert!(!db.with_conn(|c| artifact_exists(c, "art1")).unwrap());
    }

    #[test]
    fn test_blacklist_idempotency_reporting() {
        let (db, _temp) = create_test_db();

        assert!(db
            .transaction(|tx| add_blacklisted_gpu(tx, "node-a", 0))
            .unwrap());
        assert!(!db
            .transaction(|tx| add_blacklisted_gpu(tx, "node-a", 0))
            .unwrap());

        // Per-node scope: the same index on another node is a fresh entry.
        assert!(db
            .transaction(|tx| add_blacklisted_gpu(tx, "node-b", 0))
            .unwrap());

        assert_eq!(
            db.with_conn(|c| list_blacklisted_gpus(c, "node-a")).unwrap(),
            vec![0]
        );

        assert!(db
            .transaction(|tx| remove_blacklisted_gpu(tx, "node-a", 0))
            .unwrap());
        assert!(!db
            .transaction(|tx| remove_blacklisted_gpu(tx, "node-a", 0))
            .unwrap());
    }

    #[test]
    fn test_artifact_round_trip() {
        let (db, _temp) = create_test_db();
        let data = b"some tar bytes".to_vec();

        db.transaction(|tx| add_artifact(tx, "deadbeef", &data))
            .unwrap();
        // Idempotent on identical key.
        db.transaction(|tx| add_artifact(tx, "deadbeef", &data))
            .unwrap();

        let fetched = db
            .with_conn(|c| get_artifact(c, "deadbeef"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched, data);

        db.transaction(|tx| delete_artifact(tx, "deadbeef")).unwrap();
        assert!(db
            .with_conn(|c| get_artifact(c, "deadbeef"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_count_jobs_by_status() {
        let (db, _temp) = create_test_db();
        for id in ["cnt001", "cnt002"] {
            db.transaction(|tx| add_job(tx, &queued_job(id))).unwrap();
        }
        let mut done = queued_job("cnt003");
        db.transaction(|tx| add_job(tx, &done)).unwrap();
        done.status = JobStatus::Completed;
        db.transaction(|tx| update_job(tx, &done)).unwrap();

        let counts = db.with_conn(count_jobs_by_status).unwrap();
        assert_eq!(counts.get("queued"), Some(&2));
        assert_eq!(counts.get("completed"), Some(&1));
        assert_eq!(counts.get("running"), None);
    }
}
