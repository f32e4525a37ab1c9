//! SQLite-backed job store.
//!
//! One `jobs` table shared by every namespace; a store handle only sees rows
//! of its own namespace.

use anyhow::Result;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::path::{Path, PathBuf};

use super::{sanitize_record, JobStore, StoreResult};
use crate::job::{ErrorCause, Job, JobId, NetworkType, Priority, Status};

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

const COLUMNS: &str = "id, namespace, url, file, group_id, priority, status, error, \
                       downloaded, total, headers_json, network_type, created_at";

/// Handle to the SQLite job database, scoped to one namespace.
///
/// The default database lives under the XDG state directory:
/// `~/.local/state/haul/jobs.db`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    namespace: String,
}

impl SqliteStore {
    /// Open (or create) the default job database and run migrations.
    pub async fn open_default(namespace: &str) -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("haul")?;
        let db_path = xdg_dirs.place_state_file("jobs.db")?;
        Self::open_at(db_path, namespace).await
    }

    /// Open (or create) the database at a specific path. Creates parent dirs if needed.
    pub async fn open_at(path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;
        let store = SqliteStore {
            pool,
            namespace: namespace.to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Same database, different namespace.
    pub fn with_namespace(&self, namespace: &str) -> Self {
        SqliteStore {
            pool: self.pool.clone(),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                namespace TEXT NOT NULL,
                id INTEGER NOT NULL,
                url TEXT NOT NULL,
                file TEXT NOT NULL,
                group_id INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error TEXT,
                downloaded INTEGER NOT NULL DEFAULT 0,
                total INTEGER,
                headers_json TEXT NOT NULL DEFAULT '[]',
                network_type TEXT NOT NULL DEFAULT 'all',
                created_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_file ON jobs (namespace, file)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_where(&self, clause: &str, binds: &[Bind<'_>]) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs WHERE namespace = ?1 {clause} ORDER BY created_at ASC, id ASC"
        );
        let mut query = sqlx::query(&sql).bind(&self.namespace);
        for b in binds {
            query = match b {
                Bind::Int(v) => query.bind(*v),
                Bind::Text(v) => query.bind(*v),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }
}

enum Bind<'a> {
    Int(i64),
    Text(&'a str),
}

fn row_to_job(row: &SqliteRow) -> StoreResult<Job> {
    let error: Option<String> = row.get("error");
    let error = match error.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(serde_json::from_str::<ErrorCause>(s)?),
        None => None,
    };
    let headers_json: String = row.get("headers_json");
    let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)?;
    let file: String = row.get("file");
    let status: String = row.get("status");
    let network_type: String = row.get("network_type");
    let downloaded: i64 = row.get("downloaded");
    let total: Option<i64> = row.get("total");
    Ok(Job {
        id: row.get("id"),
        namespace: row.get("namespace"),
        url: row.get("url"),
        file: PathBuf::from(file),
        group: row.get("group_id"),
        priority: Priority::from_i64(row.get("priority")),
        status: Status::parse(&status),
        error,
        downloaded: downloaded.max(0) as u64,
        total: total.filter(|t| *t >= 0).map(|t| t as u64),
        headers,
        network_type: NetworkType::parse(&network_type),
        created_at: row.get("created_at"),
    })
}

fn encode_error(error: Option<ErrorCause>) -> StoreResult<Option<String>> {
    Ok(match error {
        Some(e) => Some(serde_json::to_string(&e)?),
        None => None,
    })
}

async fn insert_on(conn: &mut SqliteConnection, namespace: &str, job: &Job) -> StoreResult<bool> {
    let done = sqlx::query(
        r#"
        INSERT OR IGNORE INTO jobs (
            namespace, id, url, file, group_id, priority, status, error,
            downloaded, total, headers_json, network_type, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(namespace)
    .bind(job.id)
    .bind(&job.url)
    .bind(job.file.to_string_lossy().into_owned())
    .bind(job.group)
    .bind(job.priority.as_i64())
    .bind(job.status.as_str())
    .bind(encode_error(job.error)?)
    .bind(job.downloaded as i64)
    .bind(job.total.map(|t| t as i64))
    .bind(serde_json::to_string(&job.headers)?)
    .bind(job.network_type.as_str())
    .bind(job.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected() == 1)
}

async fn update_on(conn: &mut SqliteConnection, namespace: &str, job: &Job) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET url = ?3, file = ?4, group_id = ?5, priority = ?6, status = ?7,
            error = ?8, downloaded = ?9, total = ?10, headers_json = ?11,
            network_type = ?12
        WHERE namespace = ?1 AND id = ?2
        "#,
    )
    .bind(namespace)
    .bind(job.id)
    .bind(&job.url)
    .bind(job.file.to_string_lossy().into_owned())
    .bind(job.group)
    .bind(job.priority.as_i64())
    .bind(job.status.as_str())
    .bind(encode_error(job.error)?)
    .bind(job.downloaded as i64)
    .bind(job.total.map(|t| t as i64))
    .bind(serde_json::to_string(&job.headers)?)
    .bind(job.network_type.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_on(conn: &mut SqliteConnection, namespace: &str, id: JobId) -> StoreResult<()> {
    sqlx::query("DELETE FROM jobs WHERE namespace = ?1 AND id = ?2")
        .bind(namespace)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fetch_on(conn: &mut SqliteConnection, namespace: &str, id: JobId) -> StoreResult<Option<Job>> {
    let sql = format!("SELECT {COLUMNS} FROM jobs WHERE namespace = ?1 AND id = ?2");
    let row = sqlx::query(&sql)
        .bind(namespace)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_job).transpose()
}

impl JobStore for SqliteStore {
    async fn insert(&self, job: &Job) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        insert_on(&mut conn, &self.namespace, job).await
    }

    async fn insert_batch(&self, jobs: &[Job]) -> StoreResult<Vec<(Job, bool)>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let ok = insert_on(&mut tx, &self.namespace, job).await?;
            out.push((job.clone(), ok));
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        fetch_on(&mut conn, &self.namespace, id).await
    }

    async fn get_many(&self, ids: &[JobId]) -> StoreResult<Vec<Option<Job>>> {
        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(fetch_on(&mut conn, &self.namespace, *id).await?);
        }
        Ok(out)
    }

    async fn get_all(&self) -> StoreResult<Vec<Job>> {
        self.select_where("", &[]).await
    }

    async fn get_by_file(&self, file: &Path) -> StoreResult<Option<Job>> {
        let file = file.to_string_lossy();
        let mut found = self.select_where("AND file = ?2", &[Bind::Text(&file)]).await?;
        Ok(if found.is_empty() { None } else { Some(found.remove(0)) })
    }

    async fn get_by_group(&self, group: i64) -> StoreResult<Vec<Job>> {
        self.select_where("AND group_id = ?2", &[Bind::Int(group)]).await
    }

    async fn get_by_status(&self, status: Status) -> StoreResult<Vec<Job>> {
        self.select_where("AND status = ?2", &[Bind::Text(status.as_str())])
            .await
    }

    async fn get_by_group_and_status(&self, group: i64, status: Status) -> StoreResult<Vec<Job>> {
        self.select_where(
            "AND group_id = ?2 AND status = ?3",
            &[Bind::Int(group), Bind::Text(status.as_str())],
        )
        .await
    }

    async fn update(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        update_on(&mut conn, &self.namespace, job).await
    }

    async fn update_batch(&self, jobs: &[Job]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            update_on(&mut tx, &self.namespace, job).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        delete_on(&mut conn, &self.namespace, job.id).await
    }

    async fn delete_batch(&self, jobs: &[Job]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            delete_on(&mut tx, &self.namespace, job.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM jobs WHERE namespace = ?1")
            .bind(&self.namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn modify<F>(&self, id: JobId, f: F) -> StoreResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> bool + Send,
    {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = fetch_on(&mut tx, &self.namespace, id).await? else {
            tx.commit().await?;
            return Ok(None);
        };
        if !f(&mut job) {
            tx.commit().await?;
            return Ok(None);
        }
        update_on(&mut tx, &self.namespace, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn sanitize(&self, initializing: bool) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE namespace = ?1");
        let rows = sqlx::query(&sql)
            .bind(&self.namespace)
            .fetch_all(&mut *tx)
            .await?;
        let mut touched = 0u64;
        for row in &rows {
            let mut job = row_to_job(row)?;
            if sanitize_record(&mut job, initializing) {
                update_on(&mut tx, &self.namespace, &job).await?;
                touched += 1;
            }
        }
        tx.commit().await?;
        Ok(touched)
    }
}

#[cfg(test)]
/// Open an in-memory database for tests (no disk I/O).
pub(crate) async fn open_memory(namespace: &str) -> Result<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let store = SqliteStore {
        pool,
        namespace: namespace.to_string(),
    };
    store.migrate().await?;
    Ok(store)
}
