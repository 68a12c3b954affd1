//! SQLite ledger implementation
//!
//! Timestamps are stored as RFC 3339 text. Module payloads are stored as
//! zstd-compressed JSON so large analysis results stay cheap to keep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ArtifactRecord, DeletionCounts, Ledger, LedgerStats, ModuleCompletion, ModuleRun,
    ModuleRunStatus, NewModuleRun, NewPipelineRun, PipelineRun, PipelineRunStatus, StorageError,
    TranscriptFile, TranscriptFilter, CACHE_REASON_HIT,
};
use crate::registry::{ArtifactDescriptor, ArtifactRole};

const PAYLOAD_COMPRESSION_LEVEL: i32 = 3;

const PIPELINE_RUN_COLUMNS: &str = "id, transcript_file_id, run_id, pipeline_version, \
     pipeline_config_hash, pipeline_input_hash, status, created_at, updated_at";

const MODULE_RUN_COLUMNS: &str = "id, pipeline_run_id, transcript_file_id, module_name, \
     module_version, module_config_hash, module_input_hash, output_hash, status, duration_ms, \
     is_cacheable, cache_reason, replaces_module_run_id, superseded_at, error_message, \
     created_at, updated_at";

const ARTIFACT_COLUMNS: &str = "id, module_run_id, artifact_key, artifact_type, artifact_role, \
     relative_path, artifact_root, content_hash, created_at";

/// SQLite-backed [`Ledger`]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (or create) a ledger database file
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened ledger database");
        Self::with_pool(pool).await
    }

    /// Private in-memory ledger. A single connection keeps the database alive
    /// for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let ledger = Self { pool };
        ledger.initialize_schema().await?;
        Ok(ledger)
    }

    /// Initialize the database schema from the embedded SQL file
    pub async fn initialize_schema(&self) -> Result<(), StorageError> {
        let schema_sql = include_str!("schema.sql");

        let mut tx = self.pool.begin().await?;
        for statement in schema_sql.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn compress_payload(payload: &Value) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_vec(payload)?;
    Ok(zstd::encode_all(&json[..], PAYLOAD_COMPRESSION_LEVEL)?)
}

fn decompress_payload(bytes: &[u8]) -> Result<Value, StorageError> {
    let json = zstd::decode_all(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

fn transcript_file_from_row(row: &SqliteRow) -> Result<TranscriptFile, StorageError> {
    let created_at: String = row.try_get("created_at")?;
    Ok(TranscriptFile {
        id: row.try_get("id")?,
        transcript_key: row.try_get("transcript_key")?,
        file_name: row.try_get("file_name")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn pipeline_run_from_row(row: &SqliteRow) -> Result<PipelineRun, StorageError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(PipelineRun {
        id: row.try_get("id")?,
        transcript_file_id: row.try_get("transcript_file_id")?,
        run_id: row.try_get("run_id")?,
        pipeline_version: row.try_get("pipeline_version")?,
        pipeline_config_hash: row.try_get("pipeline_config_hash")?,
        pipeline_input_hash: row.try_get("pipeline_input_hash")?,
        status: PipelineRunStatus::from_str(&status).map_err(StorageError::InvalidStatus)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn module_run_from_row(row: &SqliteRow) -> Result<ModuleRun, StorageError> {
    let status: String = row.try_get("status")?;
    let superseded_at: Option<String> = row.try_get("superseded_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(ModuleRun {
        id: row.try_get("id")?,
        pipeline_run_id: row.try_get("pipeline_run_id")?,
        transcript_file_id: row.try_get("transcript_file_id")?,
        module_name: row.try_get("module_name")?,
        module_version: row.try_get("module_version")?,
        module_config_hash: row.try_get("module_config_hash")?,
        module_input_hash: row.try_get("module_input_hash")?,
        output_hash: row.try_get("output_hash")?,
        status: ModuleRunStatus::from_str(&status).map_err(StorageError::InvalidStatus)?,
        duration_ms: row.try_get("duration_ms")?,
        is_cacheable: row.try_get("is_cacheable")?,
        cache_reason: row.try_get("cache_reason")?,
        replaces_module_run_id: row.try_get("replaces_module_run_id")?,
        superseded_at: superseded_at.as_deref().map(parse_ts).transpose()?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<ArtifactRecord, StorageError> {
    let role: String = row.try_get("artifact_role")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ArtifactRecord {
        id: row.try_get("id")?,
        module_run_id: row.try_get("module_run_id")?,
        artifact_key: row.try_get("artifact_key")?,
        artifact_type: row.try_get("artifact_type")?,
        artifact_role: ArtifactRole::from_str(&role)
            .ok_or_else(|| StorageError::InvalidStatus(format!("artifact role {}", role)))?,
        relative_path: row.try_get("relative_path")?,
        artifact_root: row.try_get("artifact_root")?,
        content_hash: row.try_get("content_hash")?,
        created_at: parse_ts(&created_at)?,
    })
}

async fn insert_artifact(
    tx: &mut Transaction<'_, Sqlite>,
    module_run_id: i64,
    artifact: &ArtifactDescriptor,
    created_at: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO artifact_index (module_run_id, artifact_key, artifact_type, artifact_role,
                                    relative_path, artifact_root, content_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(module_run_id)
    .bind(&artifact.key)
    .bind(&artifact.artifact_type)
    .bind(artifact.role.as_str())
    .bind(&artifact.relative_path)
    .bind(artifact.root.as_ref().map(|p| p.to_string_lossy().to_string()))
    .bind(&artifact.content_hash)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn ensure_transcript_file(
        &self,
        transcript_key: &str,
        file_name: Option<&str>,
    ) -> Result<TranscriptFile, StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO transcript_files (transcript_key, file_name, created_at) VALUES (?, ?, ?)",
        )
        .bind(transcript_key)
        .bind(file_name)
        .bind(now())
        .execute(&self.pool)
        .await?;

        if file_name.is_some() {
            sqlx::query(
                "UPDATE transcript_files SET file_name = COALESCE(file_name, ?) WHERE transcript_key = ?",
            )
            .bind(file_name)
            .bind(transcript_key)
            .execute(&self.pool)
            .await?;
        }

        let row = sqlx::query(
            "SELECT id, transcript_key, file_name, created_at FROM transcript_files WHERE transcript_key = ?",
        )
        .bind(transcript_key)
        .fetch_one(&self.pool)
        .await?;
        transcript_file_from_row(&row)
    }

    async fn list_transcript_files(
        &self,
        filter: &TranscriptFilter,
    ) -> Result<Vec<TranscriptFile>, StorageError> {
        let mut sql = String::from(
            "SELECT id, transcript_key, file_name, created_at FROM transcript_files WHERE 1 = 1",
        );
        if !filter.transcript_file_ids.is_empty() {
            sql.push_str(&format!(
                " AND id IN ({})",
                placeholders(filter.transcript_file_ids.len())
            ));
        }
        if filter.file_name_contains.is_some() {
            sql.push_str(" AND file_name LIKE ?");
        }
        sql.push_str(" ORDER BY id");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        for id in &filter.transcript_file_ids {
            query = query.bind(*id);
        }
        if let Some(needle) = &filter.file_name_contains {
            query = query.bind(format!("%{}%", needle));
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(transcript_file_from_row).collect()
    }

    async fn create_pipeline_run(&self, run: NewPipelineRun) -> Result<PipelineRun, StorageError> {
        let now = now();
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_runs (transcript_file_id, run_id, pipeline_version, pipeline_config_hash,
                                       pipeline_input_hash, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.transcript_file_id)
        .bind(&run.run_id)
        .bind(&run.pipeline_version)
        .bind(&run.pipeline_config_hash)
        .bind(&run.pipeline_input_hash)
        .bind(PipelineRunStatus::Running.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(pipeline_run_id = id, run_id = %run.run_id, "Created pipeline run");
        self.get_pipeline_run(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("pipeline_run {}", id)))
    }

    async fn update_pipeline_run_status(
        &self,
        id: i64,
        status: PipelineRunStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE pipeline_runs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("pipeline_run {}", id)));
        }
        Ok(())
    }

    async fn get_pipeline_run(&self, id: i64) -> Result<Option<PipelineRun>, StorageError> {
        let sql = format!("SELECT {} FROM pipeline_runs WHERE id = ?", PIPELINE_RUN_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(pipeline_run_from_row).transpose()
    }

    async fn pipeline_runs_for_transcript(
        &self,
        transcript_file_id: i64,
    ) -> Result<Vec<PipelineRun>, StorageError> {
        let sql = format!(
            "SELECT {} FROM pipeline_runs WHERE transcript_file_id = ? ORDER BY created_at, id",
            PIPELINE_RUN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(transcript_file_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(pipeline_run_from_row).collect()
    }

    async fn create_module_run(&self, run: NewModuleRun) -> Result<ModuleRun, StorageError> {
        let now = now();
        let result = sqlx::query(
            r#"
            INSERT INTO module_runs (pipeline_run_id, transcript_file_id, module_name, module_version,
                                     module_config_hash, module_input_hash, status, is_cacheable,
                                     cache_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.pipeline_run_id)
        .bind(run.transcript_file_id)
        .bind(&run.module_name)
        .bind(&run.module_version)
        .bind(&run.module_config_hash)
        .bind(&run.module_input_hash)
        .bind(ModuleRunStatus::Running.as_str())
        .bind(run.is_cacheable)
        .bind(&run.cache_reason)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_module_run(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("module_run {}", id)))
    }

    async fn complete_module_run(
        &self,
        id: i64,
        completion: ModuleCompletion,
    ) -> Result<ModuleRun, StorageError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {} FROM module_runs WHERE id = ?", MODULE_RUN_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("module_run {}", id)))?;
        let existing = module_run_from_row(&row)?;

        let now = now();
        let completed = completion.status == ModuleRunStatus::Completed;
        let is_cacheable = existing.is_cacheable && completed;
        let payload = completion.payload.as_ref().map(compress_payload).transpose()?;

        sqlx::query(
            r#"
            UPDATE module_runs
            SET status = ?, output_hash = ?, duration_ms = ?, error_message = ?, payload = ?,
                is_cacheable = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(completion.status.as_str())
        .bind(&completion.output_hash)
        .bind(completion.duration_ms)
        .bind(&completion.error_message)
        .bind(payload)
        .bind(is_cacheable)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        for artifact in &completion.artifacts {
            insert_artifact(&mut tx, id, artifact, &now).await?;
        }

        if is_cacheable {
            let prior: Vec<i64> = sqlx::query(
                r#"
                SELECT id FROM module_runs
                WHERE module_name = ? AND module_input_hash = ? AND status = 'completed'
                  AND is_cacheable = 1 AND superseded_at IS NULL AND id != ?
                ORDER BY id
                "#,
            )
            .bind(&existing.module_name)
            .bind(&existing.module_input_hash)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.try_get("id"))
            .collect::<Result<_, _>>()?;

            if let Some(&replaced) = prior.last() {
                let sql = format!(
                    "UPDATE module_runs SET superseded_at = ?, updated_at = ? WHERE id IN ({})",
                    placeholders(prior.len())
                );
                let mut query = sqlx::query(&sql).bind(&now).bind(&now);
                for prior_id in &prior {
                    query = query.bind(*prior_id);
                }
                query.execute(&mut *tx).await?;

                sqlx::query(
                    "UPDATE module_runs SET replaces_module_run_id = ? WHERE id = ? AND replaces_module_run_id IS NULL",
                )
                .bind(replaced)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                debug!(
                    module = %existing.module_name,
                    module_run_id = id,
                    replaced,
                    "Superseded prior module run"
                );
            }
        }

        tx.commit().await?;

        self.get_module_run(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("module_run {}", id)))
    }

    async fn record_cache_hit(
        &self,
        pipeline_run_id: i64,
        source: &ModuleRun,
    ) -> Result<ModuleRun, StorageError> {
        let mut tx = self.pool.begin().await?;
        let now = now();

        let superseded = sqlx::query(
            r#"
            UPDATE module_runs SET superseded_at = ?, updated_at = ?
            WHERE id = ? AND status = 'completed' AND is_cacheable = 1 AND superseded_at IS NULL
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(source.id)
        .execute(&mut *tx)
        .await?;
        if superseded.rows_affected() != 1 {
            return Err(StorageError::Invariant(format!(
                "module run {} is no longer current",
                source.id
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO module_runs (pipeline_run_id, transcript_file_id, module_name, module_version,
                                     module_config_hash, module_input_hash, output_hash, status,
                                     duration_ms, is_cacheable, cache_reason, replaces_module_run_id,
                                     payload, created_at, updated_at)
            SELECT ?, transcript_file_id, module_name, module_version, module_config_hash,
                   module_input_hash, output_hash, 'completed', 0, 1, ?, id, payload, ?, ?
            FROM module_runs WHERE id = ?
            "#,
        )
        .bind(pipeline_run_id)
        .bind(CACHE_REASON_HIT)
        .bind(&now)
        .bind(&now)
        .bind(source.id)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO artifact_index (module_run_id, artifact_key, artifact_type, artifact_role,
                                        relative_path, artifact_root, content_hash, created_at)
            SELECT ?, artifact_key, artifact_type, artifact_role, relative_path, artifact_root,
                   content_hash, ?
            FROM artifact_index WHERE module_run_id = ?
            "#,
        )
        .bind(id)
        .bind(&now)
        .bind(source.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            module = %source.module_name,
            module_run_id = id,
            source_module_run_id = source.id,
            "Recorded cache hit"
        );
        self.get_module_run(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("module_run {}", id)))
    }

    async fn find_current_module_run(
        &self,
        module_name: &str,
        module_input_hash: &str,
    ) -> Result<Option<ModuleRun>, StorageError> {
        let sql = format!(
            r#"
            SELECT {} FROM module_runs
            WHERE module_name = ? AND module_input_hash = ? AND status = 'completed'
              AND is_cacheable = 1 AND superseded_at IS NULL
            ORDER BY id
            "#,
            MODULE_RUN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(module_name)
            .bind(module_input_hash)
            .fetch_all(&self.pool)
            .await?;

        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(module_run_from_row(&rows[0])?)),
            n => Err(StorageError::Invariant(format!(
                "{} current module runs for {} with input hash {}",
                n, module_name, module_input_hash
            ))),
        }
    }

    async fn get_module_run(&self, id: i64) -> Result<Option<ModuleRun>, StorageError> {
        let sql = format!("SELECT {} FROM module_runs WHERE id = ?", MODULE_RUN_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(module_run_from_row).transpose()
    }

    async fn module_runs_for_pipeline(
        &self,
        pipeline_run_id: i64,
    ) -> Result<Vec<ModuleRun>, StorageError> {
        let sql = format!(
            "SELECT {} FROM module_runs WHERE pipeline_run_id = ? ORDER BY id",
            MODULE_RUN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(pipeline_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(module_run_from_row).collect()
    }

    async fn module_run_payload(&self, id: i64) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query("SELECT payload FROM module_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("module_run {}", id)))?;
        let payload: Option<Vec<u8>> = row.try_get("payload")?;
        payload.as_deref().map(decompress_payload).transpose()
    }

    async fn artifacts_for_module_run(
        &self,
        module_run_id: i64,
    ) -> Result<Vec<ArtifactRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM artifact_index WHERE module_run_id = ? ORDER BY artifact_key",
            ARTIFACT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(module_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn artifacts_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Vec<ArtifactRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM artifact_index WHERE content_hash = ? ORDER BY id",
            ARTIFACT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(content_hash)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn artifacts_at_location(
        &self,
        artifact_root: &str,
        relative_path: &str,
    ) -> Result<Vec<ArtifactRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM artifact_index WHERE artifact_root = ? AND relative_path = ? ORDER BY id",
            ARTIFACT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(artifact_root)
            .bind(relative_path)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn artifact_locations(&self) -> Result<Vec<(String, String)>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT artifact_root, relative_path FROM artifact_index \
             WHERE artifact_root IS NOT NULL ORDER BY artifact_root, relative_path",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<(String, String), StorageError> {
                Ok((r.try_get("artifact_root")?, r.try_get("relative_path")?))
            })
            .collect()
    }

    async fn delete_pipeline_runs(&self, ids: &[i64]) -> Result<DeletionCounts, StorageError> {
        let mut counts = DeletionCounts::default();
        if ids.is_empty() {
            return Ok(counts);
        }

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT id FROM module_runs WHERE pipeline_run_id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let module_run_ids: Vec<i64> = query
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.try_get("id"))
            .collect::<Result<_, _>>()?;

        if !module_run_ids.is_empty() {
            let marks = placeholders(module_run_ids.len());

            let sql = format!("DELETE FROM artifact_index WHERE module_run_id IN ({})", marks);
            let mut query = sqlx::query(&sql);
            for id in &module_run_ids {
                query = query.bind(*id);
            }
            counts.artifacts = query.execute(&mut *tx).await?.rows_affected();

            // Retained rows may point back at rows about to be deleted
            let sql = format!(
                "UPDATE module_runs SET replaces_module_run_id = NULL WHERE replaces_module_run_id IN ({})",
                marks
            );
            let mut query = sqlx::query(&sql);
            for id in &module_run_ids {
                query = query.bind(*id);
            }
            query.execute(&mut *tx).await?;

            let sql = format!("DELETE FROM module_runs WHERE id IN ({})", marks);
            let mut query = sqlx::query(&sql);
            for id in &module_run_ids {
                query = query.bind(*id);
            }
            counts.module_runs = query.execute(&mut *tx).await?.rows_affected();
        }

        let sql = format!(
            "DELETE FROM pipeline_runs WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        counts.pipeline_runs = query.execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;

        info!(
            pipeline_runs = counts.pipeline_runs,
            module_runs = counts.module_runs,
            artifacts = counts.artifacts,
            "Deleted pipeline runs"
        );
        Ok(counts)
    }

    async fn stats(&self) -> Result<LedgerStats, StorageError> {
        async fn count(pool: &SqlitePool, sql: &str) -> Result<i64, StorageError> {
            let row = sqlx::query(sql).fetch_one(pool).await?;
            Ok(row.try_get("n")?)
        }

        Ok(LedgerStats {
            transcript_files: count(&self.pool, "SELECT COUNT(*) AS n FROM transcript_files").await?,
            pipeline_runs: count(&self.pool, "SELECT COUNT(*) AS n FROM pipeline_runs").await?,
            module_runs: count(&self.pool, "SELECT COUNT(*) AS n FROM module_runs").await?,
            current_module_runs: count(
                &self.pool,
                "SELECT COUNT(*) AS n FROM module_runs WHERE status = 'completed' AND is_cacheable = 1 AND superseded_at IS NULL",
            )
            .await?,
            artifacts: count(&self.pool, "SELECT COUNT(*) AS n FROM artifact_index").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn ledger() -> SqliteLedger {
        SqliteLedger::in_memory().await.unwrap()
    }

    async fn pipeline_run(ledger: &SqliteLedger, transcript_file_id: i64) -> PipelineRun {
        ledger
            .create_pipeline_run(NewPipelineRun {
                transcript_file_id,
                run_id: "20240101_000000_deadbeef".to_string(),
                pipeline_version: "1".to_string(),
                pipeline_config_hash: "cfg".to_string(),
                pipeline_input_hash: "in".to_string(),
            })
            .await
            .unwrap()
    }

    fn new_module_run(pipeline_run: &PipelineRun, cacheable: bool) -> NewModuleRun {
        NewModuleRun {
            pipeline_run_id: pipeline_run.id,
            transcript_file_id: pipeline_run.transcript_file_id,
            module_name: "stats".to_string(),
            module_version: "1".to_string(),
            module_config_hash: "mc".to_string(),
            module_input_hash: "input-1".to_string(),
            is_cacheable: cacheable,
            cache_reason: None,
        }
    }

    fn completed(artifacts: Vec<ArtifactDescriptor>) -> ModuleCompletion {
        ModuleCompletion {
            status: ModuleRunStatus::Completed,
            output_hash: Some("out-1".to_string()),
            duration_ms: 12,
            error_message: None,
            payload: Some(json!({"words": 42})),
            artifacts,
        }
    }

    #[tokio::test]
    async fn test_transcript_file_is_reused() {
        let ledger = ledger().await;
        let first = ledger.ensure_transcript_file("key", None).await.unwrap();
        let second = ledger
            .ensure_transcript_file("key", Some("meeting.json"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.file_name.as_deref(), Some("meeting.json"));
    }

    #[tokio::test]
    async fn test_complete_supersedes_prior_current_row() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let run = pipeline_run(&ledger, tf.id).await;

        let first = ledger.create_module_run(new_module_run(&run, true)).await.unwrap();
        let first = ledger.complete_module_run(first.id, completed(vec![])).await.unwrap();
        assert!(first.is_current());

        let second = ledger.create_module_run(new_module_run(&run, true)).await.unwrap();
        let second = ledger.complete_module_run(second.id, completed(vec![])).await.unwrap();
        assert_eq!(second.replaces_module_run_id, Some(first.id));

        let first = ledger.get_module_run(first.id).await.unwrap().unwrap();
        assert!(first.superseded_at.is_some());
        assert!(!first.is_current());

        let current = ledger
            .find_current_module_run("stats", "input-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, second.id);
    }

    #[tokio::test]
    async fn test_failed_run_is_never_current() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let run = pipeline_run(&ledger, tf.id).await;
        let mr = ledger.create_module_run(new_module_run(&run, true)).await.unwrap();
        let mr = ledger
            .complete_module_run(
                mr.id,
                ModuleCompletion {
                    status: ModuleRunStatus::Failed,
                    output_hash: None,
                    duration_ms: 3,
                    error_message: Some("boom".to_string()),
                    payload: None,
                    artifacts: vec![],
                },
            )
            .await
            .unwrap();
        assert!(!mr.is_cacheable);
        assert!(ledger
            .find_current_module_run("stats", "input-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let run = pipeline_run(&ledger, tf.id).await;
        let mr = ledger.create_module_run(new_module_run(&run, true)).await.unwrap();
        ledger.complete_module_run(mr.id, completed(vec![])).await.unwrap();
        assert_eq!(
            ledger.module_run_payload(mr.id).await.unwrap(),
            Some(json!({"words": 42}))
        );
    }

    #[tokio::test]
    async fn test_duplicate_artifact_key_rejected() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let run = pipeline_run(&ledger, tf.id).await;
        let mr = ledger.create_module_run(new_module_run(&run, true)).await.unwrap();
        let artifact = ArtifactDescriptor::primary("summary", "stats/summary.json");
        let result = ledger
            .complete_module_run(mr.id, completed(vec![artifact.clone(), artifact]))
            .await;
        assert!(result.is_err());
        // The transaction rolled back
        let mr = ledger.get_module_run(mr.id).await.unwrap().unwrap();
        assert_eq!(mr.status, ModuleRunStatus::Running);
    }

    #[tokio::test]
    async fn test_cache_hit_copies_artifacts_and_supersedes_source() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let run1 = pipeline_run(&ledger, tf.id).await;
        let source = ledger.create_module_run(new_module_run(&run1, true)).await.unwrap();
        let artifact = ArtifactDescriptor::primary("summary", "stats/summary.json")
            .with_root("/outputs")
            .with_content_hash("abc");
        let source = ledger
            .complete_module_run(source.id, completed(vec![artifact]))
            .await
            .unwrap();

        let run2 = pipeline_run(&ledger, tf.id).await;
        let hit = ledger.record_cache_hit(run2.id, &source).await.unwrap();
        assert_eq!(hit.pipeline_run_id, run2.id);
        assert_eq!(hit.output_hash, source.output_hash);
        assert_eq!(hit.cache_reason.as_deref(), Some(CACHE_REASON_HIT));
        assert_eq!(hit.replaces_module_run_id, Some(source.id));
        assert!(hit.is_current());

        let copied = ledger.artifacts_for_module_run(hit.id).await.unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].artifact_root.as_deref(), Some("/outputs"));
        assert_eq!(
            ledger.artifacts_at_location("/outputs", "stats/summary.json").await.unwrap().len(),
            2
        );
        assert_eq!(ledger.artifacts_by_content_hash("abc").await.unwrap().len(), 2);
        assert_eq!(
            ledger.module_run_payload(hit.id).await.unwrap(),
            Some(json!({"words": 42}))
        );

        // The source is no longer current, so a second hit on it must fail
        assert!(ledger.record_cache_hit(run2.id, &source).await.is_err());
    }

    #[tokio::test]
    async fn test_two_current_rows_is_invariant_violation() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let run = pipeline_run(&ledger, tf.id).await;
        let mr = ledger.create_module_run(new_module_run(&run, true)).await.unwrap();
        ledger.complete_module_run(mr.id, completed(vec![])).await.unwrap();

        // Bypass the ledger API to insert a second current row
        sqlx::query(
            "INSERT INTO module_runs (pipeline_run_id, transcript_file_id, module_name, module_version, \
             module_config_hash, module_input_hash, status, is_cacheable, created_at, updated_at) \
             SELECT pipeline_run_id, transcript_file_id, module_name, module_version, module_config_hash, \
             module_input_hash, 'completed', 1, created_at, updated_at FROM module_runs WHERE id = ?",
        )
        .bind(mr.id)
        .execute(ledger.pool())
        .await
        .unwrap();

        let err = ledger
            .find_current_module_run("stats", "input-1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_delete_pipeline_runs_is_explicit() {
        let ledger = ledger().await;
        let tf = ledger.ensure_transcript_file("key", None).await.unwrap();
        let old = pipeline_run(&ledger, tf.id).await;
        let source = ledger.create_module_run(new_module_run(&old, true)).await.unwrap();
        let source = ledger
            .complete_module_run(
                source.id,
                completed(vec![ArtifactDescriptor::primary("summary", "s.json")]),
            )
            .await
            .unwrap();
        let new = pipeline_run(&ledger, tf.id).await;
        let hit = ledger.record_cache_hit(new.id, &source).await.unwrap();

        let counts = ledger.delete_pipeline_runs(&[old.id]).await.unwrap();
        assert_eq!(
            counts,
            DeletionCounts {
                pipeline_runs: 1,
                module_runs: 1,
                artifacts: 1
            }
        );

        let hit = ledger.get_module_run(hit.id).await.unwrap().unwrap();
        assert_eq!(hit.replaces_module_run_id, None);
        assert_eq!(ledger.artifacts_for_module_run(hit.id).await.unwrap().len(), 1);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.pipeline_runs, 1);
        assert_eq!(stats.module_runs, 1);
        assert_eq!(stats.current_module_runs, 1);
    }

    #[tokio::test]
    async fn test_list_transcript_files_filters() {
        let ledger = ledger().await;
        let a = ledger
            .ensure_transcript_file("a", Some("team_meeting.json"))
            .await
            .unwrap();
        ledger
            .ensure_transcript_file("b", Some("interview.json"))
            .await
            .unwrap();
        ledger.ensure_transcript_file("c", None).await.unwrap();

        let all = ledger
            .list_transcript_files(&TranscriptFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let by_name = ledger
            .list_transcript_files(&TranscriptFilter {
                file_name_contains: Some("meeting".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_name.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id]);

        let limited = ledger
            .list_transcript_files(&TranscriptFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
