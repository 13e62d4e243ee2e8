//! PostgreSQL-backed change catalog.
//!
//! The transactional source of truth for change events, anomalies, incidents,
//! suspects, and labels. Queries are parameterized throughout; identifiers
//! never reach the SQL text.

use crate::catalog::ChangeCatalog;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use faultline_core::config::PostgresConfig;
use faultline_core::types::{
    Anomaly, ConfigChange, Deployment, FlagChange, Incident, IncidentStatus, Suspect, SuspectType,
};
use faultline_core::{PipelineError, PipelineResult};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

/// Change catalog on a pooled PostgreSQL connection (min 2 / max 10).
#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Connect and initialize the schema.
    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .acquire_timeout(std::time::Duration::from_secs(config.read_timeout_secs))
            .connect(&config.url())
            .await?;

        let catalog = Self { pool };
        catalog.init_schema().await?;
        info!("Postgres change catalog initialized");
        Ok(catalog)
    }

    /// Create the catalog from an existing pool.
    pub async fn from_pool(pool: PgPool) -> PipelineResult<Self> {
        let catalog = Self { pool };
        catalog.init_schema().await.map_err(PipelineError::Internal)?;
        Ok(catalog)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id UUID PRIMARY KEY,
                ts TIMESTAMPTZ NOT NULL,
                service TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                version TEXT,
                author TEXT,
                diff_summary TEXT,
                links JSONB
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_deployments_service_ts ON deployments (service, ts)",
            "CREATE INDEX IF NOT EXISTS idx_deployments_ts ON deployments (ts)",
            r#"
            CREATE TABLE IF NOT EXISTS config_changes (
                id UUID PRIMARY KEY,
                ts TIMESTAMPTZ NOT NULL,
                service TEXT NOT NULL,
                key TEXT NOT NULL,
                old_value_hash TEXT,
                new_value_hash TEXT,
                diff_summary TEXT,
                source TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_config_changes_service_ts ON config_changes (service, ts)",
            "CREATE INDEX IF NOT EXISTS idx_config_changes_ts ON config_changes (ts)",
            r#"
            CREATE TABLE IF NOT EXISTS feature_flag_changes (
                id UUID PRIMARY KEY,
                ts TIMESTAMPTZ NOT NULL,
                flag_name TEXT NOT NULL,
                service TEXT,
                old_state JSONB,
                new_state JSONB
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_flag_changes_flag_ts ON feature_flag_changes (flag_name, ts)",
            "CREATE INDEX IF NOT EXISTS idx_flag_changes_ts ON feature_flag_changes (ts)",
            r#"
            CREATE TABLE IF NOT EXISTS anomalies (
                id UUID PRIMARY KEY,
                start_ts TIMESTAMPTZ NOT NULL,
                end_ts TIMESTAMPTZ NOT NULL,
                service TEXT NOT NULL,
                metric TEXT NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                detector TEXT NOT NULL,
                details JSONB
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_anomalies_service_ts ON anomalies (service, start_ts)",
            "CREATE INDEX IF NOT EXISTS idx_anomalies_ts ON anomalies (start_ts, end_ts)",
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id UUID PRIMARY KEY,
                start_ts TIMESTAMPTZ NOT NULL,
                end_ts TIMESTAMPTZ,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                summary TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_incidents_status_ts ON incidents (status, start_ts)",
            "CREATE INDEX IF NOT EXISTS idx_incidents_ts ON incidents (start_ts)",
            r#"
            CREATE TABLE IF NOT EXISTS incident_anomalies (
                incident_id UUID NOT NULL REFERENCES incidents (id) ON DELETE CASCADE,
                anomaly_id UUID NOT NULL REFERENCES anomalies (id) ON DELETE CASCADE,
                PRIMARY KEY (incident_id, anomaly_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS suspects (
                id UUID PRIMARY KEY,
                incident_id UUID NOT NULL REFERENCES incidents (id) ON DELETE CASCADE,
                suspect_type TEXT NOT NULL,
                suspect_key TEXT NOT NULL,
                rank INTEGER NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                evidence JSONB
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_suspects_incident_rank ON suspects (incident_id, rank)",
            r#"
            CREATE TABLE IF NOT EXISTS labels (
                id UUID PRIMARY KEY,
                incident_id UUID NOT NULL REFERENCES incidents (id) ON DELETE CASCADE,
                suspect_id UUID NOT NULL,
                label SMALLINT NOT NULL,
                labeler TEXT,
                notes TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_labels_incident_suspect ON labels (incident_id, suspect_id, created_at)",
        ];

        for stmt in ddl {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Classify a sqlx failure into the pipeline error taxonomy.
fn store_err(e: sqlx::Error) -> PipelineError {
    match &e {
        sqlx::Error::Database(db) => PipelineError::PermanentStore(db.to_string()),
        sqlx::Error::RowNotFound => PipelineError::PermanentStore(e.to_string()),
        _ => PipelineError::TransientStore(e.to_string()),
    }
}

fn row_to_deployment(row: &PgRow) -> Result<Deployment, sqlx::Error> {
    Ok(Deployment {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        service: row.try_get("service")?,
        commit_sha: row.try_get("commit_sha")?,
        version: row.try_get("version")?,
        author: row.try_get("author")?,
        diff_summary: row.try_get("diff_summary")?,
        links: row.try_get("links")?,
    })
}

fn row_to_config_change(row: &PgRow) -> Result<ConfigChange, sqlx::Error> {
    Ok(ConfigChange {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        service: row.try_get("service")?,
        key: row.try_get("key")?,
        old_value_hash: row.try_get("old_value_hash")?,
        new_value_hash: row.try_get("new_value_hash")?,
        diff_summary: row.try_get("diff_summary")?,
        source: row.try_get("source")?,
    })
}

fn row_to_flag_change(row: &PgRow) -> Result<FlagChange, sqlx::Error> {
    Ok(FlagChange {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        flag_name: row.try_get("flag_name")?,
        service: row.try_get("service")?,
        old_state: row.try_get("old_state")?,
        new_state: row.try_get("new_state")?,
    })
}

fn row_to_anomaly(row: &PgRow) -> Result<Anomaly, sqlx::Error> {
    let details: Option<serde_json::Value> = row.try_get("details")?;
    Ok(Anomaly {
        id: row.try_get("id")?,
        service: row.try_get("service")?,
        metric: row.try_get("metric")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        score: row.try_get("score")?,
        detector: row.try_get("detector")?,
        details: details.unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_incident(row: &PgRow) -> Result<Incident, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Incident {
        id: row.try_get("id")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        title: row.try_get("title")?,
        status: IncidentStatus::parse(&status).unwrap_or(IncidentStatus::Open),
        summary: row.try_get("summary")?,
    })
}

fn row_to_suspect(row: &PgRow) -> Result<Suspect, sqlx::Error> {
    let suspect_type: String = row.try_get("suspect_type")?;
    let evidence: Option<serde_json::Value> = row.try_get("evidence")?;
    Ok(Suspect {
        id: row.try_get("id")?,
        incident_id: row.try_get("incident_id")?,
        suspect_type: SuspectType::parse(&suspect_type).unwrap_or(SuspectType::Service),
        suspect_key: row.try_get("suspect_key")?,
        rank: row.try_get("rank")?,
        score: row.try_get("score")?,
        evidence: evidence.unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl ChangeCatalog for PostgresCatalog {
    async fn insert_deployment(&self, deployment: &Deployment) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (id, ts, service, commit_sha, version, author, diff_summary, links)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(deployment.id)
        .bind(deployment.ts)
        .bind(&deployment.service)
        .bind(&deployment.commit_sha)
        .bind(&deployment.version)
        .bind(&deployment.author)
        .bind(&deployment.diff_summary)
        .bind(&deployment.links)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn insert_config_change(&self, change: &ConfigChange) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO config_changes (id, ts, service, key, old_value_hash, new_value_hash, diff_summary, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(change.id)
        .bind(change.ts)
        .bind(&change.service)
        .bind(&change.key)
        .bind(&change.old_value_hash)
        .bind(&change.new_value_hash)
        .bind(&change.diff_summary)
        .bind(&change.source)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn insert_flag_change(&self, change: &FlagChange) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_flag_changes (id, ts, flag_name, service, old_state, new_state)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(change.id)
        .bind(change.ts)
        .bind(&change.flag_name)
        .bind(&change.service)
        .bind(&change.old_state)
        .bind(&change.new_state)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn deployments_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<Deployment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, service, commit_sha, version, author, diff_summary, links
            FROM deployments
            WHERE ts >= $1 AND ts <= $2 AND service = ANY($3)
            ORDER BY ts DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(services)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_deployment(r).map_err(store_err))
            .collect()
    }

    async fn config_changes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<ConfigChange>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, service, key, old_value_hash, new_value_hash, diff_summary, source
            FROM config_changes
            WHERE ts >= $1 AND ts <= $2 AND service = ANY($3)
            ORDER BY ts DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(services)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_config_change(r).map_err(store_err))
            .collect()
    }

    async fn flag_changes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<FlagChange>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, flag_name, service, old_state, new_state
            FROM feature_flag_changes
            WHERE ts >= $1 AND ts <= $2 AND (service = ANY($3) OR service IS NULL)
            ORDER BY ts DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(services)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_flag_change(r).map_err(store_err))
            .collect()
    }

    async fn insert_anomaly_if_new(&self, anomaly: &Anomaly) -> PipelineResult<bool> {
        let lower = anomaly.start_ts - Duration::seconds(60);
        let upper = anomaly.start_ts + Duration::seconds(60);

        let existing = sqlx::query(
            r#"
            SELECT id FROM anomalies
            WHERE service = $1 AND metric = $2 AND start_ts >= $3 AND start_ts <= $4
            LIMIT 1
            "#,
        )
        .bind(&anomaly.service)
        .bind(&anomaly.metric)
        .bind(lower)
        .bind(upper)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        if existing.is_some() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO anomalies (id, start_ts, end_ts, service, metric, score, detector, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(anomaly.id)
        .bind(anomaly.start_ts)
        .bind(anomaly.end_ts)
        .bind(&anomaly.service)
        .bind(&anomaly.metric)
        .bind(anomaly.score)
        .bind(&anomaly.detector)
        .bind(&anomaly.details)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(true)
    }

    async fn ungrouped_anomalies_since(
        &self,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<Anomaly>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.start_ts, a.end_ts, a.service, a.metric, a.score, a.detector, a.details
            FROM anomalies a
            LEFT JOIN incident_anomalies ia ON a.id = ia.anomaly_id
            WHERE ia.anomaly_id IS NULL AND a.start_ts >= $1
            ORDER BY a.start_ts
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_anomaly(r).map_err(store_err))
            .collect()
    }

    async fn anomalies_for_incident(&self, incident_id: Uuid) -> PipelineResult<Vec<Anomaly>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.start_ts, a.end_ts, a.service, a.metric, a.score, a.detector, a.details
            FROM incident_anomalies ia
            JOIN anomalies a ON ia.anomaly_id = a.id
            WHERE ia.incident_id = $1
            ORDER BY a.start_ts
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_anomaly(r).map_err(store_err))
            .collect()
    }

    async fn insert_incident_with_links(
        &self,
        incident: &Incident,
        anomaly_ids: &[Uuid],
    ) -> PipelineResult<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let existing = sqlx::query("SELECT id FROM incidents WHERE id = $1")
            .bind(incident.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
        if existing.is_some() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO incidents (id, start_ts, end_ts, title, status, summary)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(incident.id)
        .bind(incident.start_ts)
        .bind(incident.end_ts)
        .bind(&incident.title)
        .bind(incident.status.as_str())
        .bind(&incident.summary)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        for anomaly_id in anomaly_ids {
            sqlx::query(
                r#"
                INSERT INTO incident_anomalies (incident_id, anomaly_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(incident.id)
            .bind(anomaly_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn incident(&self, id: Uuid) -> PipelineResult<Option<Incident>> {
        let row = sqlx::query(
            "SELECT id, start_ts, end_ts, title, status, summary FROM incidents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| row_to_incident(&r).map_err(store_err)).transpose()
    }

    async fn incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<Incident>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT id, start_ts, end_ts, title, status, summary
                    FROM incidents WHERE status = $1
                    ORDER BY start_ts DESC LIMIT $2
                    "#,
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, start_ts, end_ts, title, status, summary
                    FROM incidents ORDER BY start_ts DESC LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_incident(r).map_err(store_err))
            .collect()
    }

    async fn affected_services(&self, incident_id: Uuid) -> PipelineResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT a.service
            FROM incident_anomalies ia
            JOIN anomalies a ON ia.anomaly_id = a.id
            WHERE ia.incident_id = $1
            ORDER BY a.service
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("service").map_err(store_err))
            .collect()
    }

    async fn count_service_incidents_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> PipelineResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT count(DISTINCT i.id) AS cnt
            FROM incidents i
            JOIN incident_anomalies ia ON i.id = ia.incident_id
            JOIN anomalies a ON ia.anomaly_id = a.id
            WHERE a.service = $1 AND i.start_ts >= $2
            "#,
        )
        .bind(service)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        row.try_get::<i64, _>("cnt").map_err(store_err)
    }

    async fn replace_suspects(
        &self,
        incident_id: Uuid,
        suspects: &[Suspect],
    ) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query("DELETE FROM suspects WHERE incident_id = $1")
            .bind(incident_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        for suspect in suspects {
            sqlx::query(
                r#"
                INSERT INTO suspects (id, incident_id, suspect_type, suspect_key, rank, score, evidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(suspect.id)
            .bind(suspect.incident_id)
            .bind(suspect.suspect_type.as_str())
            .bind(&suspect.suspect_key)
            .bind(suspect.rank)
            .bind(suspect.score)
            .bind(&suspect.evidence)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn suspects(&self, incident_id: Uuid) -> PipelineResult<Vec<Suspect>> {
        let rows = sqlx::query(
            r#"
            SELECT id, incident_id, suspect_type, suspect_key, rank, score, evidence
            FROM suspects WHERE incident_id = $1 ORDER BY rank
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| row_to_suspect(r).map_err(store_err))
            .collect()
    }

    async fn suspect(&self, id: Uuid) -> PipelineResult<Option<Suspect>> {
        let row = sqlx::query(
            r#"
            SELECT id, incident_id, suspect_type, suspect_key, rank, score, evidence
            FROM suspects WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| row_to_suspect(&r).map_err(store_err)).transpose()
    }

    async fn upsert_label(
        &self,
        incident_id: Uuid,
        suspect_id: Uuid,
        label: i16,
        labeler: Option<&str>,
        notes: Option<&str>,
    ) -> PipelineResult<()> {
        let existing = sqlx::query(
            r#"
            SELECT id FROM labels
            WHERE incident_id = $1 AND suspect_id = $2
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(incident_id)
        .bind(suspect_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match existing {
            Some(row) => {
                let id: Uuid = row.try_get("id").map_err(store_err)?;
                sqlx::query(
                    r#"
                    UPDATE labels SET label = $1, labeler = $2, notes = $3, created_at = now()
                    WHERE id = $4
                    "#,
                )
                .bind(label)
                .bind(labeler)
                .bind(notes)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO labels (id, incident_id, suspect_id, label, labeler, notes)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(incident_id)
                .bind(suspect_id)
                .bind(label)
                .bind(labeler)
                .bind(notes)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
            }
        }
        Ok(())
    }

    async fn true_cause_suspect(&self, incident_id: Uuid) -> PipelineResult<Option<Suspect>> {
        let row = sqlx::query(
            r#"
            SELECT s.id, s.incident_id, s.suspect_type, s.suspect_key, s.rank, s.score, s.evidence
            FROM suspects s
            JOIN (
                SELECT DISTINCT ON (suspect_id) suspect_id, label
                FROM labels WHERE incident_id = $1
                ORDER BY suspect_id, created_at DESC
            ) effective ON effective.suspect_id = s.id
            WHERE effective.label = 1
            LIMIT 1
            "#,
        )
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| row_to_suspect(&r).map_err(store_err)).transpose()
    }

    async fn labeled_incidents(&self) -> PipelineResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT DISTINCT incident_id FROM labels")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("incident_id").map_err(store_err))
            .collect()
    }

    async fn training_rows(&self) -> PipelineResult<Vec<(serde_json::Value, i16)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (l.incident_id, l.suspect_id) s.evidence, l.label
            FROM labels l
            JOIN suspects s ON s.id = l.suspect_id
            WHERE s.evidence IS NOT NULL AND l.label IN (0, 1)
            ORDER BY l.incident_id, l.suspect_id, l.created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| {
                let evidence: serde_json::Value = r.try_get("evidence").map_err(store_err)?;
                let label: i16 = r.try_get("label").map_err(store_err)?;
                Ok((evidence, label))
            })
            .collect()
    }

    async fn ping(&self) -> PipelineResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
