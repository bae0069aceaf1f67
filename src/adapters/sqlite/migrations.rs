//! SQLite database migration management.
//!
//! Migrations are embedded as ordered statement lists. Each migration runs in
//! its own transaction together with the row recording its version.

use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to execute migration {version}: {source}")]
    ExecutionError {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("Failed to get schema version: {0}")]
    VersionCheckError(#[source] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub statements: Vec<&'static str>,
}

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply every migration newer than the recorded schema version.
    /// Returns how many were applied.
    pub async fn run_embedded_migrations(&self, migrations: Vec<Migration>) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;
        let current_version = self.get_current_version().await?;
        let pending: Vec<_> = migrations.into_iter().filter(|m| m.version > current_version).collect();

        for migration in &pending {
            self.apply_migration(migration).await?;
            tracing::debug!(version = migration.version, description = migration.description, "applied migration");
        }

        Ok(pending.len())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MigrationError::ExecutionError { version: 0, source: e })?;
        Ok(())
    }

    pub async fn get_current_version(&self) -> Result<i64, MigrationError> {
        let result: Option<(i64,)> = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_optional(&self.pool)
            .await
            .map_err(MigrationError::VersionCheckError)?;
        Ok(result.map_or(0, |(v,)| v))
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        let version = migration.version;
        let err = move |source: sqlx::Error| MigrationError::ExecutionError { version, source };

        let mut tx = self.pool.begin().await.map_err(err)?;
        for statement in &migration.statements {
            sqlx::query(statement).execute(&mut *tx).await.map_err(err)?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await
            .map_err(err)?;
        tx.commit().await.map_err(err)?;
        Ok(())
    }
}

pub fn pipeline_migration() -> Migration {
    Migration {
        version: 1,
        description: "Outbox and stage records",
        statements: vec![
            "CREATE TABLE IF NOT EXISTS outbox (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                event_type TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                published_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, sequence)",
            "CREATE INDEX IF NOT EXISTS idx_outbox_event ON outbox(event_id)",
            "CREATE TABLE IF NOT EXISTS stage_records (
                event_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                terminal INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                last_error TEXT,
                last_attempt_at TEXT,
                completed_at TEXT,
                event_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (event_id, stage)
            )",
            "CREATE INDEX IF NOT EXISTS idx_stage_records_status ON stage_records(status, terminal)",
        ],
    }
}

pub fn sessions_migration() -> Migration {
    Migration {
        version: 2,
        description: "Sessions, answers, skips and fatigue snapshots",
        statements: vec![
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                questions_answered INTEGER NOT NULL DEFAULT 0,
                answered_domain_counts TEXT NOT NULL DEFAULT '{}',
                answered_depth_by_domain TEXT NOT NULL DEFAULT '{}',
                last_question_energy TEXT,
                previous_question_energy TEXT,
                last_question_id TEXT,
                question_served_at TEXT,
                phase TEXT NOT NULL,
                min_safety_level INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                paused_until TEXT,
                ended_at TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, last_activity_at)",
            "CREATE TABLE IF NOT EXISTS answers (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                question_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                energy TEXT NOT NULL,
                depth_level INTEGER NOT NULL,
                answer_text TEXT NOT NULL,
                response_time_secs REAL NOT NULL,
                responded_at TEXT NOT NULL,
                UNIQUE (session_id, question_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_answers_session ON answers(session_id, responded_at)",
            "CREATE TABLE IF NOT EXISTS session_skips (
                session_id TEXT NOT NULL REFERENCES sessions(id),
                question_id TEXT NOT NULL,
                flagged INTEGER NOT NULL DEFAULT 0,
                skipped_at TEXT NOT NULL,
                PRIMARY KEY (session_id, question_id)
            )",
            "CREATE TABLE IF NOT EXISTS fatigue_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                score REAL NOT NULL,
                level TEXT NOT NULL,
                components TEXT NOT NULL,
                suggested_action TEXT NOT NULL,
                computed_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_fatigue_session ON fatigue_snapshots(session_id, id)",
        ],
    }
}

pub fn read_model_migration() -> Migration {
    Migration {
        version: 3,
        description: "Profile read model and answer embeddings",
        statements: vec![
            "CREATE TABLE IF NOT EXISTS answer_embeddings (
                event_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                vector TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                domain_coverage TEXT NOT NULL DEFAULT '{}',
                trait_estimates TEXT NOT NULL DEFAULT '{}',
                completeness REAL NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS profile_applied_events (
                user_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (user_id, event_id)
            )",
        ],
    }
}

pub fn streams_migration() -> Migration {
    Migration {
        version: 4,
        description: "Durable stream transport and control flags",
        statements: vec![
            "CREATE TABLE IF NOT EXISTS stream_entries (
                stream TEXT NOT NULL,
                id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (stream, id)
            )",
            "CREATE TABLE IF NOT EXISTS stream_groups (
                stream TEXT NOT NULL,
                group_name TEXT NOT NULL,
                last_delivered_id INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (stream, group_name)
            )",
            "CREATE TABLE IF NOT EXISTS stream_pending (
                stream TEXT NOT NULL,
                group_name TEXT NOT NULL,
                id INTEGER NOT NULL,
                consumer TEXT NOT NULL,
                delivered_at_ms INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (stream, group_name, id)
            )",
            "CREATE TABLE IF NOT EXISTS control_flags (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        ],
    }
}

pub fn stream_heads_migration() -> Migration {
    Migration {
        version: 5,
        description: "Monotonic stream heads",
        statements: vec![
            "CREATE TABLE IF NOT EXISTS stream_heads (
                stream TEXT PRIMARY KEY,
                last_id INTEGER NOT NULL
            )",
            // Seed from entries and group cursors, whichever is further along.
            "INSERT OR IGNORE INTO stream_heads (stream, last_id)
             SELECT stream, MAX(id) FROM (
                SELECT stream, id FROM stream_entries
                UNION ALL
                SELECT stream, last_delivered_id AS id FROM stream_groups
             ) GROUP BY stream",
        ],
    }
}

pub fn all_embedded_migrations() -> Vec<Migration> {
    vec![
        pipeline_migration(),
        sessions_migration(),
        read_model_migration(),
        streams_migration(),
        stream_heads_migration(),
    ]
}
