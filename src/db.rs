use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::docstore::ParentStore;
use crate::models::{IndexManifest, Metadata, ParentDocument};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.server.data_dir).await?;
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parents (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS manifests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_hash TEXT NOT NULL,
                backend TEXT NOT NULL,
                parent_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_parents(&self) -> Result<()> {
        sqlx::query("DELETE FROM parents")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_parents(&self, parents: &[ParentDocument]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for parent in parents {
            upsert_parent_tx(&mut tx, parent).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_parents_by_ids(&self, ids: &[String]) -> Result<Vec<Option<ParentDocument>>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, content, metadata FROM parents WHERE id IN (");
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut found: HashMap<String, ParentDocument> = HashMap::with_capacity(rows.len());
        for row in rows {
            let parent = row_to_parent(row)?;
            found.insert(parent.id.clone(), parent);
        }

        Ok(ids.iter().map(|id| found.get(id).cloned()).collect())
    }

    pub async fn count_parents(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM parents")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn record_manifest(&self, manifest: &IndexManifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manifests (source_hash, backend, parent_count, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&manifest.source_hash)
        .bind(&manifest.backend)
        .bind(manifest.parent_count)
        .bind(manifest.chunk_count)
        .bind(manifest.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_manifest(&self) -> Result<Option<IndexManifest>> {
        let row = sqlx::query(
            r#"
            SELECT source_hash, backend, parent_count, chunk_count, created_at
            FROM manifests
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let manifest = row.map(|r| IndexManifest {
            source_hash: r.get::<String, _>("source_hash"),
            backend: r.get::<String, _>("backend"),
            parent_count: r.get::<i64, _>("parent_count"),
            chunk_count: r.get::<i64, _>("chunk_count"),
            created_at: chrono::DateTime::parse_from_rfc3339(&r.get::<String, _>("created_at"))
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        });

        Ok(manifest)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ParentStore for Database {
    async fn mget(&self, ids: &[String]) -> Result<Vec<Option<ParentDocument>>> {
        self.get_parents_by_ids(ids).await
    }

    async fn mset(&self, documents: &[ParentDocument]) -> Result<()> {
        self.insert_parents(documents).await
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.count_parents().await?.max(0) as usize)
    }

    async fn clear(&self) -> Result<()> {
        self.clear_parents().await
    }
}

async fn upsert_parent_tx(tx: &mut Transaction<'_, Sqlite>, parent: &ParentDocument) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO parents (id, content, metadata)
        VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            metadata = excluded.metadata
        "#,
    )
    .bind(&parent.id)
    .bind(&parent.text)
    .bind(serde_json::to_string(&parent.metadata)?)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_parent(row: SqliteRow) -> Result<ParentDocument> {
    let metadata: Metadata = serde_json::from_str(&row.get::<String, _>("metadata"))?;
    Ok(ParentDocument {
        id: row.get("id"),
        text: row.get("content"),
        metadata,
    })
}
