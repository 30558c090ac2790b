//! Postgres-backed staging store.
//!
//! Canonical-key uniqueness among non-rejected rows is enforced by the
//! partial unique index from `migrations/0001_staged_properties.sql`, so
//! concurrent inserts of the same property cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use super::{
    apply_patch, NewStagedProperty, Stage, StageCounts, StagedProperty, StagedPropertyPatch,
    StagingFilter, StagingStore,
};
use crate::common::{PropertyRecordId, StagedPropertyId};
use crate::error::{StagingError, StagingResult};
use crate::identity::{normalize_address, CanonicalKey, PropertyIdentity};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone, sqlx::FromRow)]
struct StagedPropertyRow {
    id: StagedPropertyId,
    address: String,
    postal_code: Option<String>,
    city: Option<String>,
    bfe: Option<String>,
    source: String,
    outdoor_score: Option<i16>,
    score_reason: Option<String>,
    traffic_estimate: Option<i32>,
    traffic_source: Option<String>,
    notes: Option<String>,
    stage: String,
    crm_property_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StagedPropertyRow> for StagedProperty {
    type Error = StagingError;

    fn try_from(row: StagedPropertyRow) -> StagingResult<Self> {
        Ok(StagedProperty {
            id: row.id,
            address: row.address,
            postal_code: row.postal_code,
            city: row.city,
            bfe: row.bfe,
            source: row.source.parse()?,
            outdoor_score: row.outdoor_score.map(|s| s.clamp(1, 10) as u8),
            score_reason: row.score_reason,
            traffic_estimate: row.traffic_estimate.map(|t| t.max(0) as u32),
            traffic_source: row.traffic_source,
            notes: row.notes,
            stage: row.stage.parse()?,
            crm_property_id: row.crm_property_id.map(PropertyRecordId::from),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn storage(e: sqlx::Error) -> StagingError {
    StagingError::Storage(Box::new(e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

pub struct PostgresStagingStore {
    pool: PgPool,
}

impl PostgresStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> StagingResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StagingError::Storage(Box::new(e)))
    }

    /// Translate a unique violation on the canonical key into `Conflict`.
    async fn conflict_or_storage(&self, e: sqlx::Error, key: CanonicalKey) -> StagingError {
        if !is_unique_violation(&e) {
            return storage(e);
        }
        let existing: Option<StagedPropertyId> = sqlx::query_scalar(
            r#"
            SELECT id FROM staged_properties
            WHERE canonical_key = $1 AND stage <> 'rejected'
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        match existing {
            Some(existing) => StagingError::Conflict { key, existing },
            // Holder was rejected or deleted in the meantime
            None => storage(e),
        }
    }
}

#[async_trait]
impl StagingStore for PostgresStagingStore {
    async fn insert(&self, candidate: NewStagedProperty) -> StagingResult<StagedProperty> {
        candidate.validate()?;
        let key = candidate.canonical_key();
        let property = candidate.into_staged(Utc::now());

        let result = sqlx::query_as::<_, StagedPropertyRow>(
            r#"
            INSERT INTO staged_properties (
                id, address, normalized_address, canonical_key, postal_code, city, bfe,
                source, outdoor_score, score_reason, traffic_estimate, traffic_source, notes,
                stage, crm_property_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(property.id)
        .bind(&property.address)
        .bind(normalize_address(&property.address))
        .bind(key.as_str())
        .bind(&property.postal_code)
        .bind(&property.city)
        .bind(&property.bfe)
        .bind(property.source.as_str())
        .bind(property.outdoor_score.map(i16::from))
        .bind(&property.score_reason)
        .bind(property.traffic_estimate.map(|t| t as i32))
        .bind(&property.traffic_source)
        .bind(&property.notes)
        .bind(property.stage.as_str())
        .bind(property.crm_property_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(property.created_at)
        .bind(property.updated_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                debug!(id = %property.id, key = %key, "Staged property inserted");
                row.try_into()
            }
            Err(e) => Err(self.conflict_or_storage(e, key).await),
        }
    }

    async fn get(&self, id: StagedPropertyId) -> StagingResult<StagedProperty> {
        sqlx::query_as::<_, StagedPropertyRow>("SELECT * FROM staged_properties WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StagingError::NotFound(id))?
            .try_into()
    }

    async fn list(&self, filter: &StagingFilter) -> StagingResult<Vec<StagedProperty>> {
        let rows = sqlx::query_as::<_, StagedPropertyRow>(
            r#"
            SELECT * FROM staged_properties
            WHERE ($1::text IS NULL OR stage = $1)
              AND ($2::text IS NULL OR source = $2)
              AND ($3::text IS NULL OR LOWER(city) = LOWER(TRIM($3)))
              AND ($4::text IS NULL
                   OR address ILIKE '%' || TRIM($4) || '%'
                   OR city ILIKE '%' || TRIM($4) || '%'
                   OR notes ILIKE '%' || TRIM($4) || '%')
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#,
        )
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.source.map(|s| s.as_str()))
        .bind(&filter.city)
        .bind(&filter.search)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(StagedProperty::try_from).collect()
    }

    async fn update(
        &self,
        id: StagedPropertyId,
        patch: StagedPropertyPatch,
    ) -> StagingResult<StagedProperty> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let current: StagedProperty = sqlx::query_as::<_, StagedPropertyRow>(
            "SELECT * FROM staged_properties WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or(StagingError::NotFound(id))?
        .try_into()?;

        let updated = apply_patch(&current, patch, Utc::now())?;
        let key = updated.canonical_key();

        let result = sqlx::query(
            r#"
            UPDATE staged_properties
            SET address = $2,
                normalized_address = $3,
                canonical_key = $4,
                postal_code = $5,
                city = $6,
                bfe = $7,
                outdoor_score = $8,
                score_reason = $9,
                traffic_estimate = $10,
                traffic_source = $11,
                notes = $12,
                stage = $13,
                crm_property_id = $14,
                updated_at = $15
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&updated.address)
        .bind(normalize_address(&updated.address))
        .bind(key.as_str())
        .bind(&updated.postal_code)
        .bind(&updated.city)
        .bind(&updated.bfe)
        .bind(updated.outdoor_score.map(i16::from))
        .bind(&updated.score_reason)
        .bind(updated.traffic_estimate.map(|t| t as i32))
        .bind(&updated.traffic_source)
        .bind(&updated.notes)
        .bind(updated.stage.as_str())
        .bind(updated.crm_property_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(updated.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            drop(tx);
            return Err(self.conflict_or_storage(e, key).await);
        }
        tx.commit().await.map_err(storage)?;

        debug!(id = %id, stage = %updated.stage, "Staged property updated");
        Ok(updated)
    }

    async fn delete(&self, id: StagedPropertyId) -> StagingResult<bool> {
        let result = sqlx::query("DELETE FROM staged_properties WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> StagingResult<StageCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT stage, COUNT(*) FROM staged_properties GROUP BY stage")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;

        let mut counts = StageCounts::default();
        for (stage, count) in rows {
            let stage: Stage = stage.parse()?;
            counts.set(stage, count.max(0) as usize);
        }
        Ok(counts)
    }

    async fn exists_by_address(&self, address: &str) -> StagingResult<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM staged_properties
                WHERE normalized_address = $1 AND stage <> 'rejected'
            )
            "#,
        )
        .bind(normalize_address(address))
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }
}
