//! Postgres-backed `RecordStore`, grounded in the `tansanrao-nexus`
//! example's `sqlx` usage (pool + runtime `query_as` rather than
//! compile-time-checked `query!`, since this crate doesn't build against
//! a live database). Atomicity across Item/Embedding/Log writes within
//! one Pipeline run is achieved with a single `sqlx::Transaction`,
//! acquired by the Pipeline around steps 1-7 of `ingest` and committed
//! only once every write succeeds (§4.2, §5).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{
    ActivityMetric, ChangeFrequency, ClassificationProfile, Item, ItemMetadata, ItemStatus,
    Project, ProjectStatus, ProcessingLog, Source, SyncCursor, User, Watch,
};

use super::{RecordStore, UpsertOutcome};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::invariant(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn source_to_str(s: Source) -> &'static str {
    s.as_str()
}

fn source_from_str(s: &str) -> Result<Source, CoreError> {
    match s {
        "mail" => Ok(Source::Mail),
        "drive" => Ok(Source::Drive),
        "calendar" => Ok(Source::Calendar),
        other => Err(CoreError::invariant(format!("unknown source {other}"))),
    }
}

fn status_to_str(s: ItemStatus) -> &'static str {
    match s {
        ItemStatus::Pending => "pending",
        ItemStatus::Classified => "classified",
        ItemStatus::Unclassified => "unclassified",
        ItemStatus::Embedded => "embedded",
        ItemStatus::Deleted => "deleted",
        ItemStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> Result<ItemStatus, CoreError> {
    Ok(match s {
        "pending" => ItemStatus::Pending,
        "classified" => ItemStatus::Classified,
        "unclassified" => ItemStatus::Unclassified,
        "embedded" => ItemStatus::Embedded,
        "deleted" => ItemStatus::Deleted,
        "failed" => ItemStatus::Failed,
        other => return Err(CoreError::invariant(format!("unknown item status {other}"))),
    })
}

fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<Item, CoreError> {
    let metadata_json: serde_json::Value = row.try_get("metadata")?;
    Ok(Item {
        id: row.try_get("id")?,
        source: source_from_str(row.try_get("source")?)?,
        source_id: row.try_get("source_id")?,
        owner_id: row.try_get("owner_id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        received_at: row.try_get("received_at")?,
        body: row.try_get("body")?,
        metadata: serde_json::from_value(metadata_json)
            .map_err(|e| CoreError::invariant(e.to_string()))?,
        status: status_from_str(row.try_get("status")?)?,
        revision: row.try_get("revision")?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_item_stub(
        &self,
        owner_id: Uuid,
        source: Source,
        source_id: &str,
    ) -> Result<(Item, UpsertOutcome), CoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = sqlx::query(
            "SELECT id, source, source_id, owner_id, project_id, title, author, \
             received_at, body, metadata, status, revision \
             FROM items WHERE source = $1 AND source_id = $2 FOR UPDATE",
        )
        .bind(source_to_str(source))
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await?
        {
            let item = row_to_item(&row)?;
            tx.commit().await?;
            return Ok((item, UpsertOutcome::Existing));
        }

        let new_id = Uuid::new_v4();
        let placeholder_metadata = serde_json::to_value(placeholder_metadata(source))
            .map_err(|e| CoreError::invariant(e.to_string()))?;
        sqlx::query(
            "INSERT INTO items (id, source, source_id, owner_id, project_id, title, author, \
             received_at, body, metadata, status, revision) \
             VALUES ($1, $2, $3, $4, NULL, '', '', now(), '', $5, 'pending', '')",
        )
        .bind(new_id)
        .bind(source_to_str(source))
        .bind(source_id)
        .bind(owner_id)
        .bind(placeholder_metadata)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_item(new_id)
            .await?
            .map(|item| (item, UpsertOutcome::Created))
            .ok_or_else(|| CoreError::invariant("item vanished after insert"))
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>, CoreError> {
        let row = sqlx::query(
            "SELECT id, source, source_id, owner_id, project_id, title, author, \
             received_at, body, metadata, status, revision FROM items WHERE id = $1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_item(&r)).transpose()
    }

    async fn get_item_by_source_id(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<Option<Item>, CoreError> {
        let row = sqlx::query(
            "SELECT id, source, source_id, owner_id, project_id, title, author, \
             received_at, body, metadata, status, revision \
             FROM items WHERE source = $1 AND source_id = $2",
        )
        .bind(source_to_str(source))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_item(&r)).transpose()
    }

    async fn save_item(&self, item: &Item) -> Result<(), CoreError> {
        let metadata = serde_json::to_value(&item.metadata)
            .map_err(|e| CoreError::invariant(e.to_string()))?;
        sqlx::query(
            "UPDATE items SET project_id = $2, title = $3, author = $4, received_at = $5, \
             body = $6, metadata = $7, status = $8, revision = $9 WHERE id = $1",
        )
        .bind(item.id)
        .bind(item.project_id)
        .bind(&item.title)
        .bind(&item.author)
        .bind(item.received_at)
        .bind(&item.body)
        .bind(metadata)
        .bind(status_to_str(item.status))
        .bind(&item.revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete_item(&self, item_id: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE items SET status = 'deleted' WHERE id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, CoreError> {
        let row = sqlx::query(
            "SELECT id, username, primary_mail_address, active, source_credentials_connected \
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn get_user_by_virtual_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, CoreError> {
        let row = sqlx::query(
            "SELECT id, username, primary_mail_address, active, source_credentials_connected \
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn list_active_projects_for_user(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<Project>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, status, profile FROM projects \
             WHERE owner_id = $1 AND status = 'active'",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_project).collect()
    }

    async fn get_cursor(&self, owner_id: Uuid, source: Source) -> Result<SyncCursor, CoreError> {
        let row = sqlx::query(
            "SELECT owner_id, source, history_token, last_successful_poll \
             FROM sync_cursors WHERE owner_id = $1 AND source = $2",
        )
        .bind(owner_id)
        .bind(source_to_str(source))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(SyncCursor {
                owner_id: r.try_get("owner_id")?,
                source,
                history_token: r.try_get("history_token")?,
                last_successful_poll: r.try_get("last_successful_poll")?,
            }),
            None => Ok(SyncCursor {
                owner_id,
                source,
                history_token: None,
                last_successful_poll: None,
            }),
        }
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO sync_cursors (owner_id, source, history_token, last_successful_poll) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (owner_id, source) DO UPDATE \
             SET history_token = EXCLUDED.history_token, \
                 last_successful_poll = EXCLUDED.last_successful_poll",
        )
        .bind(cursor.owner_id)
        .bind(source_to_str(cursor.source))
        .bind(&cursor.history_token)
        .bind(cursor.last_successful_poll)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_activity_metric(
        &self,
        owner_id: Uuid,
        source: Source,
    ) -> Result<ActivityMetric, CoreError> {
        let row = sqlx::query(
            "SELECT items_seen_total, items_changed_last_24h, change_frequency, \
             next_interval_minutes, virtual_mail_activity_24h, last_activity_at \
             FROM activity_metrics WHERE owner_id = $1 AND source = $2",
        )
        .bind(owner_id)
        .bind(source_to_str(source))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(ActivityMetric {
                owner_id,
                source,
                items_seen_total: r.try_get::<i64, _>("items_seen_total")? as u64,
                items_changed_last_24h: r.try_get::<i64, _>("items_changed_last_24h")? as u64,
                change_frequency: change_frequency_from_str(r.try_get("change_frequency")?)?,
                next_interval_minutes: r.try_get::<i32, _>("next_interval_minutes")? as u32,
                virtual_mail_activity_24h: r.try_get("virtual_mail_activity_24h")?,
                last_activity_at: r.try_get("last_activity_at")?,
            }),
            None => Ok(ActivityMetric::new(owner_id, source)),
        }
    }

    async fn save_activity_metric(&self, metric: &ActivityMetric) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO activity_metrics (owner_id, source, items_seen_total, \
             items_changed_last_24h, change_frequency, next_interval_minutes, \
             virtual_mail_activity_24h, last_activity_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (owner_id, source) DO UPDATE SET \
             items_seen_total = EXCLUDED.items_seen_total, \
             items_changed_last_24h = EXCLUDED.items_changed_last_24h, \
             change_frequency = EXCLUDED.change_frequency, \
             next_interval_minutes = EXCLUDED.next_interval_minutes, \
             virtual_mail_activity_24h = EXCLUDED.virtual_mail_activity_24h, \
             last_activity_at = EXCLUDED.last_activity_at",
        )
        .bind(metric.owner_id)
        .bind(source_to_str(metric.source))
        .bind(metric.items_seen_total as i64)
        .bind(metric.items_changed_last_24h as i64)
        .bind(change_frequency_to_str(metric.change_frequency))
        .bind(metric.next_interval_minutes as i32)
        .bind(metric.virtual_mail_activity_24h)
        .bind(metric.last_activity_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_log(&self, log: &ProcessingLog) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO processing_logs (id, item_id, owner_id, outcome, error_kind, \
             detail, started_at, duration_ms) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(log.id)
        .bind(log.item_id)
        .bind(log.owner_id)
        .bind(format!("{:?}", log.outcome).to_lowercase())
        .bind(log.error_kind.map(|k| format!("{:?}", k).to_lowercase()))
        .bind(&log.detail)
        .bind(log.started_at)
        .bind(log.duration_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active_watches(&self) -> Result<Vec<Watch>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, source, resource_id, channel_handle, expiry, active, \
             renewal_failures FROM watches WHERE active = true",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_watch).collect()
    }

    async fn list_watches_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Watch>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, source, resource_id, channel_handle, expiry, active, \
             renewal_failures FROM watches WHERE active = true AND expiry <= $1",
        )
        .bind(deadline)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_watch).collect()
    }

    async fn save_watch(&self, watch: &Watch) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO watches (id, owner_id, source, resource_id, channel_handle, \
             expiry, active, renewal_failures) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
             channel_handle = EXCLUDED.channel_handle, expiry = EXCLUDED.expiry, \
             active = EXCLUDED.active, renewal_failures = EXCLUDED.renewal_failures",
        )
        .bind(watch.id)
        .bind(watch.owner_id)
        .bind(source_to_str(watch.source))
        .bind(&watch.resource_id)
        .bind(&watch.channel_handle)
        .bind(watch.expiry)
        .bind(watch.active)
        .bind(watch.renewal_failures as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all_users(&self) -> Result<Vec<User>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, username, primary_mail_address, active, source_credentials_connected \
             FROM users",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn list_items_for_user(
        &self,
        owner_id: Uuid,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Item>, CoreError> {
        let rows = match project_id {
            Some(pid) => {
                sqlx::query(
                    "SELECT id, source, source_id, owner_id, project_id, title, author, \
                     received_at, body, metadata, status, revision FROM items \
                     WHERE owner_id = $1 AND project_id = $2 AND status = 'embedded'",
                )
                .bind(owner_id)
                .bind(pid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, source, source_id, owner_id, project_id, title, author, \
                     received_at, body, metadata, status, revision FROM items \
                     WHERE owner_id = $1 AND status = 'embedded'",
                )
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_item).collect()
    }
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<User, CoreError> {
    let creds_json: serde_json::Value = row.try_get("source_credentials_connected")?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        primary_mail_address: row.try_get("primary_mail_address")?,
        active: row.try_get("active")?,
        source_credentials_connected: serde_json::from_value(creds_json).unwrap_or_default(),
    })
}

fn row_to_project(row: &sqlx::postgres::PgRow) -> Result<Project, CoreError> {
    let profile_json: serde_json::Value = row.try_get("profile")?;
    let status: &str = row.try_get("status")?;
    Ok(Project {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        status: match status {
            "active" => ProjectStatus::Active,
            "in_progress" => ProjectStatus::InProgress,
            "archived" => ProjectStatus::Archived,
            other => return Err(CoreError::invariant(format!("unknown project status {other}"))),
        },
        profile: serde_json::from_value::<ClassificationProfile>(profile_json)
            .map_err(|e| CoreError::invariant(e.to_string()))?,
    })
}

fn row_to_watch(row: &sqlx::postgres::PgRow) -> Result<Watch, CoreError> {
    Ok(Watch {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        source: source_from_str(row.try_get("source")?)?,
        resource_id: row.try_get("resource_id")?,
        channel_handle: row.try_get("channel_handle")?,
        expiry: row.try_get("expiry")?,
        active: row.try_get("active")?,
        renewal_failures: row.try_get::<i32, _>("renewal_failures")? as u32,
    })
}

fn change_frequency_to_str(f: ChangeFrequency) -> &'static str {
    match f {
        ChangeFrequency::Low => "low",
        ChangeFrequency::Medium => "medium",
        ChangeFrequency::High => "high",
    }
}

fn change_frequency_from_str(s: &str) -> Result<ChangeFrequency, CoreError> {
    Ok(match s {
        "low" => ChangeFrequency::Low,
        "medium" => ChangeFrequency::Medium,
        "high" => ChangeFrequency::High,
        other => return Err(CoreError::invariant(format!("unknown change_frequency {other}"))),
    })
}

fn placeholder_metadata(source: Source) -> ItemMetadata {
    match source {
        Source::Mail => ItemMetadata::Mail {
            headers: Default::default(),
            attachments: Vec::new(),
        },
        Source::Drive => ItemMetadata::Drive {
            mime_type: String::new(),
            size_bytes: 0,
            revision: String::new(),
        },
        Source::Calendar => ItemMetadata::Calendar {
            attendees: Vec::new(),
            start: Utc::now(),
            end: Utc::now(),
        },
    }
}
