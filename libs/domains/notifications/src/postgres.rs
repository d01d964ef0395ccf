//! PostgreSQL adapters for every repository trait of the crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement, TransactionTrait,
};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::events::{Event, EventRepository, EventStatus};
use crate::models::{NewNotification, Notification, NotificationMetadata, StatusChange};
use crate::recipients::{ChildRecordRepository, GuardianRow};
use crate::repository::NotificationRepository;
use crate::suppression::{
    EmailSuppression, SuppressionReason, SuppressionRepository, normalize_email,
};
use crate::vocabulary::DisabilityTag;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS children (
    id UUID PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    disability TEXT NOT NULL,
    guardian_first_name TEXT NOT NULL DEFAULT '',
    guardian_last_name TEXT NOT NULL DEFAULT '',
    guardian_email TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS children_guardian_email_idx ON children (lower(btrim(guardian_email)));

CREATE TABLE IF NOT EXISTS events (
    id UUID PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    starts_at TIMESTAMPTZ,
    target_disabilities TEXT[] NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'draft',
    error TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS notifications (
    id UUID PRIMARY KEY,
    event_id UUID REFERENCES events (id) ON DELETE SET NULL,
    sender_id UUID,
    recipient_id TEXT,
    subject TEXT NOT NULL,
    message TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    is_batch BOOLEAN NOT NULL DEFAULT FALSE,
    sent_at TIMESTAMPTZ,
    delivered_at TIMESTAMPTZ,
    opened_at TIMESTAMPTZ,
    error TEXT,
    gateway_message_id TEXT,
    unsubscribe_token TEXT NOT NULL UNIQUE,
    unsubscribed_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS notifications_event_id_idx ON notifications (event_id);
CREATE INDEX IF NOT EXISTS notifications_gateway_message_id_idx ON notifications (gateway_message_id);

CREATE TABLE IF NOT EXISTS email_suppressions (
    email TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Create the tables this crate reads and writes, if missing.
pub async fn ensure_schema(db: &DatabaseConnection) -> NotificationResult<()> {
    db.execute_unprepared(SCHEMA).await?;
    info!("Notification schema ready");
    Ok(())
}

fn stmt(sql: &str, values: impl IntoIterator<Item = sea_orm::Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Postgres, sql, values)
}

fn parse_column<T: std::str::FromStr>(column: &str, raw: &str) -> NotificationResult<T> {
    raw.parse().map_err(|_| {
        NotificationError::Database(format!("unexpected {} value '{}'", column, raw))
    })
}

fn parse_disability(raw: &str) -> NotificationResult<DisabilityTag> {
    DisabilityTag::parse(raw).map_err(|_| {
        NotificationError::Database(format!("child record has unknown disability '{}'", raw))
    })
}

#[derive(Debug, FromQueryResult)]
struct IdRow {
    #[allow(dead_code)]
    id: Uuid,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, FromQueryResult)]
struct NotificationRow {
    id: Uuid,
    event_id: Option<Uuid>,
    sender_id: Option<Uuid>,
    recipient_id: Option<String>,
    subject: String,
    message: String,
    kind: String,
    status: String,
    is_batch: bool,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    error: Option<String>,
    gateway_message_id: Option<String>,
    unsubscribe_token: String,
    unsubscribed_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = NotificationError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            event_id: row.event_id,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            subject: row.subject,
            message: row.message,
            kind: parse_column("kind", &row.kind)?,
            status: parse_column("status", &row.status)?,
            is_batch: row.is_batch,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            opened_at: row.opened_at,
            error: row.error,
            gateway_message_id: row.gateway_message_id,
            unsubscribe_token: row.unsubscribe_token,
            unsubscribed_at: row.unsubscribed_at,
            metadata: serde_json::from_value(row.metadata)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_notifications(rows: Vec<NotificationRow>) -> NotificationResult<Vec<Notification>> {
    rows.into_iter().map(Notification::try_from).collect()
}

#[derive(Clone)]
pub struct PgNotificationRepository {
    db: DatabaseConnection,
}

impl PgNotificationRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find_one(&self, sql: &str, value: sea_orm::Value) -> NotificationResult<Option<Notification>> {
        NotificationRow::find_by_statement(stmt(sql, [value]))
            .one(&self.db)
            .await?
            .map(Notification::try_from)
            .transpose()
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn create_many(&self, batch: Vec<NewNotification>) -> NotificationResult<Vec<Notification>> {
        let now = Utc::now();
        let txn = self.db.begin().await?;
        let mut created = Vec::with_capacity(batch.len());

        for new in batch {
            let n = new.into_notification(now);
            txn.execute_raw(stmt(
                r#"
                INSERT INTO notifications (
                    id, event_id, sender_id, recipient_id, subject, message, kind, status,
                    is_batch, unsubscribe_token, metadata, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
                "#,
                [
                    n.id.into(),
                    n.event_id.into(),
                    n.sender_id.into(),
                    n.recipient_id.clone().into(),
                    n.subject.clone().into(),
                    n.message.clone().into(),
                    n.kind.to_string().into(),
                    n.status.to_string().into(),
                    n.is_batch.into(),
                    n.unsubscribe_token.clone().into(),
                    serde_json::to_value(&n.metadata)?.into(),
                    now.into(),
                ],
            ))
            .await?;
            created.push(n);
        }

        txn.commit().await?;
        debug!(count = created.len(), "Inserted notifications");
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> NotificationResult<Option<Notification>> {
        self.find_one("SELECT * FROM notifications WHERE id = $1", id.into())
            .await
    }

    async fn find_by_unsubscribe_token(&self, token: &str) -> NotificationResult<Option<Notification>> {
        self.find_one(
            "SELECT * FROM notifications WHERE unsubscribe_token = $1",
            token.into(),
        )
        .await
    }

    async fn find_by_gateway_message_id(
        &self,
        gateway_message_id: &str,
    ) -> NotificationResult<Option<Notification>> {
        self.find_one(
            "SELECT * FROM notifications WHERE gateway_message_id = $1 ORDER BY id LIMIT 1",
            gateway_message_id.into(),
        )
        .await
    }

    async fn transition(&self, id: Uuid, change: StatusChange) -> NotificationResult<Notification> {
        let txn = self.db.begin().await?;

        let mut notification: Notification = NotificationRow::find_by_statement(stmt(
            "SELECT * FROM notifications WHERE id = $1 FOR UPDATE",
            [id.into()],
        ))
        .one(&txn)
        .await?
        .ok_or_else(|| NotificationError::not_found("Notification", id))?
        .try_into()?;

        // Rejected transitions roll back when `txn` drops.
        notification.apply(&change)?;

        txn.execute_raw(stmt(
            r#"
            UPDATE notifications
            SET status = $2, sent_at = $3, delivered_at = $4, opened_at = $5, error = $6,
                gateway_message_id = $7, metadata = $8, updated_at = $9
            WHERE id = $1
            "#,
            [
                id.into(),
                notification.status.to_string().into(),
                notification.sent_at.into(),
                notification.delivered_at.into(),
                notification.opened_at.into(),
                notification.error.clone().into(),
                notification.gateway_message_id.clone().into(),
                serde_json::to_value(&notification.metadata)?.into(),
                notification.updated_at.into(),
            ],
        ))
        .await?;

        txn.commit().await?;
        Ok(notification)
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        metadata: NotificationMetadata,
    ) -> NotificationResult<Notification> {
        NotificationRow::find_by_statement(stmt(
            "UPDATE notifications SET metadata = $2, updated_at = $3 WHERE id = $1 RETURNING *",
            [id.into(), serde_json::to_value(&metadata)?.into(), Utc::now().into()],
        ))
        .one(&self.db)
        .await?
        .ok_or_else(|| NotificationError::not_found("Notification", id))?
        .try_into()
    }

    async fn mark_unsubscribed(&self, id: Uuid, at: DateTime<Utc>) -> NotificationResult<bool> {
        let updated = IdRow::find_by_statement(stmt(
            r#"
            UPDATE notifications SET unsubscribed_at = $2, updated_at = $2
            WHERE id = $1 AND unsubscribed_at IS NULL
            RETURNING id
            "#,
            [id.into(), at.into()],
        ))
        .one(&self.db)
        .await?;

        if updated.is_some() {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(NotificationError::not_found("Notification", id)),
        }
    }

    async fn list_by_event(&self, event_id: Uuid) -> NotificationResult<Vec<Notification>> {
        let rows = NotificationRow::find_by_statement(stmt(
            "SELECT * FROM notifications WHERE event_id = $1 ORDER BY id",
            [event_id.into()],
        ))
        .all(&self.db)
        .await?;
        into_notifications(rows)
    }

    async fn list_failed_by_event(&self, event_id: Uuid) -> NotificationResult<Vec<Notification>> {
        let rows = NotificationRow::find_by_statement(stmt(
            "SELECT * FROM notifications WHERE event_id = $1 AND status = 'failed' ORDER BY id",
            [event_id.into()],
        ))
        .all(&self.db)
        .await?;
        into_notifications(rows)
    }

    async fn delete(&self, id: Uuid) -> NotificationResult<bool> {
        let result = self
            .db
            .execute_raw(stmt("DELETE FROM notifications WHERE id = $1", [id.into()]))
            .await?;

        if result.rows_affected() > 0 {
            info!(notification_id = %id, "Deleted notification");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Child records
// ---------------------------------------------------------------------------

#[derive(Debug, FromQueryResult)]
struct GuardianRowRecord {
    email: String,
    guardian_first_name: String,
    guardian_last_name: String,
    disability: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromQueryResult)]
struct DisabilityRecord {
    disability: String,
}

#[derive(Clone)]
pub struct PgChildRecordRepository {
    db: DatabaseConnection,
}

impl PgChildRecordRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChildRecordRepository for PgChildRecordRepository {
    async fn find_guardian_rows(
        &self,
        tags: &BTreeSet<DisabilityTag>,
    ) -> NotificationResult<Vec<GuardianRow>> {
        let tags: Vec<String> = tags.iter().map(ToString::to_string).collect();

        let rows = GuardianRowRecord::find_by_statement(stmt(
            r#"
            SELECT guardian_email AS email, guardian_first_name, guardian_last_name,
                   disability, updated_at
            FROM children
            WHERE guardian_email IS NOT NULL
              AND btrim(guardian_email) <> ''
              AND (cardinality($1::text[]) = 0 OR lower(btrim(disability)) = ANY($1::text[]))
            ORDER BY updated_at, id
            "#,
            [tags.into()],
        ))
        .all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(GuardianRow {
                    disability: parse_disability(&row.disability)?,
                    email: row.email,
                    guardian_first_name: row.guardian_first_name,
                    guardian_last_name: row.guardian_last_name,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn disabilities_for_guardian(
        &self,
        email: &str,
    ) -> NotificationResult<BTreeSet<DisabilityTag>> {
        let rows = DisabilityRecord::find_by_statement(stmt(
            "SELECT disability FROM children WHERE lower(btrim(guardian_email)) = $1",
            [normalize_email(email).into()],
        ))
        .all(&self.db)
        .await?;

        rows.iter().map(|row| parse_disability(&row.disability)).collect()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, FromQueryResult)]
struct EventRow {
    id: Uuid,
    title: String,
    description: String,
    starts_at: Option<DateTime<Utc>>,
    target_disabilities: Vec<String>,
    status: String,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = NotificationError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            id: row.id,
            title: row.title,
            description: row.description,
            starts_at: row.starts_at,
            target_disabilities: row
                .target_disabilities
                .iter()
                .map(|raw| parse_disability(raw))
                .collect::<NotificationResult<_>>()?,
            status: parse_column("status", &row.status)?,
            error: row.error,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgEventRepository {
    db: DatabaseConnection,
}

impl PgEventRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn get(&self, id: Uuid) -> NotificationResult<Option<Event>> {
        EventRow::find_by_statement(stmt("SELECT * FROM events WHERE id = $1", [id.into()]))
            .one(&self.db)
            .await?
            .map(Event::try_from)
            .transpose()
    }

    async fn upsert(&self, event: Event) -> NotificationResult<Event> {
        let tags: Vec<String> = event
            .target_disabilities
            .iter()
            .map(ToString::to_string)
            .collect();

        EventRow::find_by_statement(stmt(
            r#"
            INSERT INTO events (id, title, description, starts_at, target_disabilities, status, error, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                starts_at = EXCLUDED.starts_at,
                target_disabilities = EXCLUDED.target_disabilities,
                status = EXCLUDED.status,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
            [
                event.id.into(),
                event.title.into(),
                event.description.into(),
                event.starts_at.into(),
                tags.into(),
                event.status.to_string().into(),
                event.error.into(),
                event.updated_at.into(),
            ],
        ))
        .one(&self.db)
        .await?
        .ok_or_else(|| NotificationError::Database("event upsert returned no row".into()))?
        .try_into()
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<String>,
    ) -> NotificationResult<Event> {
        let event: Event = EventRow::find_by_statement(stmt(
            "UPDATE events SET status = $2, error = $3, updated_at = $4 WHERE id = $1 RETURNING *",
            [
                id.into(),
                status.to_string().into(),
                error.into(),
                Utc::now().into(),
            ],
        ))
        .one(&self.db)
        .await?
        .ok_or_else(|| NotificationError::not_found("Event", id))?
        .try_into()?;

        info!(event_id = %id, status = %event.status, "Event status updated");
        Ok(event)
    }

    async fn set_status_unless(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<String>,
        unless: EventStatus,
    ) -> NotificationResult<Option<Event>> {
        let updated = EventRow::find_by_statement(stmt(
            r#"
            UPDATE events SET status = $2, error = $3, updated_at = $4
            WHERE id = $1 AND status <> $5
            RETURNING *
            "#,
            [
                id.into(),
                status.to_string().into(),
                error.into(),
                Utc::now().into(),
                unless.to_string().into(),
            ],
        ))
        .one(&self.db)
        .await?;

        match updated {
            Some(row) => {
                let event = Event::try_from(row)?;
                info!(event_id = %id, status = %event.status, "Event status updated");
                Ok(Some(event))
            }
            None if self.get(id).await?.is_some() => Ok(None),
            None => Err(NotificationError::not_found("Event", id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Suppressions
// ---------------------------------------------------------------------------

#[derive(Debug, FromQueryResult)]
struct SuppressionRow {
    email: String,
    reason: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromQueryResult)]
struct EmailRow {
    email: String,
}

#[derive(Clone)]
pub struct PgSuppressionRepository {
    db: DatabaseConnection,
}

impl PgSuppressionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SuppressionRepository for PgSuppressionRepository {
    async fn suppress(&self, email: &str, reason: SuppressionReason) -> NotificationResult<()> {
        self.db
            .execute_raw(stmt(
                r#"
                INSERT INTO email_suppressions (email, reason, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (email) DO NOTHING
                "#,
                [
                    normalize_email(email).into(),
                    reason.to_string().into(),
                    Utc::now().into(),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn is_suppressed(&self, email: &str) -> NotificationResult<bool> {
        let row = EmailRow::find_by_statement(stmt(
            "SELECT email FROM email_suppressions WHERE email = $1",
            [normalize_email(email).into()],
        ))
        .one(&self.db)
        .await?;
        Ok(row.is_some())
    }

    async fn suppressed_among(&self, emails: &[String]) -> NotificationResult<HashSet<String>> {
        if emails.is_empty() {
            return Ok(HashSet::new());
        }
        let wanted: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();

        let rows = EmailRow::find_by_statement(stmt(
            "SELECT email FROM email_suppressions WHERE email = ANY($1::text[])",
            [wanted.into()],
        ))
        .all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|row| row.email).collect())
    }

    async fn list(&self) -> NotificationResult<Vec<EmailSuppression>> {
        let rows = SuppressionRow::find_by_statement(stmt(
            "SELECT email, reason, created_at FROM email_suppressions ORDER BY created_at",
            [],
        ))
        .all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(EmailSuppression {
                    reason: parse_column("reason", &row.reason)?,
                    email: row.email,
                    created_at: row.created_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationKind, NotificationStatus};
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};
    use std::collections::BTreeMap;

    fn notification_row(status: &str) -> BTreeMap<&'static str, sea_orm::Value> {
        let now = Utc::now();
        BTreeMap::from([
            ("id", Uuid::new_v4().into()),
            ("event_id", Option::<Uuid>::None.into()),
            ("sender_id", Option::<Uuid>::None.into()),
            ("recipient_id", Some("parent@example.com".to_string()).into()),
            ("subject", "Hello".into()),
            ("message", "Body".into()),
            ("kind", "email".into()),
            ("status", status.into()),
            ("is_batch", false.into()),
            ("sent_at", Option::<DateTime<Utc>>::None.into()),
            ("delivered_at", Option::<DateTime<Utc>>::None.into()),
            ("opened_at", Option::<DateTime<Utc>>::None.into()),
            ("error", Option::<String>::None.into()),
            ("gateway_message_id", Option::<String>::None.into()),
            ("unsubscribe_token", "tok".into()),
            ("unsubscribed_at", Option::<DateTime<Utc>>::None.into()),
            ("metadata", serde_json::json!({ "retryCount": 2 }).into()),
            ("created_at", now.into()),
            ("updated_at", now.into()),
        ])
    }

    #[tokio::test]
    async fn test_get_maps_row_to_notification() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![notification_row("sent")]])
            .into_connection();
        let repo = PgNotificationRepository::new(db);

        let notification = repo.get(Uuid::new_v4()).await.unwrap().unwrap();
        assert_eq!(notification.status, NotificationStatus::Sent);
        assert_eq!(notification.kind, NotificationKind::Email);
        assert_eq!(notification.metadata.retry_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_status_is_a_database_error() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![notification_row("lost")]])
            .into_connection();
        let repo = PgNotificationRepository::new(db);

        let err = repo.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, NotificationError::Database(_)));
    }

    #[tokio::test]
    async fn test_transition_rejects_invalid_change_without_update() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![notification_row("pending")]])
            .into_connection();
        let repo = PgNotificationRepository::new(db);

        let err = repo
            .transition(Uuid::new_v4(), StatusChange::to(NotificationStatus::Opened))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::InvalidTransition { .. }));
    }

    fn event_row(status: &str) -> BTreeMap<&'static str, sea_orm::Value> {
        BTreeMap::from([
            ("id", Uuid::new_v4().into()),
            ("title", "Open day".into()),
            ("description", "".into()),
            ("starts_at", Option::<DateTime<Utc>>::None.into()),
            ("target_disabilities", vec!["autism".to_string()].into()),
            ("status", status.into()),
            ("error", Option::<String>::None.into()),
            ("updated_at", Utc::now().into()),
        ])
    }

    #[tokio::test]
    async fn test_set_status_unless_skips_guarded_event() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<BTreeMap<&'static str, sea_orm::Value>>::new()])
            .append_query_results([vec![event_row("sent")]])
            .into_connection();
        let repo = PgEventRepository::new(db);

        let updated = repo
            .set_status_unless(Uuid::new_v4(), EventStatus::Cancelled, None, EventStatus::Sent)
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_set_status_unless_missing_event_is_not_found() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<BTreeMap<&'static str, sea_orm::Value>>::new()])
            .append_query_results([Vec::<BTreeMap<&'static str, sea_orm::Value>>::new()])
            .into_connection();
        let repo = PgEventRepository::new(db);

        let result = repo
            .set_status_unless(Uuid::new_v4(), EventStatus::Cancelled, None, EventStatus::Sent)
            .await;
        assert!(matches!(result, Err(NotificationError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_guardian_rows_are_ordered_by_update_time() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<BTreeMap<&'static str, sea_orm::Value>>::new()])
            .into_connection();
        let repo = PgChildRecordRepository::new(db.clone());

        repo.find_guardian_rows(&BTreeSet::new()).await.unwrap();

        let log = format!("{:?}", db.into_transaction_log());
        assert!(log.contains("ORDER BY updated_at, id"));
    }

    #[tokio::test]
    async fn test_delete_reports_missing_row() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        let repo = PgNotificationRepository::new(db);

        assert!(!repo.delete(Uuid::new_v4()).await.unwrap());
    }
}
