//! Recipient resolution from child records.
//!
//! Child records carry one disability tag each and the guardian's contact
//! details. Matching groups them by normalised guardian email so that each
//! guardian appears once, with every matched tag aggregated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::NotificationResult;
use crate::models::RecipientContact;
use crate::suppression::{SuppressionRepository, normalize_email};
use crate::vocabulary::DisabilityTag;

/// A child record as seen by the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub disability: DisabilityTag,
    pub guardian_first_name: String,
    pub guardian_last_name: String,
    pub guardian_email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One `(email, guardian name, tag)` tuple from the record store.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardianRow {
    pub email: String,
    pub guardian_first_name: String,
    pub guardian_last_name: String,
    pub disability: DisabilityTag,
    pub updated_at: DateTime<Utc>,
}

/// Read-only access to child records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChildRecordRepository: Send + Sync {
    /// Rows with a non-blank guardian email whose tag is in `tags`, or all
    /// such rows when `tags` is empty. Rows come back oldest `updated_at`
    /// first; ties keep the store's own order.
    async fn find_guardian_rows(
        &self,
        tags: &BTreeSet<DisabilityTag>,
    ) -> NotificationResult<Vec<GuardianRow>>;

    /// Every tag across the children of one guardian.
    async fn disabilities_for_guardian(
        &self,
        email: &str,
    ) -> NotificationResult<BTreeSet<DisabilityTag>>;
}

#[derive(Clone, Default)]
pub struct InMemoryChildRecordRepository {
    records: Arc<RwLock<Vec<ChildRecord>>>,
}

impl InMemoryChildRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ChildRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub async fn insert(&self, record: ChildRecord) {
        self.records.write().await.push(record);
    }
}

fn has_email(record: &ChildRecord) -> Option<&str> {
    record
        .guardian_email
        .as_deref()
        .filter(|email| !email.trim().is_empty())
}

#[async_trait]
impl ChildRecordRepository for InMemoryChildRecordRepository {
    async fn find_guardian_rows(
        &self,
        tags: &BTreeSet<DisabilityTag>,
    ) -> NotificationResult<Vec<GuardianRow>> {
        let records = self.records.read().await;
        let mut rows: Vec<GuardianRow> = records
            .iter()
            .filter(|record| tags.is_empty() || tags.contains(&record.disability))
            .filter_map(|record| {
                has_email(record).map(|email| GuardianRow {
                    email: email.to_string(),
                    guardian_first_name: record.guardian_first_name.clone(),
                    guardian_last_name: record.guardian_last_name.clone(),
                    disability: record.disability,
                    updated_at: record.updated_at,
                })
            })
            .collect();
        rows.sort_by_key(|row| row.updated_at);
        Ok(rows)
    }

    async fn disabilities_for_guardian(
        &self,
        email: &str,
    ) -> NotificationResult<BTreeSet<DisabilityTag>> {
        let wanted = normalize_email(email);
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| has_email(record).is_some_and(|e| normalize_email(e) == wanted))
            .map(|record| record.disability)
            .collect())
    }
}

/// Which record supplies the guardian name when several children share an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GuardianNamePolicy {
    /// The most recently updated record wins; ties go to the first seen.
    #[default]
    MostRecentlyUpdated,
    /// The first record returned by the store wins.
    FirstSeen,
}

struct GuardianGroup {
    first_name: String,
    last_name: String,
    name_updated_at: DateTime<Utc>,
    tags: BTreeSet<DisabilityTag>,
}

/// Resolves disability tags into deduplicated guardian contacts.
#[derive(Clone)]
pub struct RecipientMatcher {
    children: Arc<dyn ChildRecordRepository>,
    suppressions: Arc<dyn SuppressionRepository>,
    policy: GuardianNamePolicy,
}

impl RecipientMatcher {
    pub fn new(
        children: Arc<dyn ChildRecordRepository>,
        suppressions: Arc<dyn SuppressionRepository>,
    ) -> Self {
        Self {
            children,
            suppressions,
            policy: GuardianNamePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: GuardianNamePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn children(&self) -> &Arc<dyn ChildRecordRepository> {
        &self.children
    }

    /// Guardians with at least one child tagged with a member of `tags`
    /// (any tag when empty), one entry per normalised email, sorted by email.
    #[instrument(skip(self), fields(tags = ?tags))]
    pub async fn match_by_disabilities(
        &self,
        tags: &BTreeSet<DisabilityTag>,
    ) -> NotificationResult<Vec<RecipientContact>> {
        let rows = self.children.find_guardian_rows(tags).await?;
        let mut groups: BTreeMap<String, GuardianGroup> = BTreeMap::new();

        for row in rows {
            let email = normalize_email(&row.email);
            if email.is_empty() {
                continue;
            }

            match groups.get_mut(&email) {
                Some(group) => {
                    group.tags.insert(row.disability);
                    if self.policy == GuardianNamePolicy::MostRecentlyUpdated
                        && row.updated_at > group.name_updated_at
                    {
                        group.first_name = row.guardian_first_name;
                        group.last_name = row.guardian_last_name;
                        group.name_updated_at = row.updated_at;
                    }
                }
                None => {
                    groups.insert(
                        email,
                        GuardianGroup {
                            first_name: row.guardian_first_name,
                            last_name: row.guardian_last_name,
                            name_updated_at: row.updated_at,
                            tags: BTreeSet::from([row.disability]),
                        },
                    );
                }
            }
        }

        let emails: Vec<String> = groups.keys().cloned().collect();
        let suppressed = self.suppressions.suppressed_among(&emails).await?;

        let contacts: Vec<RecipientContact> = groups
            .into_iter()
            .filter(|(email, _)| !suppressed.contains(email))
            .map(|(email, group)| {
                let name = format!("{} {}", group.first_name.trim(), group.last_name.trim())
                    .trim()
                    .to_string();
                RecipientContact {
                    display_name: if name.is_empty() { email.clone() } else { name },
                    email,
                    disability_tags: group.tags,
                }
            })
            .collect();

        debug!(
            recipients = contacts.len(),
            suppressed = suppressed.len(),
            "Matched recipients"
        );

        Ok(contacts)
    }

    /// Distinct recipient count under the same rule as [`Self::match_by_disabilities`].
    pub async fn count_by_disabilities(
        &self,
        tags: &BTreeSet<DisabilityTag>,
    ) -> NotificationResult<usize> {
        Ok(self.match_by_disabilities(tags).await?.len())
    }
}
