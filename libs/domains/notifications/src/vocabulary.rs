//! The closed set of disability tags used to target recipients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use utoipa::ToSchema;

use crate::error::{NotificationError, NotificationResult};

/// A recognised disability classification attached to a child record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DisabilityTag {
    Autism,
    Adhd,
    Dyslexia,
    Dyspraxia,
    Hearing,
    Visual,
    Speech,
    Physical,
    Learning,
    Sensory,
    Other,
}

impl DisabilityTag {
    /// Parse a raw tag, trimming whitespace and ignoring case.
    pub fn parse(raw: &str) -> NotificationResult<Self> {
        let trimmed = raw.trim();
        Self::from_str(trimmed).map_err(|_| NotificationError::UnknownDisability(trimmed.to_string()))
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DisabilityTag::Autism => "Autism Spectrum",
            DisabilityTag::Adhd => "ADHD",
            DisabilityTag::Dyslexia => "Dyslexia",
            DisabilityTag::Dyspraxia => "Dyspraxia",
            DisabilityTag::Hearing => "Hearing Impairment",
            DisabilityTag::Visual => "Visual Impairment",
            DisabilityTag::Speech => "Speech and Language",
            DisabilityTag::Physical => "Physical Disability",
            DisabilityTag::Learning => "Learning Disability",
            DisabilityTag::Sensory => "Sensory Processing",
            DisabilityTag::Other => "Other",
        }
    }

    pub fn all() -> impl Iterator<Item = DisabilityTag> {
        Self::iter()
    }
}

/// Normalise a list of raw tags into a set, failing on the first unknown tag.
///
/// An empty result means "all recipients".
pub fn parse_tag_set<I, S>(raw: I) -> NotificationResult<BTreeSet<DisabilityTag>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter(|tag| !tag.as_ref().trim().is_empty())
        .map(|tag| DisabilityTag::parse(tag.as_ref()))
        .collect()
}

/// Parse a comma separated query value such as `autism, ADHD`.
pub fn parse_csv(raw: &str) -> NotificationResult<BTreeSet<DisabilityTag>> {
    parse_tag_set(raw.split(','))
}

/// Human readable names for a tag set, in vocabulary order.
pub fn display_names(tags: &BTreeSet<DisabilityTag>) -> Vec<&'static str> {
    tags.iter().map(DisabilityTag::display_name).collect()
}
