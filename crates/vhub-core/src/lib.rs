//! Core domain model for the volunteer hub client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vhub-core";

/// Label shown when an opportunity has no attached foundation.
pub const FOUNDATION_NOT_SPECIFIED: &str = "foundation not specified";

/// Backend records the client passes through without reshaping
/// (users, donations, certificates, suggestions, notifications, comments).
pub type OpaqueRecord = serde_json::Value;

/// Foundation as served by `GET /foundations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Foundation {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub legal_name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Volunteer opportunity. `foundation` and `average_rating` are filled in by
/// enrichment after the primary fetch and stay `None` when that fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub start_date: DateTime<Utc>,
    #[serde(deserialize_with = "de_timestamp")]
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(deserialize_with = "de_id")]
    pub foundation_id: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation: Option<Foundation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_rating: Option<f64>,
}

impl Opportunity {
    /// Status relative to `now`. Recomputed on every call, never stored.
    pub fn status_at(&self, now: DateTime<Utc>) -> OpportunityStatus {
        if now < self.start_date {
            OpportunityStatus::Upcoming
        } else if now > self.end_date {
            OpportunityStatus::Ended
        } else {
            OpportunityStatus::Active
        }
    }

    pub fn status(&self) -> OpportunityStatus {
        self.status_at(Utc::now())
    }

    pub fn foundation_label(&self) -> &str {
        self.foundation
            .as_ref()
            .map(|f| f.legal_name.as_str())
            .unwrap_or(FOUNDATION_NOT_SPECIFIED)
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.description.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Upcoming,
    Active,
    Ended,
}

impl OpportunityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpportunityStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upcoming" => Ok(Self::Upcoming),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(ParseEnumError::new("opportunity status", other)),
        }
    }
}

/// Kind of item a favorite points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Foundation,
    Opportunity,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foundation => "foundation",
            Self::Opportunity => "opportunity",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "foundation" | "foundations" => Ok(Self::Foundation),
            "opportunity" | "opportunities" => Ok(Self::Opportunity),
            other => Err(ParseEnumError::new("item type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FavoriteEntry {
    #[serde(deserialize_with = "de_id")]
    pub item_id: String,
    pub item_type: ItemType,
}

impl FavoriteEntry {
    pub fn new(item_id: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            item_id: item_id.into(),
            item_type,
        }
    }
}

/// `GET /ratings/opportunity/{id}/average`. A null or missing average reads as 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RatingSummary {
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub average_rating: f64,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FoundationSort {
    #[default]
    Name,
    Newest,
    Oldest,
}

impl FromStr for FoundationSort {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            other => Err(ParseEnumError::new("foundation sort", other)),
        }
    }
}

/// Search state of the foundations list. Empty strings impose no constraint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FoundationFilter {
    pub search: String,
    pub location: String,
    pub sort_by: FoundationSort,
}

impl FoundationFilter {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Search state of the opportunities list. Unset fields impose no constraint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpportunityFilter {
    pub search: String,
    pub status: Option<OpportunityStatus>,
    pub location: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl OpportunityFilter {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
}

impl SessionUser {
    pub fn is_foundation(&self) -> bool {
        self.user_type.as_deref() == Some("foundation")
    }
}

/// Logged-in state: set on login, cleared on logout or on any 401.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: SessionUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation: Option<Foundation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Parse a backend timestamp: RFC 3339, naive date-time (read as UTC) or a bare date
/// (UTC midnight).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(start_of_day)
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
    })
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp {raw:?}")))
}

fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Number(f64),
    Text(String),
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawNumber>::deserialize(deserializer)? {
        Some(RawNumber::Number(n)) => Some(n),
        Some(RawNumber::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

fn de_lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_number(deserializer)?
        .filter(|n| n.is_finite())
        .unwrap_or(0.0))
}

fn de_lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_number(deserializer)?
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n as u64)
        .unwrap_or(0))
}
