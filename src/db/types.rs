//! Shared type definitions for the database layer.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    CampaignStatus, ConnectivityStatus, ProspectStatus, QueueItemStatus, SequenceStep,
};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Prospect {prospect_id} already has an in-flight send queue item")]
    DuplicatePending { prospect_id: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Invalid message sequence JSON: {0}")]
    Sequence(#[from] serde_json::Error),
}

/// A row from `sending_accounts`: one Identity Registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSendingAccount {
    pub id: String,
    pub workspace_id: String,
    pub display_name: String,
    /// Account id on the external platform.
    pub platform_account_id: String,
    pub daily_message_count: u32,
    pub daily_message_limit: u32,
    pub last_reset_date: Option<NaiveDate>,
    /// IANA timezone that defines this account's "local day".
    pub timezone: String,
    pub egress_country: Option<String>,
    pub egress_state: Option<String>,
    pub egress_session_id: Option<String>,
    pub connectivity_status: ConnectivityStatus,
    pub is_active: bool,
}

impl DbSendingAccount {
    pub fn remaining_budget(&self) -> u32 {
        self.daily_message_limit
            .saturating_sub(self.daily_message_count)
    }
}

/// A row from `campaigns`. Read-only to the engine apart from status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCampaign {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub account_id: String,
    pub status: CampaignStatus,
    pub message_sequence: Vec<SequenceStep>,
    pub daily_message_limit: u32,
}

/// A row from `prospects`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProspect {
    pub id: String,
    pub campaign_id: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub title: Option<String>,
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
    pub profile_url: Option<String>,
    pub platform_handle: Option<String>,
    pub email: Option<String>,
    pub status: ProspectStatus,
    pub contacted_at: Option<DateTime<Utc>>,
    pub connection_accepted_at: Option<DateTime<Utc>>,
    pub follow_up_due_at: Option<DateTime<Utc>>,
    /// 0 = only the invite sent, N = N follow-ups sent.
    pub follow_up_sequence_index: u32,
    pub replied_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

fn re_profile_vanity() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)/in/([^/?#\s]+)").unwrap())
}

impl DbProspect {
    /// Identifier used to address this person on the platform.
    ///
    /// Explicit handle first, else the vanity segment of a `/in/<vanity>`
    /// profile URL. Email-only prospects have no platform target.
    pub fn target_handle(&self) -> Option<String> {
        if let Some(handle) = self.platform_handle.as_deref().map(str::trim) {
            if !handle.is_empty() {
                return Some(handle.to_string());
            }
        }
        let url = self.profile_url.as_deref()?;
        re_profile_vanity()
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_lowercase())
    }

    pub fn full_name(&self) -> String {
        match self.last_name.as_deref().map(str::trim) {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name.trim(), last),
            _ => self.first_name.trim().to_string(),
        }
    }
}

/// A row from `send_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbQueueItem {
    pub id: String,
    pub prospect_id: String,
    pub campaign_id: String,
    pub account_id: String,
    /// Which template of the campaign sequence this item fires.
    pub sequence_index: u32,
    pub scheduled_for: DateTime<Utc>,
    pub status: QueueItemStatus,
    pub attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Local day whose budget this claim reserved.
    pub reserved_on: Option<NaiveDate>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Input for admitting a sending account into the registry.
#[derive(Debug, Clone)]
pub struct NewSendingAccount {
    pub workspace_id: String,
    pub display_name: String,
    pub platform_account_id: String,
    pub daily_message_limit: u32,
    pub timezone: String,
}

/// Input for creating a campaign (normally written by campaign authoring).
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub workspace_id: String,
    pub name: String,
    pub account_id: String,
    pub message_sequence: Vec<SequenceStep>,
    pub daily_message_limit: u32,
}

/// Input for admitting a prospect into a campaign.
#[derive(Debug, Clone, Default)]
pub struct NewProspect {
    pub first_name: String,
    pub last_name: Option<String>,
    pub title: Option<String>,
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
    pub profile_url: Option<String>,
    pub platform_handle: Option<String>,
    pub email: Option<String>,
}

/// Input for `OutreachDb::enqueue`.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub prospect_id: String,
    pub campaign_id: String,
    pub account_id: String,
    pub sequence_index: u32,
    pub scheduled_for: DateTime<Utc>,
}

/// Per-status item counts for one campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u32,
    pub claimed: u32,
    pub sent: u32,
    pub failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prospect(handle: Option<&str>, url: Option<&str>) -> DbProspect {
        DbProspect {
            id: "p1".to_string(),
            campaign_id: "c1".to_string(),
            first_name: "Ada".to_string(),
            last_name: Some("Lovelace".to_string()),
            title: None,
            company_name: None,
            industry: None,
            location: None,
            profile_url: url.map(String::from),
            platform_handle: handle.map(String::from),
            email: None,
            status: ProspectStatus::Pending,
            contacted_at: None,
            connection_accepted_at: None,
            follow_up_due_at: None,
            follow_up_sequence_index: 0,
            replied_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_target_handle_prefers_explicit_handle() {
        let p = prospect(Some("ACo123"), Some("https://www.linkedin.com/in/ada-l/"));
        assert_eq!(p.target_handle().as_deref(), Some("ACo123"));
    }

    #[test]
    fn test_target_handle_extracts_vanity_from_url() {
        let p = prospect(None, Some("https://www.linkedin.com/in/Ada-L?trk=x"));
        assert_eq!(p.target_handle().as_deref(), Some("ada-l"));
    }

    #[test]
    fn test_target_handle_none_for_unparseable_url() {
        let p = prospect(Some("  "), Some("https://example.com/company/acme"));
        assert!(p.target_handle().is_none());
    }

    #[test]
    fn test_full_name() {
        assert_eq!(prospect(None, None).full_name(), "Ada Lovelace");
    }
}
