use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Engine configuration loaded from `~/.outreach-engine/config.json`.
///
/// Every block has defaults, so `{}` is a valid config file. Secrets may be
/// supplied through the environment instead (see `state::load_config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Explicit database path. Defaults to `~/.outreach-engine/outreach.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub limits: PlatformLimits,
    #[serde(default)]
    pub activation: ActivationConfig,
    /// Working-hours exclusion. `None` means sends may go out at any time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_window: Option<SendWindowConfig>,
}

/// Connection settings for the external platform API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    #[serde(default = "default_platform_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_platform_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_platform_base_url() -> String {
    "https://api.platform.invalid".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Residential proxy gateway used to pin each account's egress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Account-level username; country/state/session suffixes are appended per identity.
    pub username_prefix: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    #[serde(default = "default_dispatcher_tick_secs")]
    pub tick_secs: u64,
    /// Upper bound on claims per account per tick, on top of the daily budget.
    #[serde(default = "default_max_claim_per_tick")]
    pub max_claim_per_tick: u32,
    /// Claimed items older than this are assumed abandoned and returned to pending.
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_dispatcher_tick_secs(),
            max_claim_per_tick: default_max_claim_per_tick(),
            stale_claim_minutes: default_stale_claim_minutes(),
        }
    }
}

fn default_dispatcher_tick_secs() -> u64 {
    60
}
fn default_max_claim_per_tick() -> u32 {
    10
}
fn default_stale_claim_minutes() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerConfig {
    #[serde(default = "default_poller_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_poller_batch_size")]
    pub batch_size: u32,
    /// Withdrawn/expired observations younger than this are treated as pending.
    #[serde(default = "default_acceptance_grace_hours")]
    pub acceptance_grace_hours: i64,
    /// Invitations still pending after this many days are withdrawn.
    #[serde(default = "default_stale_invite_days")]
    pub stale_invite_days: i64,
    #[serde(default = "default_max_withdrawals_per_run")]
    pub max_withdrawals_per_run: u32,
    #[serde(default = "default_true")]
    pub check_replies: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_poller_tick_secs(),
            batch_size: default_poller_batch_size(),
            acceptance_grace_hours: default_acceptance_grace_hours(),
            stale_invite_days: default_stale_invite_days(),
            max_withdrawals_per_run: default_max_withdrawals_per_run(),
            check_replies: true,
        }
    }
}

fn default_poller_tick_secs() -> u64 {
    7200
}
fn default_poller_batch_size() -> u32 {
    50
}
fn default_acceptance_grace_hours() -> i64 {
    24
}
fn default_stale_invite_days() -> i64 {
    21
}
fn default_max_withdrawals_per_run() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

/// Backoff schedule for transient dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: i64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

/// One year. Keeps a misconfigured cap inside timestamp range.
const MAX_BACKOFF_SECS: i64 = 365 * 24 * 3600;

impl RetryPolicy {
    /// Delay before the next attempt, after `attempts` failed ones (1-based).
    ///
    /// Exponential: initial, 2x, 4x, ... capped at `max_backoff_secs`.
    pub fn backoff(&self, attempts: u32) -> chrono::Duration {
        let exponent = 2i64.saturating_pow(attempts.saturating_sub(1));
        let secs = self
            .initial_backoff_secs
            .saturating_mul(exponent)
            .min(self.max_backoff_secs)
            .clamp(0, MAX_BACKOFF_SECS);
        chrono::Duration::seconds(secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_secs() -> i64 {
    300
}
fn default_max_backoff_secs() -> i64 {
    3600
}

/// Hard per-message-type character limits imposed by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformLimits {
    #[serde(default = "default_invite_max_chars")]
    pub invite_max_chars: usize,
    #[serde(default = "default_message_max_chars")]
    pub message_max_chars: usize,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            invite_max_chars: default_invite_max_chars(),
            message_max_chars: default_message_max_chars(),
        }
    }
}

impl PlatformLimits {
    pub fn max_chars(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Invite => self.invite_max_chars,
            MessageKind::FollowUp => self.message_max_chars,
        }
    }
}

fn default_invite_max_chars() -> usize {
    300
}
fn default_message_max_chars() -> usize {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationConfig {
    /// Gap between consecutive invites when a campaign is activated.
    #[serde(default = "default_invite_spacing_minutes")]
    pub invite_spacing_minutes: i64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            invite_spacing_minutes: default_invite_spacing_minutes(),
        }
    }
}

fn default_invite_spacing_minutes() -> i64 {
    30
}

/// Business-hours window in which items may be claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendWindowConfig {
    /// IANA timezone the working hours are evaluated in.
    #[serde(default = "default_window_timezone")]
    pub timezone: String,
    #[serde(default = "default_work_hours_start")]
    pub start_hour: u32,
    #[serde(default = "default_work_hours_end")]
    pub end_hour: u32,
    #[serde(default = "default_true")]
    pub skip_weekends: bool,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Default for SendWindowConfig {
    fn default() -> Self {
        Self {
            timezone: default_window_timezone(),
            start_hour: default_work_hours_start(),
            end_hour: default_work_hours_end(),
            skip_weekends: true,
            holidays: Vec::new(),
        }
    }
}

fn default_window_timezone() -> String {
    "America/Los_Angeles".to_string()
}
fn default_work_hours_start() -> u32 {
    5
}
fn default_work_hours_end() -> u32 {
    17
}

// =============================================================================
// Domain enums
// =============================================================================

/// Generates `as_str`, `Display`, `FromStr` and the rusqlite conversions for a
/// status enum stored as lowercase text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// A stored status string that no variant matches.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

text_enum!(CampaignStatus {
    Draft => "draft",
    Active => "active",
    Paused => "paused",
    Completed => "completed",
});

/// Lifecycle of one target person within one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectStatus {
    Pending,
    Queued,
    InviteSent,
    Connected,
    Replied,
    Failed,
    Completed,
}

text_enum!(ProspectStatus {
    Pending => "pending",
    Queued => "queued",
    InviteSent => "invite_sent",
    Connected => "connected",
    Replied => "replied",
    Failed => "failed",
    Completed => "completed",
});

impl ProspectStatus {
    /// No further automated sends happen from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProspectStatus::Replied | ProspectStatus::Failed | ProspectStatus::Completed
        )
    }
}

/// `Claimed` is the in-flight marker set by the compare-and-swap claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
}

text_enum!(QueueItemStatus {
    Pending => "pending",
    Claimed => "claimed",
    Sent => "sent",
    Failed => "failed",
});

/// Connectivity of an account's pinned egress assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Pending,
    Connected,
    Degraded,
    Disconnected,
}

text_enum!(ConnectivityStatus {
    Pending => "pending",
    Connected => "connected",
    Degraded => "degraded",
    Disconnected => "disconnected",
});

/// Which platform operation a sequence step maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Invite,
    FollowUp,
}

impl MessageKind {
    pub fn for_sequence_index(index: u32) -> Self {
        if index == 0 {
            MessageKind::Invite
        } else {
            MessageKind::FollowUp
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Invite => f.write_str("invite"),
            MessageKind::FollowUp => f.write_str("follow-up"),
        }
    }
}

/// Invitation state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Withdrawn,
    Expired,
    /// Platform could not answer; never inferred as a failure.
    Unknown,
}

// =============================================================================
// Message sequence
// =============================================================================

/// Delay of a sequence step, measured from the previous step's completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDelay {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
}

impl StepDelay {
    pub fn days(days: i64) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    /// `None` for negative or out-of-range values.
    pub fn to_duration(&self) -> Option<chrono::Duration> {
        if self.days < 0 || self.hours < 0 || self.minutes < 0 {
            return None;
        }
        chrono::Duration::try_days(self.days)?
            .checked_add(&chrono::Duration::try_hours(self.hours)?)?
            .checked_add(&chrono::Duration::try_minutes(self.minutes)?)
    }

    /// When a step with this delay falls due, counting from `from`.
    pub fn due_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.to_duration()?)
    }
}

/// One entry of `Campaign.message_sequence`. Index 0 is the invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub template: String,
    #[serde(default)]
    pub delay: StepDelay,
}

impl SequenceStep {
    pub fn new(template: &str, delay: StepDelay) -> Self {
        Self {
            template: template.to_string(),
            delay,
        }
    }
}
