//! SQLite-backed durable state for the campaign execution engine.
//!
//! Four tables: `sending_accounts` (Identity Registry), `campaigns`,
//! `prospects`, and `send_queue`. The database is the single source of truth
//! shared by the Dispatcher and the Acceptance Poller; every multi-row state
//! change runs inside `with_transaction`.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

pub mod accounts;
pub mod campaigns;
pub mod prospects;
pub mod send_queue;
pub mod types;
pub use send_queue::FailureOutcome;
pub use types::*;

pub struct OutreachDb {
    conn: Connection,
}

impl OutreachDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// Calls made while a transaction is already open join it instead of
    /// nesting, so composite operations can call each other freely.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(DbError::from)?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT").map_err(DbError::from)?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database and apply the schema.
    ///
    /// `path` overrides the default `~/.outreach-engine/outreach.db`.
    pub fn open(path: Option<&str>) -> Result<Self, DbError> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_path()?,
        };
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets the two workers read while the other writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        log::debug!("OutreachDb: opened {}", path.display());
        Ok(Self { conn })
    }

    fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".outreach-engine").join("outreach.db"))
    }
}

// =============================================================================
// Column helpers
// =============================================================================

/// Fixed-width RFC 3339 UTC text, so string order equals time order.
pub(crate) fn db_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn db_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

pub(crate) fn opt_date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e)))
        .transpose()
}

#[cfg(test)]
pub mod test_utils {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::types::{ConnectivityStatus, SequenceStep, StepDelay};

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_db() -> OutreachDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        OutreachDb::open_at(path).expect("Failed to open test database")
    }

    /// Monday 2 March 2026, 09:00 UTC.
    pub fn monday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    /// A connected account with a pinned egress session and the given cap.
    pub fn seed_account(db: &OutreachDb, daily_limit: u32) -> DbSendingAccount {
        let account = db
            .insert_sending_account(&NewSendingAccount {
                workspace_id: "ws-1".to_string(),
                display_name: "Sales Rep".to_string(),
                platform_account_id: "plat-acct-1".to_string(),
                daily_message_limit: daily_limit,
                timezone: "UTC".to_string(),
            })
            .expect("insert account");
        db.conn_ref()
            .execute(
                "UPDATE sending_accounts
                 SET egress_country = 'us', egress_state = 'ca',
                     egress_session_id = 'sess-1', connectivity_status = ?1
                 WHERE id = ?2",
                rusqlite::params![ConnectivityStatus::Connected, account.id],
            )
            .expect("pin egress");
        db.get_sending_account(&account.id).expect("reload account")
    }

    /// Invite followed by one follow-up a day later.
    pub fn two_step_sequence() -> Vec<SequenceStep> {
        vec![
            SequenceStep::new("Hi {first_name}, let's connect!", StepDelay::default()),
            SequenceStep::new(
                "Thanks for connecting, {first_name}. How are things at {company_name}?",
                StepDelay::days(1),
            ),
        ]
    }

    pub fn seed_campaign(
        db: &OutreachDb,
        account_id: &str,
        sequence: Vec<SequenceStep>,
        daily_limit: u32,
    ) -> DbCampaign {
        db.insert_campaign(&NewCampaign {
            workspace_id: "ws-1".to_string(),
            name: "Q2 founders".to_string(),
            account_id: account_id.to_string(),
            message_sequence: sequence,
            daily_message_limit: daily_limit,
        })
        .expect("insert campaign")
    }

    pub fn seed_prospect(db: &OutreachDb, campaign_id: &str, handle: &str) -> DbProspect {
        db.insert_prospect(
            campaign_id,
            &NewProspect {
                first_name: "Ada".to_string(),
                last_name: Some("Lovelace".to_string()),
                title: Some("CTO".to_string()),
                company_name: Some("Analytical Engines".to_string()),
                platform_handle: Some(handle.to_string()),
                ..NewProspect::default()
            },
        )
        .expect("insert prospect")
    }
}
