use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::types::CampaignStatus;

const ACCOUNT_COLUMNS: &str = "id, workspace_id, display_name, platform_account_id,
    daily_message_count, daily_message_limit, last_reset_date, timezone,
    egress_country, egress_state, egress_session_id, connectivity_status, is_active";

impl DbSendingAccount {
    /// The account's local calendar day at `now`. Unknown timezones fall back to UTC.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        match self.timezone.parse::<Tz>() {
            Ok(tz) => now.with_timezone(&tz).date_naive(),
            Err(_) => {
                log::warn!(
                    "Account {}: invalid timezone '{}', using UTC",
                    self.id,
                    self.timezone
                );
                now.date_naive()
            }
        }
    }

    /// Whether the stored counter belongs to an earlier local day than `today`.
    pub fn needs_reset(&self, today: NaiveDate) -> bool {
        self.last_reset_date.map_or(true, |last| last < today)
    }
}

impl OutreachDb {
    // =========================================================================
    // Identity Registry
    // =========================================================================

    fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbSendingAccount> {
        Ok(DbSendingAccount {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            display_name: row.get(2)?,
            platform_account_id: row.get(3)?,
            daily_message_count: row.get(4)?,
            daily_message_limit: row.get(5)?,
            last_reset_date: opt_date_col(row, 6)?,
            timezone: row.get(7)?,
            egress_country: row.get(8)?,
            egress_state: row.get(9)?,
            egress_session_id: row.get(10)?,
            connectivity_status: row.get(11)?,
            is_active: row.get(12)?,
        })
    }

    /// Register a sending account. Egress assignment starts empty and
    /// `pending`; it is filled in out of band.
    pub fn insert_sending_account(
        &self,
        account: &NewSendingAccount,
    ) -> Result<DbSendingAccount, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = db_ts(Utc::now());
        self.conn.execute(
            "INSERT INTO sending_accounts (id, workspace_id, display_name, platform_account_id,
                daily_message_limit, timezone, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                account.workspace_id,
                account.display_name,
                account.platform_account_id,
                account.daily_message_limit,
                account.timezone,
                now,
            ],
        )?;
        self.get_sending_account(&id)
    }

    pub fn get_sending_account(&self, id: &str) -> Result<DbSendingAccount, DbError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM sending_accounts WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], Self::map_account_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound {
                entity: "sending account",
                id: id.to_string(),
            })
    }

    /// Active accounts that own at least one active campaign.
    pub fn list_dispatchable_accounts(&self) -> Result<Vec<DbSendingAccount>, DbError> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM sending_accounts
             WHERE is_active = 1
               AND EXISTS (SELECT 1 FROM campaigns c
                           WHERE c.account_id = sending_accounts.id AND c.status = ?1)
             ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![CampaignStatus::Active], Self::map_account_row)?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    /// Zero the daily counter if its reset date is before `today`.
    ///
    /// Returns true when a rollover happened.
    pub fn roll_over_daily_counter(
        &self,
        account_id: &str,
        today: NaiveDate,
    ) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE sending_accounts
             SET daily_message_count = 0, last_reset_date = ?1, updated_at = ?2
             WHERE id = ?3 AND (last_reset_date IS NULL OR last_reset_date < ?1)",
            params![db_date(today), db_ts(Utc::now()), account_id],
        )?;
        if changed > 0 {
            log::info!("Account {}: daily counter reset for {}", account_id, today);
        }
        Ok(changed > 0)
    }

    /// Add `count` reservations to the daily counter. Caller has already
    /// checked the remaining budget inside the same transaction.
    pub(crate) fn reserve_budget(&self, account_id: &str, count: u32) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE sending_accounts
             SET daily_message_count = daily_message_count + ?1, updated_at = ?2
             WHERE id = ?3 AND daily_message_count + ?1 <= daily_message_limit",
            params![count, db_ts(Utc::now()), account_id],
        )?;
        Ok(())
    }

    /// Give back one reservation made on `reserved_on`. A no-op once the
    /// counter has rolled over to a later day.
    pub(crate) fn release_reservation(
        &self,
        account_id: &str,
        reserved_on: Option<NaiveDate>,
    ) -> Result<(), DbError> {
        let Some(day) = reserved_on else {
            return Ok(());
        };
        self.conn.execute(
            "UPDATE sending_accounts
             SET daily_message_count = MAX(daily_message_count - 1, 0), updated_at = ?1
             WHERE id = ?2 AND last_reset_date = ?3",
            params![db_ts(Utc::now()), account_id, db_date(day)],
        )?;
        Ok(())
    }
}
