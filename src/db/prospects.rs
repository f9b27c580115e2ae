use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::types::ProspectStatus;

const PROSPECT_COLUMNS: &str = "id, campaign_id, first_name, last_name, title, company_name,
    industry, location, profile_url, platform_handle, email, status, contacted_at,
    connection_accepted_at, follow_up_due_at, follow_up_sequence_index, replied_at, error_message";

/// Guard appended to updates that must never touch a terminal prospect.
const NOT_TERMINAL: &str = "status NOT IN ('replied', 'failed', 'completed')";

impl OutreachDb {
    // =========================================================================
    // Prospects
    // =========================================================================

    fn map_prospect_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbProspect> {
        Ok(DbProspect {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            title: row.get(4)?,
            company_name: row.get(5)?,
            industry: row.get(6)?,
            location: row.get(7)?,
            profile_url: row.get(8)?,
            platform_handle: row.get(9)?,
            email: row.get(10)?,
            status: row.get(11)?,
            contacted_at: opt_ts_col(row, 12)?,
            connection_accepted_at: opt_ts_col(row, 13)?,
            follow_up_due_at: opt_ts_col(row, 14)?,
            follow_up_sequence_index: row.get(15)?,
            replied_at: opt_ts_col(row, 16)?,
            error_message: row.get(17)?,
        })
    }

    fn query_prospects(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DbProspect>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::map_prospect_row)?;
        let mut prospects = Vec::new();
        for row in rows {
            prospects.push(row?);
        }
        Ok(prospects)
    }

    /// Admit a prospect into a campaign with status `pending`.
    pub fn insert_prospect(
        &self,
        campaign_id: &str,
        prospect: &NewProspect,
    ) -> Result<DbProspect, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = db_ts(Utc::now());
        self.conn.execute(
            "INSERT INTO prospects (id, campaign_id, first_name, last_name, title, company_name,
                industry, location, profile_url, platform_handle, email, status,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                id,
                campaign_id,
                prospect.first_name,
                prospect.last_name,
                prospect.title,
                prospect.company_name,
                prospect.industry,
                prospect.location,
                prospect.profile_url,
                prospect.platform_handle,
                prospect.email,
                ProspectStatus::Pending,
                now,
            ],
        )?;
        self.get_prospect(&id)
    }

    pub fn get_prospect(&self, id: &str) -> Result<DbProspect, DbError> {
        let sql = format!("SELECT {PROSPECT_COLUMNS} FROM prospects WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], Self::map_prospect_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound {
                entity: "prospect",
                id: id.to_string(),
            })
    }

    /// One page of prospects in `status`, in admission order, strictly after
    /// `after_rowid`. Returns each prospect with its rowid as the next cursor.
    pub fn page_prospects_by_status(
        &self,
        status: ProspectStatus,
        after_rowid: i64,
        limit: u32,
    ) -> Result<Vec<(i64, DbProspect)>, DbError> {
        let sql = format!(
            "SELECT {PROSPECT_COLUMNS}, rowid FROM prospects
             WHERE status = ?1 AND rowid > ?2
             ORDER BY rowid ASC
             LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status, after_rowid, limit], |row| {
            Ok((row.get::<_, i64>(18)?, Self::map_prospect_row(row)?))
        })?;
        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }

    /// Prospects of a workspace that were already queued or contacted, each
    /// with the id and name of its campaign.
    pub fn list_engaged_in_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<(String, String, DbProspect)>, DbError> {
        let sql = format!(
            "SELECT {PROSPECT_COLUMNS},
                    (SELECT c.name FROM campaigns c WHERE c.id = prospects.campaign_id)
             FROM prospects
             WHERE status IN ('queued', 'invite_sent', 'connected', 'replied', 'completed')
               AND campaign_id IN (SELECT id FROM campaigns WHERE workspace_id = ?1)"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            let prospect = Self::map_prospect_row(row)?;
            Ok((prospect.campaign_id.clone(), row.get::<_, String>(18)?, prospect))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `pending` prospects of one campaign in admission order.
    pub fn list_pending_for_campaign(&self, campaign_id: &str) -> Result<Vec<DbProspect>, DbError> {
        let sql = format!(
            "SELECT {PROSPECT_COLUMNS} FROM prospects
             WHERE campaign_id = ?1 AND status = ?2
             ORDER BY created_at ASC, rowid ASC"
        );
        self.query_prospects(&sql, params![campaign_id, ProspectStatus::Pending])
    }

    /// `pending` -> `queued` once the invite item exists.
    pub fn mark_prospect_queued(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE prospects SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                ProspectStatus::Queued,
                db_ts(Utc::now()),
                id,
                ProspectStatus::Pending
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record a delivered invite.
    pub fn mark_invite_sent(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let sql = format!(
            "UPDATE prospects
             SET status = ?1, contacted_at = ?2, follow_up_sequence_index = 0,
                 error_message = NULL, updated_at = ?3
             WHERE id = ?4 AND {NOT_TERMINAL}"
        );
        let changed = self.conn.execute(
            &sql,
            params![ProspectStatus::InviteSent, db_ts(at), db_ts(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    /// `invite_sent` -> `connected`. Returns false when the prospect was not
    /// awaiting acceptance, which makes repeated observations no-ops.
    pub fn mark_connected(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE prospects
             SET status = ?1, connection_accepted_at = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                ProspectStatus::Connected,
                db_ts(at),
                db_ts(Utc::now()),
                id,
                ProspectStatus::InviteSent
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn set_follow_up_due(&self, id: &str, due: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE prospects SET follow_up_due_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![db_ts(due), db_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Persist the sequence position after a delivered follow-up.
    /// The index only moves forward.
    pub fn advance_sequence_index(&self, id: &str, index: u32) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE prospects
             SET follow_up_sequence_index = ?1, updated_at = ?2
             WHERE id = ?3 AND follow_up_sequence_index < ?1",
            params![index, db_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    pub fn mark_prospect_completed(&self, id: &str) -> Result<bool, DbError> {
        let sql = format!(
            "UPDATE prospects SET status = ?1, follow_up_due_at = NULL, updated_at = ?2
             WHERE id = ?3 AND {NOT_TERMINAL}"
        );
        let changed = self.conn.execute(
            &sql,
            params![ProspectStatus::Completed, db_ts(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    /// Terminal failure. The reason is kept for manual review.
    pub fn mark_prospect_failed(&self, id: &str, reason: &str) -> Result<bool, DbError> {
        let sql = format!(
            "UPDATE prospects SET status = ?1, error_message = ?2, updated_at = ?3
             WHERE id = ?4 AND {NOT_TERMINAL}"
        );
        let changed = self.conn.execute(
            &sql,
            params![ProspectStatus::Failed, reason, db_ts(Utc::now()), id],
        )?;
        if changed > 0 {
            log::warn!("Prospect {} failed: {}", id, reason);
        }
        Ok(changed > 0)
    }

    /// The target answered; automation stops for this prospect.
    pub fn mark_replied(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let sql = format!(
            "UPDATE prospects SET status = ?1, replied_at = ?2, follow_up_due_at = NULL,
                 updated_at = ?3
             WHERE id = ?4 AND {NOT_TERMINAL}"
        );
        let changed = self.conn.execute(
            &sql,
            params![ProspectStatus::Replied, db_ts(at), db_ts(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }
}
