use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::types::CampaignStatus;

const CAMPAIGN_COLUMNS: &str =
    "id, workspace_id, name, account_id, status, message_sequence, daily_message_limit";

/// Status moves campaign authoring and the engine may make.
fn transition_allowed(from: CampaignStatus, to: CampaignStatus) -> bool {
    use CampaignStatus::*;
    matches!(
        (from, to),
        (Draft, Active) | (Paused, Active) | (Active, Paused) | (Active, Completed) | (Paused, Completed)
    )
}

impl OutreachDb {
    // =========================================================================
    // Campaigns
    // =========================================================================

    fn map_campaign_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbCampaign> {
        let sequence_json: String = row.get(5)?;
        let message_sequence =
            serde_json::from_str(&sequence_json).map_err(|e| conversion_error(5, e))?;
        Ok(DbCampaign {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            name: row.get(2)?,
            account_id: row.get(3)?,
            status: row.get(4)?,
            message_sequence,
            daily_message_limit: row.get(6)?,
        })
    }

    /// Create a campaign in `draft`.
    pub fn insert_campaign(&self, campaign: &NewCampaign) -> Result<DbCampaign, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = db_ts(Utc::now());
        let sequence_json = serde_json::to_string(&campaign.message_sequence)?;
        self.conn.execute(
            "INSERT INTO campaigns (id, workspace_id, name, account_id, status,
                message_sequence, daily_message_limit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                campaign.workspace_id,
                campaign.name,
                campaign.account_id,
                CampaignStatus::Draft,
                sequence_json,
                campaign.daily_message_limit,
                now,
            ],
        )?;
        self.get_campaign(&id)
    }

    pub fn get_campaign(&self, id: &str) -> Result<DbCampaign, DbError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], Self::map_campaign_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound {
                entity: "campaign",
                id: id.to_string(),
            })
    }

    /// Move a campaign to `to`. Setting the current status again is a no-op.
    pub fn set_campaign_status(
        &self,
        id: &str,
        to: CampaignStatus,
    ) -> Result<DbCampaign, DbError> {
        self.with_transaction(|tx| {
            let campaign = tx.get_campaign(id)?;
            if campaign.status == to {
                return Ok(campaign);
            }
            if !transition_allowed(campaign.status, to) {
                return Err(DbError::InvalidTransition {
                    entity: "campaign",
                    from: campaign.status.to_string(),
                    to: to.to_string(),
                });
            }
            tx.conn.execute(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to, db_ts(Utc::now()), id],
            )?;
            log::info!("Campaign {}: {} -> {}", id, campaign.status, to);
            Ok(DbCampaign {
                status: to,
                ..campaign
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_insert_campaign_round_trips_sequence() {
        let db = test_db();
        let account = seed_account(&db, 5);
        let campaign = seed_campaign(&db, &account.id, two_step_sequence(), 10);

        let loaded = db.get_campaign(&campaign.id).unwrap();
        assert_eq!(loaded.status, CampaignStatus::Draft);
        assert_eq!(loaded.message_sequence, two_step_sequence());
        assert_eq!(loaded.message_sequence[1].delay.days, 1);
    }

    #[test]
    fn test_status_transitions() {
        let db = test_db();
        let account = seed_account(&db, 5);
        let campaign = seed_campaign(&db, &account.id, two_step_sequence(), 10);

        assert!(matches!(
            db.set_campaign_status(&campaign.id, CampaignStatus::Paused),
            Err(DbError::InvalidTransition { .. })
        ));
        db.set_campaign_status(&campaign.id, CampaignStatus::Active)
            .unwrap();
        db.set_campaign_status(&campaign.id, CampaignStatus::Paused)
            .unwrap();
        db.set_campaign_status(&campaign.id, CampaignStatus::Active)
            .unwrap();
        db.set_campaign_status(&campaign.id, CampaignStatus::Completed)
            .unwrap();
        assert!(db
            .set_campaign_status(&campaign.id, CampaignStatus::Active)
            .is_err());
        assert_eq!(
            db.get_campaign(&campaign.id).unwrap().status,
            CampaignStatus::Completed
        );
    }

    #[test]
    fn test_same_status_is_noop() {
        let db = test_db();
        let account = seed_account(&db, 5);
        let campaign = seed_campaign(&db, &account.id, two_step_sequence(), 10);
        let unchanged = db
            .set_campaign_status(&campaign.id, CampaignStatus::Draft)
            .unwrap();
        assert_eq!(unchanged.status, CampaignStatus::Draft);
    }
}
