//! Follow-up Scheduler and campaign activation.
//!
//! Only ever writes queue items and the prospect's due time; never sends.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::db::{DbCampaign, DbError, DbProspect, NewQueueItem, OutreachDb};
use crate::error::EngineError;
use crate::types::CampaignStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Enqueued {
        item_id: String,
        sequence_index: u32,
        due: DateTime<Utc>,
    },
    /// Sequence exhausted; the prospect is now `completed`.
    Completed,
    /// The step's delay is unusable; the prospect is now `failed`.
    Failed { reason: String },
}

/// Queue the step after the prospect's persisted sequence position, or
/// complete the prospect when there is none.
pub fn schedule_next(
    db: &OutreachDb,
    prospect: &DbProspect,
    campaign: &DbCampaign,
    now: DateTime<Utc>,
) -> Result<ScheduleOutcome, DbError> {
    let next_index = prospect.follow_up_sequence_index + 1;
    let Some(step) = campaign.message_sequence.get(next_index as usize) else {
        db.mark_prospect_completed(&prospect.id)?;
        log::info!(
            "FollowUp: prospect {} completed the sequence ({} steps)",
            prospect.id,
            campaign.message_sequence.len()
        );
        return Ok(ScheduleOutcome::Completed);
    };

    let Some(due) = step.delay.due_after(now) else {
        let reason = format!(
            "Step {} of campaign {} has an invalid delay {:?}",
            next_index, campaign.id, step.delay
        );
        db.mark_prospect_failed(&prospect.id, &reason)?;
        return Ok(ScheduleOutcome::Failed { reason });
    };

    db.with_transaction(|tx| {
        tx.set_follow_up_due(&prospect.id, due)?;
        let item = tx.enqueue(&NewQueueItem {
            prospect_id: prospect.id.clone(),
            campaign_id: campaign.id.clone(),
            account_id: campaign.account_id.clone(),
            sequence_index: next_index,
            scheduled_for: due,
        })?;
        log::info!(
            "FollowUp: prospect {} step {} due {}",
            prospect.id,
            next_index,
            due
        );
        Ok(ScheduleOutcome::Enqueued {
            item_id: item.id,
            sequence_index: next_index,
            due,
        })
    })
}

/// Result of `activate_campaign`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    pub queued: usize,
    /// Prospects failed because the same person is already engaged in the
    /// workspace.
    pub duplicates: usize,
    pub first_due: Option<DateTime<Utc>>,
    pub last_due: Option<DateTime<Utc>>,
}

/// Lowercased target handle -> (campaign id, campaign name) of every prospect
/// already queued or contacted in the workspace.
fn engaged_handles(
    db: &OutreachDb,
    workspace_id: &str,
) -> Result<HashMap<String, (String, String)>, DbError> {
    Ok(db
        .list_engaged_in_workspace(workspace_id)?
        .into_iter()
        .filter_map(|(campaign_id, name, prospect)| {
            prospect
                .target_handle()
                .map(|handle| (handle.to_lowercase(), (campaign_id, name)))
        })
        .collect())
}

/// Move a campaign to `active` and queue the invite for every `pending`
/// prospect, spaced `spacing` apart in admission order.
///
/// A prospect whose target is already queued or contacted elsewhere in the
/// workspace (this campaign included) is failed instead of queued.
/// Re-activating an active campaign queues prospects admitted since.
pub fn activate_campaign(
    db: &OutreachDb,
    campaign_id: &str,
    now: DateTime<Utc>,
    spacing: Duration,
) -> Result<Activation, EngineError> {
    db.with_transaction(|tx| {
        let campaign = tx.set_campaign_status(campaign_id, CampaignStatus::Active)?;
        let invite = campaign.message_sequence.first().ok_or_else(|| {
            EngineError::Config(format!("Campaign {} has an empty message sequence", campaign_id))
        })?;
        let start = invite.delay.due_after(now).ok_or_else(|| {
            EngineError::Config(format!(
                "Campaign {} has an invalid invite delay {:?}",
                campaign_id, invite.delay
            ))
        })?;

        let mut engaged = engaged_handles(tx, &campaign.workspace_id)?;
        let mut activation = Activation::default();
        for prospect in tx.list_pending_for_campaign(campaign_id)? {
            let handle = prospect.target_handle().map(|h| h.to_lowercase());
            if let Some((other_id, other_name)) = handle.as_ref().and_then(|h| engaged.get(h)) {
                let reason = if *other_id == campaign.id {
                    "Duplicate: already in this campaign".to_string()
                } else {
                    format!("Duplicate: already in {} (same workspace)", other_name)
                };
                tx.mark_prospect_failed(&prospect.id, &reason)?;
                activation.duplicates += 1;
                continue;
            }

            let due = i32::try_from(activation.queued)
                .ok()
                .and_then(|i| spacing.checked_mul(i))
                .and_then(|offset| start.checked_add_signed(offset))
                .ok_or_else(|| {
                    EngineError::Config(format!("Invite spacing {} is out of range", spacing))
                })?;
            match tx.enqueue(&NewQueueItem {
                prospect_id: prospect.id.clone(),
                campaign_id: campaign.id.clone(),
                account_id: campaign.account_id.clone(),
                sequence_index: 0,
                scheduled_for: due,
            }) {
                Ok(_) => {}
                Err(DbError::DuplicatePending { .. }) => {
                    log::warn!(
                        "FollowUp: prospect {} already has an item in flight, not re-queued",
                        prospect.id
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            tx.mark_prospect_queued(&prospect.id)?;
            if let Some(handle) = handle {
                engaged.insert(handle, (campaign.id.clone(), campaign.name.clone()));
            }
            activation.first_due.get_or_insert(due);
            activation.last_due = Some(due);
            activation.queued += 1;
        }

        log::info!(
            "FollowUp: activated campaign {} with {} invite(s) queued, {} duplicate(s) failed",
            campaign_id,
            activation.queued,
            activation.duplicates
        );
        Ok(activation)
    })
}

/// Stop claiming for a campaign. Items already claimed still finish.
pub fn pause_campaign(db: &OutreachDb, campaign_id: &str) -> Result<DbCampaign, DbError> {
    db.set_campaign_status(campaign_id, CampaignStatus::Paused)
}
