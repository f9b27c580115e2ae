use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::error::FailureKind;
use crate::types::{CampaignStatus, QueueItemStatus, RetryPolicy};

const QUEUE_COLUMNS: &str = "id, prospect_id, campaign_id, account_id, sequence_index,
    scheduled_for, status, attempts, claimed_at, reserved_on, sent_at, error_message";

/// What `mark_failed` did with the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to `pending` for another attempt.
    Rescheduled { attempts: u32, next_at: DateTime<Utc> },
    /// Item and prospect are `failed`.
    Failed,
    /// The item had already left `claimed`; nothing was changed.
    NotClaimed,
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl OutreachDb {
    // =========================================================================
    // Send Queue
    // =========================================================================

    fn map_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbQueueItem> {
        Ok(DbQueueItem {
            id: row.get(0)?,
            prospect_id: row.get(1)?,
            campaign_id: row.get(2)?,
            account_id: row.get(3)?,
            sequence_index: row.get(4)?,
            scheduled_for: ts_col(row, 5)?,
            status: row.get(6)?,
            attempts: row.get(7)?,
            claimed_at: opt_ts_col(row, 8)?,
            reserved_on: opt_date_col(row, 9)?,
            sent_at: opt_ts_col(row, 10)?,
            error_message: row.get(11)?,
        })
    }

    /// Insert a `pending` item.
    ///
    /// Fails with `DuplicatePending` if the prospect already has an item that
    /// is pending or claimed.
    pub fn enqueue(&self, item: &NewQueueItem) -> Result<DbQueueItem, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = db_ts(Utc::now());
        let result = self.conn.execute(
            "INSERT INTO send_queue (id, prospect_id, campaign_id, account_id, sequence_index,
                scheduled_for, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                item.prospect_id,
                item.campaign_id,
                item.account_id,
                item.sequence_index,
                db_ts(item.scheduled_for),
                QueueItemStatus::Pending,
                now,
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(DbError::DuplicatePending {
                    prospect_id: item.prospect_id.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        log::debug!(
            "SendQueue: enqueued {} (prospect {}, step {}) for {}",
            id,
            item.prospect_id,
            item.sequence_index,
            item.scheduled_for
        );
        self.get_queue_item(&id)
    }

    pub fn get_queue_item(&self, id: &str) -> Result<DbQueueItem, DbError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM send_queue WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], Self::map_queue_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound {
                entity: "send queue item",
                id: id.to_string(),
            })
    }

    /// All items ever created for a prospect, oldest first.
    pub fn queue_items_for_prospect(&self, prospect_id: &str) -> Result<Vec<DbQueueItem>, DbError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM send_queue WHERE prospect_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![prospect_id], Self::map_queue_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Claim up to `limit` due items for one account.
    ///
    /// One transaction: roll the account's counter over to its local today,
    /// cap by the remaining account budget and each campaign's daily limit,
    /// compare-and-swap each item `pending` -> `claimed` oldest-due first,
    /// and reserve one unit of budget per claimed item. Items of campaigns
    /// that are not `active` are never claimed.
    pub fn claim_due(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DbQueueItem>, DbError> {
        self.with_transaction(|tx| {
            let mut account = tx.get_sending_account(account_id)?;
            let today = account.local_date(now);
            if tx.roll_over_daily_counter(account_id, today)? {
                account.daily_message_count = 0;
            }

            let budget = account.remaining_budget().min(limit);
            if budget == 0 {
                log::debug!("SendQueue: account {} has no budget left today", account_id);
                return Ok(Vec::new());
            }

            let candidates: Vec<(DbQueueItem, u32)> = {
                let sql = "SELECT q.id, q.prospect_id, q.campaign_id, q.account_id, q.sequence_index,
                        q.scheduled_for, q.status, q.attempts, q.claimed_at, q.reserved_on,
                        q.sent_at, q.error_message, c.daily_message_limit
                     FROM send_queue q
                     JOIN campaigns c ON c.id = q.campaign_id
                     WHERE q.account_id = ?1 AND q.status = ?2 AND q.scheduled_for <= ?3
                       AND c.status = ?4
                     ORDER BY q.scheduled_for ASC, q.rowid ASC";
                let mut stmt = tx.conn.prepare(sql)?;
                let rows = stmt.query_map(
                    params![
                        account_id,
                        QueueItemStatus::Pending,
                        db_ts(now),
                        CampaignStatus::Active
                    ],
                    |row| Ok((Self::map_queue_row(row)?, row.get::<_, u32>(12)?)),
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };

            let today_text = db_date(today);
            let claimed_at = db_ts(now);
            let mut campaign_used: HashMap<String, u32> = HashMap::new();
            let mut claimed = Vec::new();

            for (mut item, campaign_limit) in candidates {
                if claimed.len() as u32 >= budget {
                    break;
                }

                let used = match campaign_used.get(&item.campaign_id) {
                    Some(used) => *used,
                    None => tx.conn.query_row(
                        "SELECT COUNT(*) FROM send_queue
                         WHERE campaign_id = ?1 AND reserved_on = ?2
                           AND status IN ('claimed', 'sent')",
                        params![item.campaign_id, today_text],
                        |row| row.get::<_, u32>(0),
                    )?,
                };
                if used >= campaign_limit {
                    campaign_used.insert(item.campaign_id.clone(), used);
                    continue;
                }

                let changed = tx.conn.execute(
                    "UPDATE send_queue
                     SET status = ?1, claimed_at = ?2, reserved_on = ?3, updated_at = ?2
                     WHERE id = ?4 AND status = ?5",
                    params![
                        QueueItemStatus::Claimed,
                        claimed_at,
                        today_text,
                        item.id,
                        QueueItemStatus::Pending
                    ],
                )?;
                if changed == 0 {
                    continue;
                }

                campaign_used.insert(item.campaign_id.clone(), used + 1);
                item.status = QueueItemStatus::Claimed;
                item.claimed_at = Some(now);
                item.reserved_on = Some(today);
                claimed.push(item);
            }

            if !claimed.is_empty() {
                tx.reserve_budget(account_id, claimed.len() as u32)?;
                log::info!(
                    "SendQueue: claimed {} item(s) for account {} ({} budget left)",
                    claimed.len(),
                    account_id,
                    account.remaining_budget() - claimed.len() as u32
                );
            }
            Ok(claimed)
        })
    }

    /// `claimed` -> `sent`. The reservation made at claim time becomes the
    /// counted send.
    pub fn mark_sent(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE send_queue
             SET status = ?1, sent_at = ?2, error_message = NULL, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                QueueItemStatus::Sent,
                db_ts(at),
                db_ts(Utc::now()),
                id,
                QueueItemStatus::Claimed
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record a failed dispatch of a claimed item.
    ///
    /// Transient failures go back to `pending` after `policy.backoff` until
    /// `policy.max_attempts` is reached; anything else fails the item and its
    /// prospect. The claim's budget reservation is released once, by whichever
    /// call moves the item out of `claimed`; a second call is a no-op.
    pub fn mark_failed(
        &self,
        item: &DbQueueItem,
        reason: &str,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, DbError> {
        self.with_transaction(|tx| {
            let attempts = item.attempts + 1;

            if kind == FailureKind::Transient && attempts < policy.max_attempts {
                let next_at = now + policy.backoff(attempts);
                let changed = tx.conn.execute(
                    "UPDATE send_queue
                     SET status = ?1, attempts = ?2, scheduled_for = ?3, claimed_at = NULL,
                         reserved_on = NULL, error_message = ?4, updated_at = ?5
                     WHERE id = ?6 AND status = ?7",
                    params![
                        QueueItemStatus::Pending,
                        attempts,
                        db_ts(next_at),
                        reason,
                        db_ts(Utc::now()),
                        item.id,
                        QueueItemStatus::Claimed
                    ],
                )?;
                if changed == 0 {
                    return Ok(FailureOutcome::NotClaimed);
                }
                tx.release_reservation(&item.account_id, item.reserved_on)?;
                log::warn!(
                    "SendQueue: item {} attempt {} failed ({}), retrying at {}",
                    item.id,
                    attempts,
                    reason,
                    next_at
                );
                return Ok(FailureOutcome::Rescheduled { attempts, next_at });
            }

            let reason = if kind == FailureKind::Transient {
                format!("{} (gave up after {} attempts)", reason, attempts)
            } else {
                reason.to_string()
            };
            let changed = tx.conn.execute(
                "UPDATE send_queue
                 SET status = ?1, attempts = ?2, error_message = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = ?6",
                params![
                    QueueItemStatus::Failed,
                    attempts,
                    reason,
                    db_ts(Utc::now()),
                    item.id,
                    QueueItemStatus::Claimed
                ],
            )?;
            if changed == 0 {
                return Ok(FailureOutcome::NotClaimed);
            }
            tx.release_reservation(&item.account_id, item.reserved_on)?;
            tx.mark_prospect_failed(&item.prospect_id, &reason)?;
            Ok(FailureOutcome::Failed)
        })
    }

    /// Fail a claimed item without sending and without touching its prospect.
    /// Returns false, releasing nothing, when the item was no longer claimed.
    pub fn cancel_claimed(&self, item: &DbQueueItem, reason: &str) -> Result<bool, DbError> {
        self.with_transaction(|tx| {
            let changed = tx.conn.execute(
                "UPDATE send_queue SET status = ?1, error_message = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    QueueItemStatus::Failed,
                    reason,
                    db_ts(Utc::now()),
                    item.id,
                    QueueItemStatus::Claimed
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.release_reservation(&item.account_id, item.reserved_on)?;
            log::info!("SendQueue: cancelled item {}: {}", item.id, reason);
            Ok(true)
        })
    }

    /// Return items claimed before `cutoff` to `pending`, releasing their
    /// reservations. Returns how many were recovered.
    pub fn recover_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        self.with_transaction(|tx| {
            let stale: Vec<DbQueueItem> = {
                let sql = format!(
                    "SELECT {QUEUE_COLUMNS} FROM send_queue
                     WHERE status = ?1 AND claimed_at < ?2"
                );
                let mut stmt = tx.conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![QueueItemStatus::Claimed, db_ts(cutoff)],
                    Self::map_queue_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };

            for item in &stale {
                tx.release_reservation(&item.account_id, item.reserved_on)?;
                tx.conn.execute(
                    "UPDATE send_queue
                     SET status = ?1, claimed_at = NULL, reserved_on = NULL, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![
                        QueueItemStatus::Pending,
                        db_ts(Utc::now()),
                        item.id,
                        QueueItemStatus::Claimed
                    ],
                )?;
                log::warn!(
                    "SendQueue: recovered stale claim {} (claimed at {:?})",
                    item.id,
                    item.claimed_at
                );
            }
            Ok(stale.len())
        })
    }

    pub fn queue_stats(&self, campaign_id: &str) -> Result<QueueStats, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM send_queue WHERE campaign_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![campaign_id], |row| {
            Ok((row.get::<_, QueueItemStatus>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match status {
                QueueItemStatus::Pending => stats.pending = count,
                QueueItemStatus::Claimed => stats.claimed = count,
                QueueItemStatus::Sent => stats.sent = count,
                QueueItemStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}
