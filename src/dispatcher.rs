//! Dispatcher: claims due queue items per account and sends them.
//!
//! Each tick, for every active account with an active campaign:
//! skip it if its identity is unusable, claim due items within the daily
//! budget, render and validate each one, send through the account's pinned
//! identity, then record the outcome. Failures are recorded on the item and
//! prospect; nothing is propagated to a caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::{DbCampaign, DbError, DbQueueItem, FailureOutcome, OutreachDb};
use crate::error::{DispatchError, EngineError, FailureKind};
use crate::follow_up;
use crate::identity::SendingIdentity;
use crate::renderer;
use crate::state::EngineState;
use crate::types::{Config, MessageKind, ProspectStatus};

/// Counts for one Dispatcher tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped_accounts: usize,
    pub recovered_claims: usize,
}

/// Result of preparing one claimed item.
enum Prepared {
    Ready {
        campaign: DbCampaign,
        kind: MessageKind,
        target: String,
        text: String,
    },
    Cancelled,
    Failed(FailureOutcome),
}

enum ItemOutcome {
    Sent,
    Retried,
    Failed,
    Cancelled,
    /// Another path already moved the item out of `claimed`.
    Stale,
}

impl From<FailureOutcome> for ItemOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Rescheduled { .. } => ItemOutcome::Retried,
            FailureOutcome::Failed => ItemOutcome::Failed,
            FailureOutcome::NotClaimed => ItemOutcome::Stale,
        }
    }
}

fn fail_item(
    db: &OutreachDb,
    config: &Config,
    item: &DbQueueItem,
    error: &DispatchError,
    now: DateTime<Utc>,
) -> Result<FailureOutcome, DbError> {
    db.mark_failed(
        item,
        &error.to_string(),
        error.failure_kind(),
        &config.retry,
        now,
    )
}

/// Load, check, render and validate a claimed item. Everything that can be
/// decided without the platform is decided here.
fn prepare_item(
    db: &OutreachDb,
    config: &Config,
    item: &DbQueueItem,
    now: DateTime<Utc>,
) -> Result<Prepared, DbError> {
    let prospect = db.get_prospect(&item.prospect_id)?;
    let campaign = db.get_campaign(&item.campaign_id)?;
    let kind = MessageKind::for_sequence_index(item.sequence_index);

    let cancel_reason = if prospect.status.is_terminal() {
        Some(format!("prospect is already {}", prospect.status))
    } else if kind == MessageKind::FollowUp && prospect.status != ProspectStatus::Connected {
        Some(format!("follow-up for prospect in status {}", prospect.status))
    } else {
        None
    };
    if let Some(reason) = cancel_reason {
        return Ok(if db.cancel_claimed(item, &reason)? {
            Prepared::Cancelled
        } else {
            Prepared::Failed(FailureOutcome::NotClaimed)
        });
    }

    let Some(step) = campaign.message_sequence.get(item.sequence_index as usize) else {
        let error = DispatchError::MissingStep(item.sequence_index);
        return Ok(Prepared::Failed(fail_item(db, config, item, &error, now)?));
    };

    let Some(target) = prospect.target_handle() else {
        let outcome = fail_item(db, config, item, &DispatchError::MissingTarget, now)?;
        return Ok(Prepared::Failed(outcome));
    };

    let text = match renderer::render(&step.template, &prospect, kind, &config.limits) {
        Ok(text) => text,
        Err(validation) => {
            log::warn!(
                "Dispatcher: item {} failed validation: {}",
                item.id,
                validation
            );
            let error = DispatchError::Validation(validation);
            return Ok(Prepared::Failed(fail_item(db, config, item, &error, now)?));
        }
    };

    Ok(Prepared::Ready {
        campaign,
        kind,
        target,
        text,
    })
}

/// Record a delivered item and advance the prospect.
fn record_sent(
    db: &OutreachDb,
    item: &DbQueueItem,
    campaign: &DbCampaign,
    kind: MessageKind,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    db.with_transaction(|tx| {
        tx.mark_sent(&item.id, now)?;
        match kind {
            MessageKind::Invite => {
                tx.mark_invite_sent(&item.prospect_id, now)?;
            }
            MessageKind::FollowUp => {
                tx.advance_sequence_index(&item.prospect_id, item.sequence_index)?;
                let prospect = tx.get_prospect(&item.prospect_id)?;
                follow_up::schedule_next(tx, &prospect, campaign, now)?;
            }
        }
        Ok(())
    })
}

async fn dispatch_item(
    state: &EngineState,
    identity: &SendingIdentity,
    item: &DbQueueItem,
    now: DateTime<Utc>,
) -> Result<ItemOutcome, DbError> {
    let prepared = prepare_item(&state.db.lock(), &state.config, item, now)?;
    let (campaign, kind, target, text) = match prepared {
        Prepared::Ready {
            campaign,
            kind,
            target,
            text,
        } => (campaign, kind, target, text),
        Prepared::Cancelled => return Ok(ItemOutcome::Cancelled),
        Prepared::Failed(outcome) => return Ok(outcome.into()),
    };

    log::debug!(
        "Dispatcher: sending {} for item {} to {}",
        kind,
        item.id,
        target
    );
    let result = state.platform.send(identity, kind, &target, &text).await;

    let db = state.db.lock();
    match result {
        Ok(()) => {
            if let Err(e) = record_sent(&db, item, &campaign, kind, now) {
                // Delivered: the item must never return to pending.
                log::error!(
                    "Dispatcher: item {} was delivered but could not be recorded: {}",
                    item.id,
                    e
                );
                db.mark_sent(&item.id, now)?;
                db.mark_prospect_failed(
                    &item.prospect_id,
                    &format!("Message delivered but recording failed: {}", e),
                )?;
                return Ok(ItemOutcome::Sent);
            }
            log::info!(
                "Dispatcher: sent {} to prospect {} (item {})",
                kind,
                item.prospect_id,
                item.id
            );
            Ok(ItemOutcome::Sent)
        }
        Err(error) => {
            let transient = error.failure_kind() == FailureKind::Transient;
            log::warn!(
                "Dispatcher: {} failure for item {}: {}",
                if transient { "transient" } else { "terminal" },
                item.id,
                error
            );
            Ok(fail_item(&db, &state.config, item, &error, now)?.into())
        }
    }
}

/// One Dispatcher pass at `now`.
pub async fn run_tick(state: &EngineState, now: DateTime<Utc>) -> Result<DispatchSummary, EngineError> {
    let mut summary = DispatchSummary::default();

    if let Some(window) = &state.send_window {
        if !window.allows(now) {
            log::debug!("Dispatcher: outside send window, skipping tick");
            return Ok(summary);
        }
    }

    let stale_claim_minutes = state.config.dispatcher.stale_claim_minutes;
    let cutoff = chrono::Duration::try_minutes(stale_claim_minutes)
        .and_then(|d| now.checked_sub_signed(d))
        .ok_or_else(|| {
            EngineError::Config(format!("Invalid stale claim timeout: {} minutes", stale_claim_minutes))
        })?;
    let accounts = {
        let db = state.db.lock();
        summary.recovered_claims = db.recover_stale_claims(cutoff)?;
        db.list_dispatchable_accounts()?
    };

    for account in accounts {
        let identity = match SendingIdentity::from_account(&account) {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Dispatcher: skipping account {}: {}", account.id, e);
                summary.skipped_accounts += 1;
                continue;
            }
        };

        let claimed = state.db.lock().claim_due(
            &account.id,
            now,
            state.config.dispatcher.max_claim_per_tick,
        )?;
        summary.claimed += claimed.len();

        for item in &claimed {
            match dispatch_item(state, &identity, item, now).await {
                Ok(ItemOutcome::Sent) => summary.sent += 1,
                Ok(ItemOutcome::Retried) => summary.retried += 1,
                Ok(ItemOutcome::Failed) => summary.failed += 1,
                Ok(ItemOutcome::Cancelled) => summary.cancelled += 1,
                Ok(ItemOutcome::Stale) => {
                    log::debug!("Dispatcher: item {} was no longer claimed", item.id);
                }
                Err(e) => {
                    // Left claimed; stale-claim recovery returns it to pending.
                    log::error!("Dispatcher: could not record item {}: {}", item.id, e);
                }
            }
        }
    }

    Ok(summary)
}

pub async fn run_dispatcher(state: Arc<EngineState>) {
    let interval = Duration::from_secs(state.config.dispatcher.tick_secs.max(1));
    log::info!("Dispatcher: started (tick every {}s)", interval.as_secs());

    loop {
        match run_tick(&state, Utc::now()).await {
            Ok(summary) if summary.claimed > 0 || summary.recovered_claims > 0 => {
                log::info!(
                    "Dispatcher: tick done: {} claimed, {} sent, {} retried, {} failed, {} cancelled",
                    summary.claimed,
                    summary.sent,
                    summary.retried,
                    summary.failed,
                    summary.cancelled
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("Dispatcher: tick failed: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = state.dispatcher_wake.notified() => {
                log::debug!("Dispatcher: woken early");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptance_poller;
    use crate::db::test_utils::*;
    use crate::db::{DbSendingAccount, NewProspect};
    use crate::platform::fake::{FakeCall, FakePlatform};
    use crate::types::{CampaignStatus, ConnectivityStatus, InvitationStatus, QueueItemStatus};
    use chrono::Duration as ChronoDuration;

    struct Harness {
        state: EngineState,
        platform: Arc<FakePlatform>,
        account: DbSendingAccount,
        campaign: DbCampaign,
    }

    fn harness(daily_limit: u32) -> Harness {
        let db = test_db();
        let account = seed_account(&db, daily_limit);
        let campaign = seed_campaign(&db, &account.id, two_step_sequence(), 50);
        let platform = Arc::new(FakePlatform::new());
        let state = EngineState::new(Config::default(), db, platform.clone()).unwrap();
        Harness {
            state,
            platform,
            account,
            campaign,
        }
    }

    fn activate(h: &Harness, now: DateTime<Utc>) {
        follow_up::activate_campaign(&h.state.db.lock(), &h.campaign.id, now, ChronoDuration::zero())
            .unwrap();
    }

    #[tokio::test]
    async fn test_invite_then_follow_up_scenario() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada-lovelace");
        let now = monday_morning();
        activate(&h, now);

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.sent, 1);
        {
            let db = h.state.db.lock();
            let p = db.get_prospect(&prospect.id).unwrap();
            assert_eq!(p.status, ProspectStatus::InviteSent);
            assert_eq!(p.contacted_at, Some(now));
            let items = db.queue_items_for_prospect(&prospect.id).unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].status, QueueItemStatus::Sent);
        }
        let sends = h.platform.sends();
        assert_eq!(
            sends,
            vec![(
                MessageKind::Invite,
                "ada-lovelace".to_string(),
                "Hi Ada, let's connect!".to_string()
            )]
        );

        let accepted_at = now + ChronoDuration::hours(3);
        h.platform
            .set_invitation_status("ada-lovelace", InvitationStatus::Accepted);
        acceptance_poller::run_tick(&h.state, accepted_at).await.unwrap();

        let db = h.state.db.lock();
        let p = db.get_prospect(&prospect.id).unwrap();
        assert_eq!(p.status, ProspectStatus::Connected);
        let due = accepted_at + ChronoDuration::days(1);
        assert_eq!(p.follow_up_due_at, Some(due));
        let pending: Vec<_> = db
            .queue_items_for_prospect(&prospect.id)
            .unwrap()
            .into_iter()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence_index, 1);
        assert_eq!(pending[0].scheduled_for, due);
    }

    #[tokio::test]
    async fn test_last_follow_up_completes_prospect() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        run_tick(&h.state, now).await.unwrap();

        let accepted_at = now + ChronoDuration::hours(1);
        h.platform.set_invitation_status("ada", InvitationStatus::Accepted);
        acceptance_poller::run_tick(&h.state, accepted_at).await.unwrap();

        let follow_up_at = accepted_at + ChronoDuration::days(1);
        let summary = run_tick(&h.state, follow_up_at).await.unwrap();
        assert_eq!(summary.sent, 1);

        let db = h.state.db.lock();
        let p = db.get_prospect(&prospect.id).unwrap();
        assert_eq!(p.status, ProspectStatus::Completed);
        assert_eq!(p.follow_up_sequence_index, 1);
        assert_eq!(
            h.platform.sends()[1],
            (
                MessageKind::FollowUp,
                "ada".to_string(),
                "Thanks for connecting, Ada. How are things at Analytical Engines?".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_over_limit_title_fails_without_send() {
        let h = harness(10);
        let prospect = {
            let db = h.state.db.lock();
            let campaign = db
                .insert_campaign(&crate::db::NewCampaign {
                    workspace_id: "ws-1".to_string(),
                    name: "Long titles".to_string(),
                    account_id: h.account.id.clone(),
                    message_sequence: vec![crate::types::SequenceStep::new(
                        "Hi {first_name}, {title}",
                        Default::default(),
                    )],
                    daily_message_limit: 10,
                })
                .unwrap();
            let prospect = db
                .insert_prospect(
                    &campaign.id,
                    &NewProspect {
                        first_name: "Alexandra".to_string(),
                        title: Some("t".repeat(290)),
                        platform_handle: Some("alex".to_string()),
                        ..NewProspect::default()
                    },
                )
                .unwrap();
            follow_up::activate_campaign(&db, &campaign.id, monday_morning(), ChronoDuration::zero())
                .unwrap();
            prospect
        };

        let summary = run_tick(&h.state, monday_morning()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(h.platform.sends().is_empty());

        let db = h.state.db.lock();
        let p = db.get_prospect(&prospect.id).unwrap();
        assert_eq!(p.status, ProspectStatus::Failed);
        assert!(p.error_message.unwrap().contains("limit is 300"));
        let items = db.queue_items_for_prospect(&prospect.id).unwrap();
        assert_eq!(items[0].status, QueueItemStatus::Failed);
        assert_eq!(db.get_sending_account(&h.account.id).unwrap().daily_message_count, 0);
    }

    #[tokio::test]
    async fn test_rate_cap_defers_third_item_to_next_day() {
        let h = harness(2);
        let prospects: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|handle| seed_prospect(&h.state.db.lock(), &h.campaign.id, handle))
            .collect();
        let now = monday_morning();
        activate(&h, now);

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.sent, 2);
        {
            let db = h.state.db.lock();
            let third = db.queue_items_for_prospect(&prospects[2].id).unwrap();
            assert_eq!(third[0].status, QueueItemStatus::Pending);
            let account = db.get_sending_account(&h.account.id).unwrap();
            assert_eq!(account.daily_message_count, 2);
        }

        let later_today = now + ChronoDuration::hours(2);
        assert_eq!(run_tick(&h.state, later_today).await.unwrap().claimed, 0);

        let next_day = now + ChronoDuration::days(1);
        let summary = run_tick(&h.state, next_day).await.unwrap();
        assert_eq!(summary.sent, 1);
        let db = h.state.db.lock();
        assert_eq!(
            db.get_prospect(&prospects[2].id).unwrap().status,
            ProspectStatus::InviteSent
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_with_backoff() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        h.platform
            .push_send_result("ada", Err(DispatchError::RateLimited));

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.retried, 1);
        {
            let db = h.state.db.lock();
            let item = &db.queue_items_for_prospect(&prospect.id).unwrap()[0];
            assert_eq!(item.status, QueueItemStatus::Pending);
            assert_eq!(item.attempts, 1);
            assert_eq!(
                item.scheduled_for,
                now + h.state.config.retry.backoff(1)
            );
            assert_eq!(
                db.get_prospect(&prospect.id).unwrap().status,
                ProspectStatus::Queued
            );
        }

        let retry_at = now + h.state.config.retry.backoff(1);
        let summary = run_tick(&h.state, retry_at).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(h.platform.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_fails_prospect() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        h.platform.push_send_result(
            "ada",
            Err(DispatchError::InvalidTarget("no such member".to_string())),
        );

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.failed, 1);
        let db = h.state.db.lock();
        let p = db.get_prospect(&prospect.id).unwrap();
        assert_eq!(p.status, ProspectStatus::Failed);
        assert!(p.error_message.unwrap().contains("no such member"));
    }

    #[tokio::test]
    async fn test_unusable_identity_skips_account() {
        let h = harness(10);
        seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        h.state
            .db
            .lock()
            .conn_ref()
            .execute(
                "UPDATE sending_accounts SET connectivity_status = ?1 WHERE id = ?2",
                rusqlite::params![ConnectivityStatus::Disconnected, h.account.id],
            )
            .unwrap();

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.skipped_accounts, 1);
        assert_eq!(summary.claimed, 0);
        assert!(h.platform.sends().is_empty());
    }

    #[tokio::test]
    async fn test_paused_campaign_stops_claiming() {
        let h = harness(10);
        seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        follow_up::pause_campaign(&h.state.db.lock(), &h.campaign.id).unwrap();

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.claimed, 0);
        assert!(h.platform.sends().is_empty());
        assert_eq!(
            h.state.db.lock().get_campaign(&h.campaign.id).unwrap().status,
            CampaignStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_claimed_item_finishes_after_pause() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        let item = h
            .state
            .db
            .lock()
            .claim_due(&h.account.id, now, 10)
            .unwrap()
            .remove(0);
        follow_up::pause_campaign(&h.state.db.lock(), &h.campaign.id).unwrap();

        let identity = SendingIdentity::from_account(&h.account).unwrap();
        let outcome = dispatch_item(&h.state, &identity, &item, now).await.unwrap();
        assert!(matches!(outcome, ItemOutcome::Sent));
        assert_eq!(h.platform.sends().len(), 1);

        let db = h.state.db.lock();
        assert_eq!(db.get_queue_item(&item.id).unwrap().status, QueueItemStatus::Sent);
        assert_eq!(
            db.get_prospect(&prospect.id).unwrap().status,
            ProspectStatus::InviteSent
        );
        assert_eq!(
            db.get_campaign(&h.campaign.id).unwrap().status,
            CampaignStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_delivered_item_is_never_resent_when_recording_fails() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        h.state
            .db
            .lock()
            .conn_ref()
            .execute_batch(
                "CREATE TRIGGER block_invite_sent BEFORE UPDATE OF status ON prospects
                 WHEN NEW.status = 'invite_sent'
                 BEGIN SELECT RAISE(ABORT, 'recording unavailable'); END;",
            )
            .unwrap();

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.sent, 1);
        {
            let db = h.state.db.lock();
            let items = db.queue_items_for_prospect(&prospect.id).unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].status, QueueItemStatus::Sent);
            let p = db.get_prospect(&prospect.id).unwrap();
            assert_eq!(p.status, ProspectStatus::Failed);
            assert!(p.error_message.unwrap().contains("delivered"));
            assert_eq!(db.get_sending_account(&h.account.id).unwrap().daily_message_count, 1);
        }

        // Well past the stale-claim cutoff: nothing to recover, nothing re-sent.
        let later = now + ChronoDuration::hours(2);
        let summary = run_tick(&h.state, later).await.unwrap();
        assert_eq!(summary.recovered_claims, 0);
        assert_eq!(summary.claimed, 0);
        assert_eq!(h.platform.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_stale_claim_timeout_is_a_config_error() {
        let db = test_db();
        let config = Config {
            dispatcher: crate::types::DispatcherConfig {
                stale_claim_minutes: i64::MAX,
                ..Default::default()
            },
            ..Config::default()
        };
        let state = EngineState::new(config, db, Arc::new(FakePlatform::new())).unwrap();
        let result = run_tick(&state, monday_morning()).await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_sends_use_pinned_identity() {
        let h = harness(10);
        seed_prospect(&h.state.db.lock(), &h.campaign.id, "a");
        seed_prospect(&h.state.db.lock(), &h.campaign.id, "b");
        let now = monday_morning();
        activate(&h, now);
        run_tick(&h.state, now).await.unwrap();

        let identities: Vec<_> = h
            .platform
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Send { identity, .. } => Some(identity),
                _ => None,
            })
            .collect();
        assert_eq!(identities.len(), 2);
        for identity in identities {
            assert_eq!(identity.egress.session_id, "sess-1");
            assert_eq!(identity.egress.country, "us");
            assert_eq!(identity.platform_account_id, "plat-acct-1");
        }
    }

    #[tokio::test]
    async fn test_item_for_replied_prospect_is_cancelled() {
        let h = harness(10);
        let prospect = seed_prospect(&h.state.db.lock(), &h.campaign.id, "ada");
        let now = monday_morning();
        activate(&h, now);
        h.state.db.lock().mark_replied(&prospect.id, now).unwrap();

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert!(h.platform.sends().is_empty());
        let db = h.state.db.lock();
        assert_eq!(
            db.get_prospect(&prospect.id).unwrap().status,
            ProspectStatus::Replied
        );
        assert_eq!(db.get_sending_account(&h.account.id).unwrap().daily_message_count, 0);
    }

    #[tokio::test]
    async fn test_prospect_without_target_fails() {
        let h = harness(10);
        let prospect = h
            .state
            .db
            .lock()
            .insert_prospect(
                &h.campaign.id,
                &NewProspect {
                    first_name: "Mail".to_string(),
                    email: Some("mail@example.com".to_string()),
                    ..NewProspect::default()
                },
            )
            .unwrap();
        let now = monday_morning();
        activate(&h, now);

        let summary = run_tick(&h.state, now).await.unwrap();
        assert_eq!(summary.failed, 1);
        let p = h.state.db.lock().get_prospect(&prospect.id).unwrap();
        assert_eq!(p.status, ProspectStatus::Failed);
    }

    #[tokio::test]
    async fn test_send_window_blocks_claims() {
        let db = test_db();
        let account = seed_account(&db, 10);
        let campaign = seed_campaign(&db, &account.id, two_step_sequence(), 10);
        seed_prospect(&db, &campaign.id, "ada");
        let config = Config {
            send_window: Some(crate::types::SendWindowConfig {
                timezone: "UTC".to_string(),
                start_hour: 10,
                end_hour: 17,
                ..Default::default()
            }),
            ..Config::default()
        };
        let platform = Arc::new(FakePlatform::new());
        let state = EngineState::new(config, db, platform.clone()).unwrap();
        let now = monday_morning();
        follow_up::activate_campaign(&state.db.lock(), &campaign.id, now, ChronoDuration::zero())
            .unwrap();

        // 09:00 UTC is before the window opens.
        assert_eq!(run_tick(&state, now).await.unwrap().claimed, 0);
        let open = now + ChronoDuration::hours(1);
        assert_eq!(run_tick(&state, open).await.unwrap().sent, 1);
        assert_eq!(platform.sends().len(), 1);
    }
}
