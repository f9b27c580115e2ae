//! Acceptance Poller.
//!
//! Reconciles the platform's view of each outstanding invitation with the
//! local prospect state. `reconcile` is pure and safe to apply any number of
//! times; the tick only performs what it decides. Also withdraws invitations
//! that stayed pending too long and detects replies from connected prospects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::{DbError, DbProspect, OutreachDb};
use crate::error::EngineError;
use crate::follow_up::{self, ScheduleOutcome};
use crate::identity::SendingIdentity;
use crate::state::EngineState;
use crate::types::{InvitationStatus, PollerConfig, ProspectStatus};

/// Local action implied by one invitation observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    NoChange,
    Accept,
    Fail(String),
    /// Pending for longer than the stale threshold.
    Withdraw,
}

/// Timing rules applied by `reconcile`.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Negative observations this soon after the invite are ignored.
    pub grace: chrono::Duration,
    pub stale_after: chrono::Duration,
}

pub fn reconcile(
    observed: InvitationStatus,
    prospect: &DbProspect,
    now: DateTime<Utc>,
    policy: PollPolicy,
) -> Reconciliation {
    if prospect.status != ProspectStatus::InviteSent {
        return Reconciliation::NoChange;
    }
    let age = prospect.contacted_at.map(|at| now - at);

    match observed {
        InvitationStatus::Accepted => Reconciliation::Accept,
        InvitationStatus::Withdrawn | InvitationStatus::Expired => {
            if age.map_or(false, |age| age < policy.grace) {
                return Reconciliation::NoChange;
            }
            let what = if observed == InvitationStatus::Expired {
                "expired"
            } else {
                "withdrawn or declined"
            };
            Reconciliation::Fail(format!("Invitation {}", what))
        }
        InvitationStatus::Pending => match age {
            Some(age) if age >= policy.stale_after => Reconciliation::Withdraw,
            _ => Reconciliation::NoChange,
        },
        InvitationStatus::Unknown => Reconciliation::NoChange,
    }
}

/// Apply an observed acceptance.
///
/// Returns `None` when the prospect was not awaiting acceptance, so
/// observing the same acceptance again changes nothing.
pub fn handle_accepted(
    db: &OutreachDb,
    prospect_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ScheduleOutcome>, DbError> {
    db.with_transaction(|tx| {
        if !tx.mark_connected(prospect_id, now)? {
            return Ok(None);
        }
        let prospect = tx.get_prospect(prospect_id)?;
        let campaign = tx.get_campaign(&prospect.campaign_id)?;
        log::info!("AcceptancePoller: prospect {} accepted", prospect_id);
        follow_up::schedule_next(tx, &prospect, &campaign, now).map(Some)
    })
}

/// Counts for one poller tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub accepted: usize,
    pub failed: usize,
    pub withdrawn: usize,
    pub replied: usize,
}

struct Outstanding {
    prospect: DbProspect,
    identity: SendingIdentity,
    target: String,
}

/// Pair prospects with their account's identity, dropping those that cannot
/// be checked right now.
fn resolve_identities(
    db: &OutreachDb,
    prospects: Vec<DbProspect>,
) -> Result<Vec<Outstanding>, DbError> {
    let mut by_campaign: HashMap<String, Option<SendingIdentity>> = HashMap::new();
    let mut out = Vec::with_capacity(prospects.len());

    for prospect in prospects {
        if !by_campaign.contains_key(&prospect.campaign_id) {
            let campaign = db.get_campaign(&prospect.campaign_id)?;
            let account = db.get_sending_account(&campaign.account_id)?;
            let identity = match SendingIdentity::from_account(&account) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    log::warn!(
                        "AcceptancePoller: skipping account {} for now: {}",
                        account.id,
                        e
                    );
                    None
                }
            };
            by_campaign.insert(prospect.campaign_id.clone(), identity);
        }

        let Some(Some(identity)) = by_campaign.get(&prospect.campaign_id) else {
            continue;
        };
        let Some(target) = prospect.target_handle() else {
            continue;
        };
        out.push(Outstanding {
            identity: identity.clone(),
            target,
            prospect,
        });
    }
    Ok(out)
}

/// Keyset cursor over every prospect in one status, read `batch_size` at a
/// time. The database lock is held only while a page is read.
struct StatusPages {
    status: ProspectStatus,
    batch_size: u32,
    after: Option<i64>,
}

impl StatusPages {
    fn new(status: ProspectStatus, batch_size: u32) -> Self {
        Self {
            status,
            batch_size: batch_size.max(1),
            after: Some(0),
        }
    }

    /// Next page, or `None` once every prospect has been visited.
    fn next_page(&mut self, state: &EngineState) -> Result<Option<Vec<Outstanding>>, DbError> {
        let Some(after) = self.after else {
            return Ok(None);
        };
        let db = state.db.lock();
        let rows = db.page_prospects_by_status(self.status, after, self.batch_size)?;
        self.after = match rows.last() {
            Some((rowid, _)) if rows.len() as u32 == self.batch_size => Some(*rowid),
            _ => None,
        };
        if rows.is_empty() {
            return Ok(None);
        }
        let prospects = rows.into_iter().map(|(_, prospect)| prospect).collect();
        resolve_identities(&db, prospects).map(Some)
    }
}

impl PollPolicy {
    pub fn from_config(config: &PollerConfig) -> Result<Self, EngineError> {
        let grace = chrono::Duration::try_hours(config.acceptance_grace_hours).ok_or_else(|| {
            EngineError::Config(format!(
                "Invalid acceptance grace: {} hours",
                config.acceptance_grace_hours
            ))
        })?;
        let stale_after = chrono::Duration::try_days(config.stale_invite_days).ok_or_else(|| {
            EngineError::Config(format!(
                "Invalid stale invite threshold: {} days",
                config.stale_invite_days
            ))
        })?;
        Ok(Self { grace, stale_after })
    }
}

/// One poller pass at `now`, covering every outstanding invitation.
pub async fn run_tick(state: &EngineState, now: DateTime<Utc>) -> Result<PollSummary, EngineError> {
    let config = &state.config.poller;
    let policy = PollPolicy::from_config(config)?;
    let mut summary = PollSummary::default();

    let mut withdrawals = 0u32;
    let mut pages = StatusPages::new(ProspectStatus::InviteSent, config.batch_size);
    while let Some(outstanding) = pages.next_page(state)? {
        for entry in &outstanding {
            check_invitation(state, entry, now, policy, &mut withdrawals, &mut summary).await?;
        }
    }

    if config.check_replies {
        summary.replied = check_replies(state, now).await?;
    }

    Ok(summary)
}

async fn check_invitation(
    state: &EngineState,
    entry: &Outstanding,
    now: DateTime<Utc>,
    policy: PollPolicy,
    withdrawals: &mut u32,
    summary: &mut PollSummary,
) -> Result<(), EngineError> {
    let config = &state.config.poller;
    summary.checked += 1;
    let observed = match state
        .platform
        .get_invitation_status(&entry.identity, &entry.target)
        .await
    {
        Ok(status) => status,
        Err(e) => {
            log::debug!(
                "AcceptancePoller: status unavailable for prospect {}: {}",
                entry.prospect.id,
                e
            );
            InvitationStatus::Unknown
        }
    };

    match reconcile(observed, &entry.prospect, now, policy) {
        Reconciliation::NoChange => {}
        Reconciliation::Accept => {
            if handle_accepted(&state.db.lock(), &entry.prospect.id, now)?.is_some() {
                summary.accepted += 1;
            }
        }
        Reconciliation::Fail(reason) => {
            if state.db.lock().mark_prospect_failed(&entry.prospect.id, &reason)? {
                summary.failed += 1;
            }
        }
        Reconciliation::Withdraw => {
            if *withdrawals >= config.max_withdrawals_per_run {
                return Ok(());
            }
            *withdrawals += 1;
            match state
                .platform
                .withdraw_invitation(&entry.identity, &entry.target)
                .await
            {
                Ok(()) => {
                    let reason = format!(
                        "Invitation withdrawn after {} days without acceptance",
                        config.stale_invite_days
                    );
                    if state.db.lock().mark_prospect_failed(&entry.prospect.id, &reason)? {
                        summary.withdrawn += 1;
                    }
                }
                Err(e) => log::warn!(
                    "AcceptancePoller: could not withdraw invitation for prospect {}: {}",
                    entry.prospect.id,
                    e
                ),
            }
        }
    }
    Ok(())
}

async fn check_replies(state: &EngineState, now: DateTime<Utc>) -> Result<usize, EngineError> {
    let mut replied = 0;
    let mut pages = StatusPages::new(ProspectStatus::Connected, state.config.poller.batch_size);
    while let Some(connected) = pages.next_page(state)? {
        for entry in &connected {
            let since = entry
                .prospect
                .connection_accepted_at
                .or(entry.prospect.contacted_at)
                .unwrap_or(now);
            match state
                .platform
                .has_replied(&entry.identity, &entry.target, since)
                .await
            {
                Ok(true) => {
                    if state.db.lock().mark_replied(&entry.prospect.id, now)? {
                        log::info!("AcceptancePoller: prospect {} replied", entry.prospect.id);
                        replied += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => log::debug!(
                    "AcceptancePoller: reply check failed for prospect {}: {}",
                    entry.prospect.id,
                    e
                ),
            }
        }
    }
    Ok(replied)
}

pub async fn run_acceptance_poller(state: Arc<EngineState>) {
    let interval = Duration::from_secs(state.config.poller.tick_secs.max(1));
    log::info!("AcceptancePoller: started (tick every {}s)", interval.as_secs());

    loop {
        match run_tick(&state, Utc::now()).await {
            Ok(summary) => {
                if summary.checked > 0 || summary.replied > 0 {
                    log::info!(
                        "AcceptancePoller: checked {}, {} accepted, {} failed, {} withdrawn, {} replied",
                        summary.checked,
                        summary.accepted,
                        summary.failed,
                        summary.withdrawn,
                        summary.replied
                    );
                }
            }
            Err(e) => log::warn!("AcceptancePoller: tick failed: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = state.poller_wake.notified() => {
                log::debug!("AcceptancePoller: woken early");
            },
        }
    }
}
