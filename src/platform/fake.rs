//! Scripted in-memory platform for worker tests.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::PlatformClient;
use crate::error::DispatchError;
use crate::identity::SendingIdentity;
use crate::types::{InvitationStatus, MessageKind};

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Send {
        identity: SendingIdentity,
        kind: MessageKind,
        target: String,
        text: String,
    },
    Status {
        identity: SendingIdentity,
        target: String,
    },
    Withdraw {
        identity: SendingIdentity,
        target: String,
    },
    Replied {
        identity: SendingIdentity,
        target: String,
    },
}

#[derive(Default)]
struct Script {
    send_results: HashMap<String, VecDeque<Result<(), DispatchError>>>,
    statuses: HashMap<String, Result<InvitationStatus, DispatchError>>,
    replied: HashSet<String>,
    calls: Vec<FakeCall>,
}

/// Sends succeed and invitations stay pending unless scripted otherwise.
#[derive(Default)]
pub struct FakePlatform {
    script: Mutex<Script>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next send to `target`.
    pub fn push_send_result(&self, target: &str, result: Result<(), DispatchError>) {
        self.script
            .lock()
            .send_results
            .entry(target.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_invitation_status(&self, target: &str, status: InvitationStatus) {
        self.script
            .lock()
            .statuses
            .insert(target.to_string(), Ok(status));
    }

    pub fn fail_status_check(&self, target: &str, error: DispatchError) {
        self.script
            .lock()
            .statuses
            .insert(target.to_string(), Err(error));
    }

    pub fn set_replied(&self, target: &str) {
        self.script.lock().replied.insert(target.to_string());
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.script.lock().calls.clone()
    }

    /// Sends actually attempted, as `(kind, target, text)`.
    pub fn sends(&self) -> Vec<(MessageKind, String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Send {
                    kind, target, text, ..
                } => Some((kind, target, text)),
                _ => None,
            })
            .collect()
    }

    pub fn withdrawals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Withdraw { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn send(
        &self,
        identity: &SendingIdentity,
        kind: MessageKind,
        target: &str,
        text: &str,
    ) -> Result<(), DispatchError> {
        let mut script = self.script.lock();
        script.calls.push(FakeCall::Send {
            identity: identity.clone(),
            kind,
            target: target.to_string(),
            text: text.to_string(),
        });
        script
            .send_results
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }

    async fn get_invitation_status(
        &self,
        identity: &SendingIdentity,
        target: &str,
    ) -> Result<InvitationStatus, DispatchError> {
        let mut script = self.script.lock();
        script.calls.push(FakeCall::Status {
            identity: identity.clone(),
            target: target.to_string(),
        });
        script
            .statuses
            .get(target)
            .cloned()
            .unwrap_or(Ok(InvitationStatus::Pending))
    }

    async fn withdraw_invitation(
        &self,
        identity: &SendingIdentity,
        target: &str,
    ) -> Result<(), DispatchError> {
        let mut script = self.script.lock();
        script.calls.push(FakeCall::Withdraw {
            identity: identity.clone(),
            target: target.to_string(),
        });
        script
            .statuses
            .insert(target.to_string(), Ok(InvitationStatus::Withdrawn));
        Ok(())
    }

    async fn has_replied(
        &self,
        identity: &SendingIdentity,
        target: &str,
        _since: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let mut script = self.script.lock();
        script.calls.push(FakeCall::Replied {
            identity: identity.clone(),
            target: target.to_string(),
        });
        Ok(script.replied.contains(target))
    }
}
