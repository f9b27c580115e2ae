//! External platform operations consumed by the engine.
//!
//! Every call carries the sending account's pinned `SendingIdentity`; the
//! implementation is responsible for routing it through that identity's
//! egress. The engine never talks HTTP directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DispatchError;
use crate::identity::SendingIdentity;
use crate::types::{InvitationStatus, MessageKind};

pub mod client;
#[cfg(test)]
pub mod fake;

pub use client::HttpPlatformClient;

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Deliver an invite or a follow-up message to `target`.
    async fn send(
        &self,
        identity: &SendingIdentity,
        kind: MessageKind,
        target: &str,
        text: &str,
    ) -> Result<(), DispatchError>;

    /// Current state of the invitation sent to `target`.
    async fn get_invitation_status(
        &self,
        identity: &SendingIdentity,
        target: &str,
    ) -> Result<InvitationStatus, DispatchError>;

    /// Withdraw a still-pending invitation.
    async fn withdraw_invitation(
        &self,
        identity: &SendingIdentity,
        target: &str,
    ) -> Result<(), DispatchError>;

    /// Whether `target` has sent the account a message after `since`.
    async fn has_replied(
        &self,
        identity: &SendingIdentity,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, DispatchError>;
}
