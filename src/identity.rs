//! Identity Registry contract.
//!
//! Each sending account has a pinned egress assignment (country, optional
//! state, session id) written out of band. The engine only reads it: every
//! platform call from an account carries the same `SendingIdentity`, and an
//! account whose assignment is missing or not connected is skipped.

use serde::Serialize;
use thiserror::Error;

use crate::db::DbSendingAccount;
use crate::types::ConnectivityStatus;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("egress assignment is {0}")]
    NotConnected(ConnectivityStatus),

    #[error("egress assignment has no {0}")]
    MissingAssignment(&'static str),
}

/// Pinned network origin of one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressAssignment {
    pub country: String,
    pub state: Option<String>,
    pub session_id: String,
}

/// Everything a platform call needs to act as one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendingIdentity {
    pub account_id: String,
    pub platform_account_id: String,
    pub egress: EgressAssignment,
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, IdentityError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(IdentityError::MissingAssignment(field))
}

impl SendingIdentity {
    /// Build the identity for `account`, or explain why it cannot send.
    pub fn from_account(account: &DbSendingAccount) -> Result<Self, IdentityError> {
        if account.connectivity_status != ConnectivityStatus::Connected {
            return Err(IdentityError::NotConnected(account.connectivity_status));
        }

        let egress = EgressAssignment {
            country: required(&account.egress_country, "country")?,
            state: account
                .egress_state
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            session_id: required(&account.egress_session_id, "session id")?,
        };

        Ok(Self {
            account_id: account.id.clone(),
            platform_account_id: account.platform_account_id.clone(),
            egress,
        })
    }

    /// Proxy username carrying the pinned location and sticky session.
    pub fn proxy_username(&self, prefix: &str) -> String {
        let mut username = format!("{}-country-{}", prefix, self.egress.country);
        if let Some(state) = &self.egress.state {
            username.push_str("-state-");
            username.push_str(state);
        }
        username.push_str("-session-");
        username.push_str(&self.egress.session_id);
        username
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> DbSendingAccount {
        DbSendingAccount {
            id: "acct-1".to_string(),
            workspace_id: "ws".to_string(),
            display_name: "Rep".to_string(),
            platform_account_id: "plat-1".to_string(),
            daily_message_count: 0,
            daily_message_limit: 20,
            last_reset_date: None,
            timezone: "UTC".to_string(),
            egress_country: Some("us".to_string()),
            egress_state: Some("ny".to_string()),
            egress_session_id: Some("s42".to_string()),
            connectivity_status: ConnectivityStatus::Connected,
            is_active: true,
        }
    }

    #[test]
    fn test_connected_account_yields_identity() {
        let identity = SendingIdentity::from_account(&account()).unwrap();
        assert_eq!(identity.egress.country, "us");
        assert_eq!(identity.egress.state.as_deref(), Some("ny"));
        assert_eq!(identity.platform_account_id, "plat-1");
    }

    #[test]
    fn test_unconnected_account_is_rejected() {
        let mut acct = account();
        acct.connectivity_status = ConnectivityStatus::Degraded;
        assert_eq!(
            SendingIdentity::from_account(&acct),
            Err(IdentityError::NotConnected(ConnectivityStatus::Degraded))
        );
    }

    #[test]
    fn test_missing_session_is_rejected() {
        let mut acct = account();
        acct.egress_session_id = Some("  ".to_string());
        assert_eq!(
            SendingIdentity::from_account(&acct),
            Err(IdentityError::MissingAssignment("session id"))
        );
    }

    #[test]
    fn test_proxy_username_pins_location_and_session() {
        let identity = SendingIdentity::from_account(&account()).unwrap();
        assert_eq!(
            identity.proxy_username("brd-customer-c1-zone-res"),
            "brd-customer-c1-zone-res-country-us-state-ny-session-s42"
        );

        let mut acct = account();
        acct.egress_state = None;
        let identity = SendingIdentity::from_account(&acct).unwrap();
        assert_eq!(identity.proxy_username("p"), "p-country-us-session-s42");
    }
}
