//! Message Renderer.
//!
//! Personalizes a sequence template for one prospect and validates the
//! rendered text against the platform's per-kind character limit. Limits are
//! always checked on the final string: a short template with a long field
//! value can still overflow.
//!
//! Template syntax:
//! - `{first_name}` style placeholders (see `field_value` for the full list);
//!   absent optional fields render as an empty string, unknown names fail.
//! - `{Hi|Hello|Hey}` spintax; one alternative is chosen per prospect and
//!   the choice is stable across re-renders.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::DbProspect;
use crate::types::{MessageKind, PlatformLimits};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("rendered {kind} is {length} characters, limit is {limit}")]
    TooLong {
        length: usize,
        limit: usize,
        kind: MessageKind,
    },

    #[error("rendered message is empty")]
    Empty,

    #[error("unknown placeholder {{{0}}}")]
    UnresolvedPlaceholder(String),
}

fn re_brace_group() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]*)\}").unwrap())
}

/// Value for a placeholder name, `None` when the name is not recognised.
fn field_value(prospect: &DbProspect, name: &str) -> Option<String> {
    let opt = |v: &Option<String>| v.as_deref().unwrap_or("").trim().to_string();
    let value = match name {
        "first_name" => prospect.first_name.trim().to_string(),
        "last_name" => opt(&prospect.last_name),
        "full_name" => prospect.full_name(),
        "company_name" | "company" => opt(&prospect.company_name),
        "title" | "job_title" => opt(&prospect.title),
        "industry" => opt(&prospect.industry),
        "location" => opt(&prospect.location),
        _ => return None,
    };
    Some(value)
}

/// Deterministic pick among `n` alternatives for this prospect and position.
fn choose_variant(prospect_id: &str, position: usize, n: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(prospect_id.as_bytes());
    hasher.update(b":");
    hasher.update(position.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(bytes) % n as u64) as usize
}

/// Resolve spintax and placeholders. No length check.
pub fn substitute(template: &str, prospect: &DbProspect) -> Result<String, ValidationError> {
    let mut unresolved: Option<String> = None;
    let mut position = 0usize;

    let text = re_brace_group().replace_all(template, |caps: &Captures<'_>| {
        let inner = &caps[1];
        if inner.contains('|') {
            let options: Vec<&str> = inner.split('|').collect();
            let pick = choose_variant(&prospect.id, position, options.len());
            position += 1;
            return options[pick].to_string();
        }

        let name = inner.trim().to_ascii_lowercase();
        match field_value(prospect, &name) {
            Some(value) => value,
            None => {
                unresolved.get_or_insert(inner.trim().to_string());
                String::new()
            }
        }
    });

    match unresolved {
        Some(name) => Err(ValidationError::UnresolvedPlaceholder(name)),
        None => Ok(text.trim().to_string()),
    }
}

/// Check rendered text against the hard limit for `kind`.
pub fn validate(
    text: &str,
    kind: MessageKind,
    limits: &PlatformLimits,
) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let length = text.chars().count();
    let limit = limits.max_chars(kind);
    if length > limit {
        return Err(ValidationError::TooLong {
            length,
            limit,
            kind,
        });
    }
    Ok(())
}

/// Personalize `template` for `prospect` and validate the result.
pub fn render(
    template: &str,
    prospect: &DbProspect,
    kind: MessageKind,
    limits: &PlatformLimits,
) -> Result<String, ValidationError> {
    let text = substitute(template, prospect)?;
    validate(&text, kind, limits)?;
    Ok(text)
}
