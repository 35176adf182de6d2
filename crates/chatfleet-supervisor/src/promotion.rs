// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity promotion: converting a temporary linking id into a
//! permanent one once the account authenticates.
//!
//! The directory move is modeled as a single tagged step guarded by a
//! precondition check, rather than procedural branching, so every
//! outcome is explicit and testable.

use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;

/// Outcome of moving a temporary instance directory to its permanent
/// location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The temporary directory was renamed to the permanent path.
    Renamed,
    /// Source and target coincide; nothing to move.
    AlreadyPermanent,
    /// The source was already gone; a fresh permanent directory was
    /// created (worker started from pre-existing credentials).
    Recreated,
}

/// Derive the permanent instance id from a resolved phone number.
///
/// Non-digits are stripped from the number; an 8-character uniqueness
/// token keeps ids distinct if the same account is ever relinked.
pub fn permanent_id_for(phone_number: &str) -> String {
    let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("wa-{}-{}", digits, &token[..8])
}

/// Move (or create) the permanent data directory.
///
/// The caller has already established that promotion may proceed, i.e.
/// a phone number was reported or the source directory exists. Absence
/// of both is a hard promotion failure and never reaches this function.
pub async fn promote_data_dir(temp_dir: &Path, permanent_dir: &Path) -> Result<PromotionOutcome> {
    if temp_dir == permanent_dir {
        return Ok(PromotionOutcome::AlreadyPermanent);
    }

    match tokio::fs::metadata(temp_dir).await {
        Ok(_) => {
            if let Some(parent) = permanent_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(temp_dir, permanent_dir).await?;
            info!(
                from = %temp_dir.display(),
                to = %permanent_dir.display(),
                "instance data directory promoted"
            );
            Ok(PromotionOutcome::Renamed)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                temp = %temp_dir.display(),
                "temporary directory missing at promotion, creating permanent directory"
            );
            tokio::fs::create_dir_all(permanent_dir).await?;
            Ok(PromotionOutcome::Recreated)
        }
        Err(e) => Err(e.into()),
    }
}
