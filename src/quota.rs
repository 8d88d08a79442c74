//! Per-address daily upload allowance with a cooldown between uploads.
//!
//! Records are reset lazily: a record whose `reset_date` is not today is
//! replaced with a fresh one the next time its address is looked up.

use crate::settings::{Limits, SettingsStore};
use crate::upload::UploadError;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientQuota {
    pub tokens_remaining: i64,
    pub last_upload: Option<DateTime<Utc>>,
    pub reset_date: NaiveDate,
}

impl ClientQuota {
    fn fresh(daily_tokens: i64, today: NaiveDate) -> Self {
        Self {
            tokens_remaining: daily_tokens,
            last_upload: None,
            reset_date: today,
        }
    }

    /// Whole seconds left before the next upload is allowed, rounded up so
    /// that zero means the cooldown has fully elapsed.
    pub fn cooldown_remaining(&self, window_secs: i64, now: DateTime<Utc>) -> i64 {
        let Some(last) = self.last_upload else {
            return 0;
        };
        let window_ms = window_secs.max(0).saturating_mul(1000);
        let elapsed_ms = (now - last).num_milliseconds().max(0);
        let remaining_ms = window_ms - elapsed_ms;
        if remaining_ms <= 0 {
            0
        } else {
            remaining_ms / 1000 + i64::from(remaining_ms % 1000 != 0)
        }
    }
}

/// Snapshot served by `/check_status` and the HTML pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub tokens_remaining: i64,
    pub cooldown_remaining: i64,
    pub can_upload: bool,
}

pub fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

pub struct QuotaTracker {
    settings: Arc<SettingsStore>,
    clients: Mutex<HashMap<String, ClientQuota>>,
}

impl QuotaTracker {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_init_client(&self, address: &str, now: DateTime<Utc>) -> ClientQuota {
        let limits = self.settings.limits().await;
        let mut clients = self.clients.lock().await;
        current_entry(&mut clients, address, &limits, now).clone()
    }

    pub async fn remaining_cooldown_secs(&self, address: &str, now: DateTime<Utc>) -> i64 {
        self.status(address, now).await.cooldown_remaining
    }

    pub async fn can_upload(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.status(address, now).await.can_upload
    }

    pub async fn status(&self, address: &str, now: DateTime<Utc>) -> QuotaStatus {
        let limits = self.settings.limits().await;
        let mut clients = self.clients.lock().await;
        let quota = current_entry(&mut clients, address, &limits, now);
        let cooldown_remaining = quota.cooldown_remaining(limits.window_secs, now);
        QuotaStatus {
            tokens_remaining: quota.tokens_remaining,
            cooldown_remaining,
            can_upload: quota.tokens_remaining > 0 && cooldown_remaining == 0,
        }
    }

    /// Cooldown is checked before the allowance, matching the order in which
    /// rejections are reported to callers.
    pub async fn check_eligibility(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        let limits = self.settings.limits().await;
        let mut clients = self.clients.lock().await;
        let quota = current_entry(&mut clients, address, &limits, now);
        let wait = quota.cooldown_remaining(limits.window_secs, now);
        if wait > 0 {
            return Err(UploadError::CooldownActive(wait));
        }
        if quota.tokens_remaining <= 0 {
            return Err(UploadError::QuotaExhausted);
        }
        Ok(())
    }

    /// Charges one token and starts the cooldown. Performs no validation.
    pub async fn record_upload(&self, address: &str, now: DateTime<Utc>) {
        let limits = self.settings.limits().await;
        let mut clients = self.clients.lock().await;
        let quota = current_entry(&mut clients, address, &limits, now);
        quota.last_upload = Some(now);
        quota.tokens_remaining -= 1;
        debug!(
            "Charged upload for {} ({} tokens left)",
            address, quota.tokens_remaining
        );
    }

    /// Drops every record that no longer applies to today. Returns how many were removed.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let today = local_date(now);
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, q| q.reset_date == today);
        before - clients.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }

    #[cfg(test)]
    async fn insert(&self, address: &str, quota: ClientQuota) {
        self.clients.lock().await.insert(address.to_string(), quota);
    }
}

fn current_entry<'a>(
    clients: &'a mut HashMap<String, ClientQuota>,
    address: &str,
    limits: &Limits,
    now: DateTime<Utc>,
) -> &'a mut ClientQuota {
    let today = local_date(now);
    let quota = clients
        .entry(address.to_string())
        .or_insert_with(|| ClientQuota::fresh(limits.daily_tokens, today));
    if quota.reset_date != today {
        *quota = ClientQuota::fresh(limits.daily_tokens, today);
    }
    quota
}
