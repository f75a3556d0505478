//! Per-account storage quota admission
//!
//! The in-memory ledger keeps one atomic usage counter per account and
//! admits with a compare-and-increment loop, so concurrent rooms of the same
//! account can never overshoot the limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Rejection;
use crate::room::AccountId;

/// Snapshot of an account's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub limit: u64,
    pub used: u64,
}

impl QuotaUsage {
    pub fn percentage(&self) -> f32 {
        if self.limit == 0 {
            return 100.0;
        }
        (self.used as f64 / self.limit as f64 * 100.0) as f32
    }
}

/// Result of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Usage was incremented; `used` is the new total
    Admitted { used: u64 },
    /// Budget would be exceeded; usage unchanged
    Rejected { limit: u64, used: u64 },
    /// No such account
    UnknownAccount,
}

/// Account lookup collaborator: limit, usage and atomic consumption.
#[async_trait::async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically check `used + bytes <= limit` and increment on success.
    async fn try_consume(&self, account: &AccountId, bytes: u64) -> Result<QuotaDecision>;

    /// Current usage of an account
    async fn usage(&self, account: &AccountId) -> Result<Option<QuotaUsage>>;
}

struct AccountBudget {
    limit: u64,
    used: AtomicU64,
}

impl AccountBudget {
    /// Compare-and-increment. Returns the new usage, or the observed usage
    /// if the increment would overshoot.
    fn try_consume(&self, bytes: u64) -> std::result::Result<u64, u64> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.limit => next,
                _ => return Err(current),
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }
}

/// In-process quota ledger.
#[derive(Default)]
pub struct MemoryQuotaLedger {
    accounts: RwLock<HashMap<AccountId, Arc<AccountBudget>>>,
}

impl MemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account, replacing any previous budget.
    pub async fn set_account(&self, account: AccountId, limit: u64, used: u64) {
        self.accounts.write().await.insert(
            account,
            Arc::new(AccountBudget {
                limit,
                used: AtomicU64::new(used),
            }),
        );
    }

    async fn budget(&self, account: &AccountId) -> Option<Arc<AccountBudget>> {
        self.accounts.read().await.get(account).cloned()
    }
}

#[async_trait::async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn try_consume(&self, account: &AccountId, bytes: u64) -> Result<QuotaDecision> {
        let Some(budget) = self.budget(account).await else {
            return Ok(QuotaDecision::UnknownAccount);
        };
        Ok(match budget.try_consume(bytes) {
            Ok(used) => QuotaDecision::Admitted { used },
            Err(used) => QuotaDecision::Rejected {
                limit: budget.limit,
                used,
            },
        })
    }

    async fn usage(&self, account: &AccountId) -> Result<Option<QuotaUsage>> {
        Ok(self.budget(account).await.map(|b| QuotaUsage {
            limit: b.limit,
            used: b.used.load(Ordering::Acquire),
        }))
    }
}

/// Admission check in front of dedup and storage.
#[derive(Clone)]
pub struct QuotaGuard {
    ledger: Arc<dyn QuotaLedger>,
}

impl QuotaGuard {
    pub fn new(ledger: Arc<dyn QuotaLedger>) -> Self {
        Self { ledger }
    }

    /// Admit `bytes` for `account`. A rejection is terminal for the frame.
    pub async fn admit(&self, account: &AccountId, bytes: u64) -> std::result::Result<(), Rejection> {
        match self.ledger.try_consume(account, bytes).await {
            Ok(QuotaDecision::Admitted { used }) => {
                debug!(%account, bytes, used, "Quota admitted");
                Ok(())
            }
            Ok(QuotaDecision::Rejected { limit, used }) => {
                debug!(%account, bytes, used, limit, "Quota exceeded");
                Err(Rejection::QuotaExceeded {
                    limit,
                    used,
                    requested: bytes,
                })
            }
            Ok(QuotaDecision::UnknownAccount) => {
                warn!(%account, "Quota check for unknown account");
                Err(Rejection::QuotaUnavailable)
            }
            Err(e) => {
                warn!(%account, error = %e, "Quota ledger error");
                Err(Rejection::QuotaUnavailable)
            }
        }
    }

    pub async fn usage(&self, account: &AccountId) -> Result<Option<QuotaUsage>> {
        self.ledger.usage(account).await
    }
}
