use super::ledger::{ConversionId, ConversionLedgerEntry, ConversionStatus};
use super::payment::PaymentIntent;
use super::treasury::{TransferRequest, TransferResult, TreasuryBalance};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Persistence for ledger entries.
///
/// Implementations keep a unique index from idempotency key to ID and hand out
/// independent copies, so mutating a returned entry never touches stored state.
#[async_trait]
pub trait ConversionLedgerStore: Send + Sync {
    /// Upserts by ID. Fails with `DuplicateIdempotencyKey` if the key is bound to another ID.
    async fn save(&self, entry: &ConversionLedgerEntry) -> Result<()>;
    /// Upserts only if the stored status equals `expected`. Returns whether the write happened.
    async fn save_if_status(
        &self,
        entry: &ConversionLedgerEntry,
        expected: ConversionStatus,
    ) -> Result<bool>;
    async fn get_by_id(&self, id: ConversionId) -> Result<Option<ConversionLedgerEntry>>;
    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionLedgerEntry>>;
    async fn list_by_status(&self, status: ConversionStatus) -> Result<Vec<ConversionLedgerEntry>>;
    /// Pending entries whose `next_retry_at` is unset or not after `now`.
    async fn list_pending_ready_for_execution(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversionLedgerEntry>>;
}

/// Moves funds out of the custodial treasury.
#[async_trait]
pub trait TreasuryTransfer: Send + Sync {
    /// Must be idempotent on `request.idempotency_key`.
    ///
    /// `Ok` with `success == false` means the transfer was refused. `Err` means
    /// the outcome is unknown and the transfer may have gone through.
    async fn send_from_treasury(&self, request: TransferRequest) -> Result<TransferResult>;
    async fn get_treasury_balance(&self, denom: &str) -> Result<TreasuryBalance>;
    /// A malformed address is `ConversionError::Rejected` with `InvalidAddress`;
    /// any other error is a treasury failure.
    async fn validate_address(&self, address: &str) -> Result<()>;
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn get_payment_intent(&self, id: &str) -> Result<PaymentIntent>;
}

pub type LedgerStoreBox = Box<dyn ConversionLedgerStore>;
pub type TreasuryBox = Box<dyn TreasuryTransfer>;
pub type PaymentVerifierRef = Arc<dyn PaymentVerifier>;
