use super::config::ConversionExecutorConfig;
use super::locks::ExecutionLocks;
use crate::domain::ledger::{
    ConversionErrorCode, ConversionId, ConversionLedgerEntry, ConversionStatus,
};
use crate::domain::ports::{LedgerStoreBox, PaymentVerifierRef, TreasuryBox};
use crate::domain::quote::ConversionQuote;
use crate::domain::treasury::{TransferRequest, TransferResult};
use crate::error::{ConversionError, Result};
use chrono::{TimeDelta, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, error, info, instrument, warn};

pub const REFUND_REASON_KEY: &str = "refund_reason";
pub const REFUNDED_AT_KEY: &str = "refunded_at";
pub const RECONCILED_AT_KEY: &str = "reconciled_at";
pub const RECONCILE_TX_HASH_KEY: &str = "reconcile_tx_hash";
pub const RECONCILE_BLOCK_HEIGHT_KEY: &str = "reconcile_block_height";
pub const RECONCILE_TREASURY_ADDRESS_KEY: &str = "reconcile_treasury_address";

/// A request to settle a paid quote.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionExecutionRequest {
    pub quote: ConversionQuote,
    pub payment_intent_id: String,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

impl ConversionExecutionRequest {
    pub fn new(
        quote: ConversionQuote,
        payment_intent_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            quote,
            payment_intent_id: payment_intent_id.into(),
            idempotency_key: idempotency_key.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Outcome of an execution attempt that reached the ledger.
///
/// `success == false` means the failure is recorded on `ledger_entry`, either
/// as a scheduled retry or as a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionExecutionResult {
    pub ledger_entry: ConversionLedgerEntry,
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error_code: Option<ConversionErrorCode>,
    /// No new work was done; the conversion had already completed.
    pub already_completed: bool,
    pub error: Option<String>,
}

impl ConversionExecutionResult {
    fn completed(entry: ConversionLedgerEntry) -> Self {
        Self {
            success: true,
            tx_hash: entry.tx_hash.clone(),
            error_code: None,
            already_completed: false,
            error: None,
            ledger_entry: entry,
        }
    }

    fn already_completed(entry: ConversionLedgerEntry) -> Self {
        Self {
            already_completed: true,
            ..Self::completed(entry)
        }
    }

    fn failed(entry: ConversionLedgerEntry) -> Self {
        Self {
            success: false,
            tx_hash: None,
            error_code: entry.error_code,
            already_completed: false,
            error: entry.error_message.clone(),
            ledger_entry: entry,
        }
    }
}

struct ExecutionFailure {
    code: ConversionErrorCode,
    message: String,
    /// The transfer may have been accepted; the entry must not be retried blindly.
    outcome_unknown: bool,
}

impl ExecutionFailure {
    fn new(code: ConversionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            outcome_unknown: false,
        }
    }

    fn outcome_unknown(message: impl Into<String>) -> Self {
        Self {
            code: ConversionErrorCode::Internal,
            message: message.into(),
            outcome_unknown: true,
        }
    }
}

enum Resolution {
    Finished(ConversionExecutionResult),
    Execute(ConversionLedgerEntry),
}

/// Drives ledger entries through their state machine against the treasury.
///
/// The executor keeps no cached status or balance between calls; the store and
/// the treasury are the sources of truth. Retries are never scheduled
/// internally: a worker polls [`list_pending_conversions`](Self::list_pending_conversions)
/// and calls back in.
pub struct ConversionExecutor {
    store: LedgerStoreBox,
    treasury: TreasuryBox,
    payment_verifier: Option<PaymentVerifierRef>,
    config: ConversionExecutorConfig,
    locks: ExecutionLocks,
}

impl ConversionExecutor {
    pub fn new(store: LedgerStoreBox, treasury: TreasuryBox, config: ConversionExecutorConfig) -> Self {
        Self {
            store,
            treasury,
            payment_verifier: None,
            config,
            locks: ExecutionLocks::new(),
        }
    }

    pub fn with_payment_verifier(mut self, verifier: PaymentVerifierRef) -> Self {
        self.payment_verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &ConversionExecutorConfig {
        &self.config
    }

    /// Number of idempotency keys currently executing in this process.
    pub fn in_flight_executions(&self) -> usize {
        self.locks.len()
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| ConversionError::Timeout(operation))?
    }

    fn ensure_payment_verifier(&self) -> Result<()> {
        if self.config.require_payment_verification && self.payment_verifier.is_none() {
            return Err(ConversionError::Config(
                "payment verification is required but no payment verifier is attached"
                    .to_string(),
            ));
        }
        Ok(())
    }

    async fn load(&self, id: ConversionId) -> Result<ConversionLedgerEntry> {
        self.bounded("ledger read", self.store.get_by_id(id))
            .await?
            .ok_or_else(|| ConversionError::NotFound(id.to_string()))
    }

    /// Settles a paid quote exactly once per idempotency key.
    #[instrument(skip(self, req), fields(idempotency_key = %req.idempotency_key, quote_id = %req.quote.id))]
    pub async fn execute_conversion(
        &self,
        req: ConversionExecutionRequest,
    ) -> Result<ConversionExecutionResult> {
        self.ensure_payment_verifier()?;
        let denom = self.validate_request(&req).await?;

        let existing = self
            .bounded(
                "ledger read",
                self.store.get_by_idempotency_key(&req.idempotency_key),
            )
            .await?;

        let resolution = match existing {
            Some(entry) => self.resolve_existing(entry, &req)?,
            None => self.create_entry(&req, denom).await?,
        };

        match resolution {
            Resolution::Finished(result) => Ok(result),
            Resolution::Execute(entry) => self.execute_entry(entry).await,
        }
    }

    async fn validate_request(&self, req: &ConversionExecutionRequest) -> Result<String> {
        if req.idempotency_key.trim().is_empty() {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidRequest,
                "idempotency key is required",
            ));
        }
        if req.quote.id.trim().is_empty() {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidRequest,
                "quote id is required",
            ));
        }
        if req.payment_intent_id.trim().is_empty() {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidRequest,
                "payment intent id is required",
            ));
        }
        if req.quote.is_expired(Utc::now()) {
            return Err(ConversionError::rejected(
                ConversionErrorCode::QuoteExpired,
                format!("quote {} expired at {}", req.quote.id, req.quote.expires_at),
            ));
        }

        let address = req.quote.destination_address.as_str();
        if address.trim().is_empty() {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidAddress,
                "destination address is required",
            ));
        }
        if address.trim() != address {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidAddress,
                "destination address must not have surrounding whitespace",
            ));
        }
        if !address.starts_with(&self.config.address_prefix) {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidAddress,
                format!(
                    "destination address must start with {}",
                    self.config.address_prefix
                ),
            ));
        }
        // Treasury outages surface unchanged; only a rejection is a bad address.
        self.bounded(
            "address validation",
            self.treasury.validate_address(address),
        )
        .await?;

        let denom = req.quote.crypto_denom.trim();
        Ok(if denom.is_empty() {
            self.config.default_denom.clone()
        } else {
            denom.to_string()
        })
    }

    fn resolve_existing(
        &self,
        entry: ConversionLedgerEntry,
        req: &ConversionExecutionRequest,
    ) -> Result<Resolution> {
        if entry.quote_id != req.quote.id {
            return Err(ConversionError::rejected(
                ConversionErrorCode::Duplicate,
                format!(
                    "idempotency key {} is bound to quote {}",
                    entry.idempotency_key, entry.quote_id
                ),
            ));
        }

        match entry.status {
            ConversionStatus::Completed => {
                info!(
                    conversion_id = %entry.id,
                    tx_hash = ?entry.tx_hash,
                    "Idempotent replay of completed conversion"
                );
                Ok(Resolution::Finished(
                    ConversionExecutionResult::already_completed(entry),
                ))
            }
            ConversionStatus::Failed | ConversionStatus::Refunded => {
                debug!(conversion_id = %entry.id, status = %entry.status, "Returning stored outcome");
                Ok(Resolution::Finished(ConversionExecutionResult::failed(entry)))
            }
            ConversionStatus::Executing => Err(ConversionError::InProgress {
                idempotency_key: entry.idempotency_key,
            }),
            ConversionStatus::Pending | ConversionStatus::Reconciling => {
                Ok(Resolution::Execute(entry))
            }
        }
    }

    async fn create_entry(
        &self,
        req: &ConversionExecutionRequest,
        denom: String,
    ) -> Result<Resolution> {
        let entry = ConversionLedgerEntry::new(
            req.idempotency_key.clone(),
            &req.quote,
            denom,
            req.payment_intent_id.clone(),
            self.config.max_retries,
            req.metadata.clone(),
            Utc::now(),
        );

        match self.bounded("ledger save", self.store.save(&entry)).await {
            Ok(()) => {
                info!(
                    conversion_id = %entry.id,
                    amount = %entry.crypto_amount,
                    denom = %entry.crypto_denom,
                    "Conversion created"
                );
                Ok(Resolution::Execute(entry))
            }
            Err(ConversionError::DuplicateIdempotencyKey(key)) => {
                // Lost the creation race; resolve against the winner.
                debug!(idempotency_key = %key, "Concurrent creation detected");
                let winner = self
                    .bounded("ledger read", self.store.get_by_idempotency_key(&key))
                    .await?
                    .ok_or(ConversionError::DuplicateIdempotencyKey(key))?;
                self.resolve_existing(winner, req)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_entry(&self, entry: ConversionLedgerEntry) -> Result<ConversionExecutionResult> {
        self.ensure_payment_verifier()?;
        let _guard = self
            .locks
            .try_acquire(&entry.idempotency_key)
            .ok_or_else(|| ConversionError::InProgress {
                idempotency_key: entry.idempotency_key.clone(),
            })?;

        let mut entry = self.load(entry.id).await?;
        let now = Utc::now();
        if !entry.is_ready_for_execution(now) {
            return Self::short_circuit(entry);
        }

        entry.mark_executing(now)?;
        let claimed = self
            .bounded(
                "ledger save",
                self.store.save_if_status(&entry, ConversionStatus::Pending),
            )
            .await?;
        if !claimed {
            return Err(ConversionError::InProgress {
                idempotency_key: entry.idempotency_key,
            });
        }
        info!(
            conversion_id = %entry.id,
            retry_count = entry.retry_count,
            "Conversion executing"
        );

        match self.perform_transfer(&entry).await {
            Ok(receipt) => self.finish_success(entry, receipt).await,
            Err(failure) => self.finish_failure(entry, failure).await,
        }
    }

    fn short_circuit(entry: ConversionLedgerEntry) -> Result<ConversionExecutionResult> {
        match entry.status {
            ConversionStatus::Completed => Ok(ConversionExecutionResult::already_completed(entry)),
            ConversionStatus::Failed | ConversionStatus::Refunded => {
                Ok(ConversionExecutionResult::failed(entry))
            }
            ConversionStatus::Executing => Err(ConversionError::InProgress {
                idempotency_key: entry.idempotency_key,
            }),
            ConversionStatus::Pending | ConversionStatus::Reconciling => {
                Err(ConversionError::NotReady {
                    id: entry.id,
                    status: entry.status,
                    next_retry_at: entry.next_retry_at,
                })
            }
        }
    }

    async fn perform_transfer(
        &self,
        entry: &ConversionLedgerEntry,
    ) -> std::result::Result<TransferResult, ExecutionFailure> {
        if self.config.require_payment_verification
            && let Some(verifier) = &self.payment_verifier
        {
            match self
                .bounded(
                    "payment verification",
                    verifier.get_payment_intent(&entry.payment_intent_id),
                )
                .await
            {
                Ok(intent) if intent.status.is_successful() => {}
                Ok(intent) => {
                    return Err(ExecutionFailure::new(
                        ConversionErrorCode::PaymentNotSucceeded,
                        format!("payment intent {} is {:?}", intent.id, intent.status),
                    ));
                }
                Err(e) => {
                    return Err(ExecutionFailure::new(
                        ConversionErrorCode::Internal,
                        format!("payment verification failed: {}", e),
                    ));
                }
            }
        }

        let balance = self
            .bounded(
                "treasury balance",
                self.treasury.get_treasury_balance(&entry.crypto_denom),
            )
            .await
            .map_err(|e| {
                ExecutionFailure::new(
                    ConversionErrorCode::TransferFailed,
                    format!("treasury balance unavailable: {}", e),
                )
            })?;
        if !balance.covers(entry.crypto_amount) {
            return Err(ExecutionFailure::new(
                ConversionErrorCode::InsufficientTreasury,
                format!(
                    "treasury has {} {} available, {} required",
                    balance.available, entry.crypto_denom, entry.crypto_amount
                ),
            ));
        }

        let request = TransferRequest {
            destination: entry.destination_address.clone(),
            amount: entry.crypto_amount,
            denom: entry.crypto_denom.clone(),
            memo: format!("conversion:{}", entry.id),
            idempotency_key: entry.idempotency_key.clone(),
        };
        // Past this point a timeout or transport error leaves the outcome unknown.
        let result = self
            .bounded(
                "treasury transfer",
                self.treasury.send_from_treasury(request),
            )
            .await
            .map_err(|e| {
                ExecutionFailure::outcome_unknown(format!("treasury transfer outcome unknown: {}", e))
            })?;

        if !result.success || result.tx_hash.is_empty() {
            return Err(ExecutionFailure::new(
                ConversionErrorCode::TransferFailed,
                result
                    .error
                    .unwrap_or_else(|| "treasury reported an unsuccessful transfer".to_string()),
            ));
        }
        Ok(result)
    }

    async fn finish_success(
        &self,
        mut entry: ConversionLedgerEntry,
        receipt: TransferResult,
    ) -> Result<ConversionExecutionResult> {
        let now = Utc::now();
        let mut completed = entry.clone();
        completed.mark_completed(
            receipt.tx_hash.clone(),
            receipt.block_height,
            receipt.treasury_address.clone(),
            now,
        )?;

        let save_err = match self.bounded("ledger save", self.store.save(&completed)).await {
            Ok(()) => {
                info!(
                    conversion_id = %completed.id,
                    tx_hash = %receipt.tx_hash,
                    block_height = receipt.block_height,
                    "Conversion completed"
                );
                return Ok(ConversionExecutionResult::completed(completed));
            }
            Err(e) => e,
        };

        // Funds have moved. Keep the evidence and hand the entry to operators.
        error!(
            conversion_id = %entry.id,
            tx_hash = %receipt.tx_hash,
            error = %save_err,
            "Transfer succeeded but completion was not recorded; escalating to reconciliation"
        );
        entry.mark_reconciling(
            ConversionErrorCode::Internal,
            format!(
                "transfer {} succeeded but ledger update failed: {}",
                receipt.tx_hash, save_err
            ),
            now,
        )?;
        entry.set_metadata(RECONCILE_TX_HASH_KEY, receipt.tx_hash.clone(), now);
        entry.set_metadata(
            RECONCILE_BLOCK_HEIGHT_KEY,
            receipt.block_height.to_string(),
            now,
        );
        entry.set_metadata(
            RECONCILE_TREASURY_ADDRESS_KEY,
            receipt.treasury_address.clone(),
            now,
        );
        if let Err(e) = self.bounded("ledger save", self.store.save(&entry)).await {
            error!(
                conversion_id = %entry.id,
                tx_hash = %receipt.tx_hash,
                error = %e,
                "Failed to persist reconciliation marker; stale sweep will pick the entry up"
            );
        }

        Ok(ConversionExecutionResult {
            ledger_entry: entry,
            success: true,
            tx_hash: Some(receipt.tx_hash),
            error_code: Some(ConversionErrorCode::Internal),
            already_completed: false,
            error: Some(save_err.to_string()),
        })
    }

    async fn finish_failure(
        &self,
        mut entry: ConversionLedgerEntry,
        failure: ExecutionFailure,
    ) -> Result<ConversionExecutionResult> {
        let now = Utc::now();
        if failure.outcome_unknown {
            entry.mark_reconciling(failure.code, failure.message.clone(), now)?;
            self.bounded("ledger save", self.store.save(&entry))
                .await
                .inspect_err(|e| {
                    error!(
                        conversion_id = %entry.id,
                        error = %e,
                        "Failed to persist reconciliation marker; stale sweep will pick the entry up"
                    );
                })?;
            error!(
                conversion_id = %entry.id,
                "Transfer outcome unknown; escalating to reconciliation: {}",
                failure.message
            );
            return Ok(ConversionExecutionResult::failed(entry));
        }

        let retried = if failure.code.is_retryable() {
            entry.mark_for_retry(
                failure.code,
                failure.message.clone(),
                self.config.base_retry_delay,
                now,
            )?
        } else {
            entry.mark_failed(failure.code, failure.message.clone(), now)?;
            false
        };

        if let Err(e) = self.bounded("ledger save", self.store.save(&entry)).await {
            error!(
                conversion_id = %entry.id,
                error_code = %failure.code,
                error = %e,
                "Failed to record conversion failure"
            );
            return Err(e);
        }

        if retried {
            warn!(
                conversion_id = %entry.id,
                error_code = %failure.code,
                retry_count = entry.retry_count,
                next_retry_at = ?entry.next_retry_at,
                "Conversion attempt failed; retry scheduled: {}",
                failure.message
            );
        } else {
            error!(
                conversion_id = %entry.id,
                error_code = %failure.code,
                retry_count = entry.retry_count,
                "Conversion failed permanently: {}",
                failure.message
            );
        }
        Ok(ConversionExecutionResult::failed(entry))
    }

    /// Operator-initiated retry. Ignores the backoff schedule but not the retry budget.
    #[instrument(skip(self))]
    pub async fn retry_failed_conversion(
        &self,
        id: ConversionId,
    ) -> Result<ConversionExecutionResult> {
        self.ensure_payment_verifier()?;
        let mut entry = self.load(id).await?;
        if entry.status == ConversionStatus::Completed {
            return Ok(ConversionExecutionResult::already_completed(entry));
        }
        if !entry.can_retry_manually() {
            return Err(ConversionError::InvalidTransition {
                id,
                from: entry.status,
                action: "retry",
            });
        }

        let previous = entry.status;
        entry.reset_for_retry(Utc::now())?;
        let reset = self
            .bounded("ledger save", self.store.save_if_status(&entry, previous))
            .await?;
        if !reset {
            return Err(ConversionError::InProgress {
                idempotency_key: entry.idempotency_key,
            });
        }
        info!(conversion_id = %id, from = %previous, "Manual retry requested");

        self.execute_entry(entry).await
    }

    /// Drives a stored entry without resetting it; backoff is honored.
    #[instrument(skip(self))]
    pub async fn resume_conversion(&self, id: ConversionId) -> Result<ConversionExecutionResult> {
        let entry = self.load(id).await?;
        self.execute_entry(entry).await
    }

    /// Records an externally confirmed transfer for an entry stuck in
    /// `Executing` or `Reconciling`.
    #[instrument(skip(self))]
    pub async fn reconcile_conversion(
        &self,
        id: ConversionId,
        tx_hash: &str,
        block_height: u64,
    ) -> Result<ConversionLedgerEntry> {
        let entry = self.load(id).await?;
        let _guard = self
            .locks
            .try_acquire(&entry.idempotency_key)
            .ok_or_else(|| ConversionError::InProgress {
                idempotency_key: entry.idempotency_key.clone(),
            })?;

        let mut entry = self.load(id).await?;
        match entry.status {
            ConversionStatus::Completed => {
                return Err(ConversionError::AlreadyCompleted {
                    id,
                    tx_hash: entry.tx_hash.unwrap_or_default(),
                });
            }
            ConversionStatus::Executing | ConversionStatus::Reconciling => {}
            other => {
                return Err(ConversionError::InvalidTransition {
                    id,
                    from: other,
                    action: "reconcile",
                });
            }
        }

        let tx_hash = tx_hash.trim();
        if tx_hash.is_empty() {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidRequest,
                "transaction hash is required",
            ));
        }
        if block_height == 0 {
            return Err(ConversionError::rejected(
                ConversionErrorCode::InvalidRequest,
                "block height must be positive",
            ));
        }

        let previous = entry.status;
        let treasury_address = entry
            .metadata
            .get(RECONCILE_TREASURY_ADDRESS_KEY)
            .cloned()
            .unwrap_or_else(|| self.config.treasury_address.clone());
        let now = Utc::now();
        entry.mark_completed(tx_hash, block_height, treasury_address, now)?;
        entry.set_metadata(RECONCILED_AT_KEY, now.to_rfc3339(), now);

        let saved = self
            .bounded("ledger save", self.store.save_if_status(&entry, previous))
            .await?;
        if !saved {
            return Err(ConversionError::InProgress {
                idempotency_key: entry.idempotency_key,
            });
        }
        info!(conversion_id = %id, tx_hash, block_height, "Conversion reconciled");
        Ok(entry)
    }

    /// Marks a non-completed conversion refunded. The fiat reversal itself is
    /// left to the payment gateway.
    #[instrument(skip(self))]
    pub async fn refund_conversion(
        &self,
        id: ConversionId,
        reason: &str,
    ) -> Result<ConversionLedgerEntry> {
        let entry = self.load(id).await?;
        let _guard = self
            .locks
            .try_acquire(&entry.idempotency_key)
            .ok_or_else(|| ConversionError::InProgress {
                idempotency_key: entry.idempotency_key.clone(),
            })?;

        let mut entry = self.load(id).await?;
        match entry.status {
            ConversionStatus::Refunded => return Ok(entry),
            ConversionStatus::Completed => {
                return Err(ConversionError::InvalidTransition {
                    id,
                    from: entry.status,
                    action: "refund",
                });
            }
            _ => {}
        }

        let previous = entry.status;
        let now = Utc::now();
        entry.mark_refunded(now)?;
        entry.set_metadata(REFUND_REASON_KEY, reason, now);
        entry.set_metadata(REFUNDED_AT_KEY, now.to_rfc3339(), now);

        let saved = self
            .bounded("ledger save", self.store.save_if_status(&entry, previous))
            .await?;
        if !saved {
            return Err(ConversionError::InProgress {
                idempotency_key: entry.idempotency_key,
            });
        }
        info!(conversion_id = %id, reason, "Conversion refunded");
        Ok(entry)
    }

    /// Moves entries stuck in `Executing` past the stale timeout into
    /// `Reconciling`. Never back to `Pending`: the transfer may have landed.
    #[instrument(skip(self))]
    pub async fn recover_stale_executions(&self) -> Result<Vec<ConversionLedgerEntry>> {
        let now = Utc::now();
        let Some(cutoff) = TimeDelta::from_std(self.config.stale_execution_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(Vec::new());
        };

        let executing = self
            .bounded(
                "ledger read",
                self.store.list_by_status(ConversionStatus::Executing),
            )
            .await?;

        let mut recovered = Vec::new();
        for mut entry in executing.into_iter().filter(|e| e.updated_at <= cutoff) {
            let Some(_guard) = self.locks.try_acquire(&entry.idempotency_key) else {
                continue;
            };
            let stalled_since = entry.updated_at;
            entry.mark_reconciling(
                ConversionErrorCode::Internal,
                format!("execution stalled since {}", stalled_since.to_rfc3339()),
                now,
            )?;
            let moved = self
                .bounded(
                    "ledger save",
                    self.store.save_if_status(&entry, ConversionStatus::Executing),
                )
                .await?;
            if moved {
                warn!(
                    conversion_id = %entry.id,
                    stalled_since = %stalled_since,
                    "Stale execution moved to reconciliation"
                );
                recovered.push(entry);
            }
        }
        Ok(recovered)
    }

    pub async fn get_conversion(&self, id: ConversionId) -> Result<Option<ConversionLedgerEntry>> {
        self.bounded("ledger read", self.store.get_by_id(id)).await
    }

    pub async fn get_conversion_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ConversionLedgerEntry>> {
        self.bounded("ledger read", self.store.get_by_idempotency_key(key))
            .await
    }

    /// Pending entries whose backoff has elapsed.
    pub async fn list_pending_conversions(&self) -> Result<Vec<ConversionLedgerEntry>> {
        self.bounded(
            "ledger read",
            self.store.list_pending_ready_for_execution(Utc::now()),
        )
        .await
    }

    pub async fn list_conversions_for_reconciliation(&self) -> Result<Vec<ConversionLedgerEntry>> {
        self.bounded(
            "ledger read",
            self.store.list_by_status(ConversionStatus::Reconciling),
        )
        .await
    }
}
