use crate::domain::quote::{ConversionQuote, CryptoAmount};
use crate::error::ConversionError;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// System-generated identifier of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversionId(uuid::Uuid);

impl ConversionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ConversionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Refunded,
    Reconciling,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Reconciling => "reconciling",
        }
    }

    /// Terminal states never transition again on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Refunded)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Reconciling)
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionErrorCode {
    QuoteExpired,
    PaymentNotSucceeded,
    InsufficientTreasury,
    TransferFailed,
    InvalidAddress,
    Duplicate,
    /// A required request field was missing or malformed.
    InvalidRequest,
    Internal,
}

impl ConversionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuoteExpired => "quote_expired",
            Self::PaymentNotSucceeded => "payment_not_succeeded",
            Self::InsufficientTreasury => "insufficient_treasury",
            Self::TransferFailed => "transfer_failed",
            Self::InvalidAddress => "invalid_address",
            Self::Duplicate => "duplicate",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientTreasury | Self::TransferFailed | Self::Internal
        )
    }
}

impl fmt::Display for ConversionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted record of one conversion and its state machine.
///
/// Transitions validate the current status and stamp `updated_at`; they never
/// perform I/O. Callers supply the clock so retry scheduling is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionLedgerEntry {
    pub id: ConversionId,
    /// Caller-supplied de-duplication key. Maps to exactly one `id`.
    pub idempotency_key: String,
    pub quote_id: String,
    pub payment_intent_id: String,

    pub fiat_amount: Decimal,
    pub fiat_currency: String,
    pub crypto_amount: CryptoAmount,
    pub crypto_denom: String,
    pub destination_address: String,
    pub conversion_rate: Decimal,
    pub fee: Decimal,

    pub status: ConversionStatus,
    pub error_code: Option<ConversionErrorCode>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Set if and only if `status == Completed`.
    pub tx_hash: Option<String>,
    pub block_height: Option<u64>,
    pub treasury_address: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ConversionLedgerEntry {
    /// Creates a `Pending` entry from a quote.
    pub fn new(
        idempotency_key: impl Into<String>,
        quote: &ConversionQuote,
        crypto_denom: impl Into<String>,
        payment_intent_id: impl Into<String>,
        max_retries: u32,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConversionId::new(),
            idempotency_key: idempotency_key.into(),
            quote_id: quote.id.clone(),
            payment_intent_id: payment_intent_id.into(),
            fiat_amount: quote.fiat_amount,
            fiat_currency: quote.fiat_currency.clone(),
            crypto_amount: quote.crypto_amount,
            crypto_denom: crypto_denom.into(),
            destination_address: quote.destination_address.clone(),
            conversion_rate: quote.conversion_rate,
            fee: quote.fee,
            status: ConversionStatus::Pending,
            error_code: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            last_retry_at: None,
            next_retry_at: None,
            tx_hash: None,
            block_height: None,
            treasury_address: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata,
        }
    }

    fn invalid(&self, action: &'static str) -> ConversionError {
        ConversionError::InvalidTransition {
            id: self.id,
            from: self.status,
            action,
        }
    }

    fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Pending or Reconciling -> Executing.
    pub fn mark_executing(&mut self, now: DateTime<Utc>) -> Result<(), ConversionError> {
        match self.status {
            ConversionStatus::Pending | ConversionStatus::Reconciling => {
                self.status = ConversionStatus::Executing;
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("mark executing")),
        }
    }

    /// Executing or Reconciling -> Completed. Clears error and retry scheduling.
    pub fn mark_completed(
        &mut self,
        tx_hash: impl Into<String>,
        block_height: u64,
        treasury_address: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ConversionError> {
        match self.status {
            ConversionStatus::Executing | ConversionStatus::Reconciling => {
                self.status = ConversionStatus::Completed;
                self.tx_hash = Some(tx_hash.into());
                self.block_height = Some(block_height);
                self.treasury_address = Some(treasury_address.into());
                self.error_code = None;
                self.error_message = None;
                self.next_retry_at = None;
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("mark completed")),
        }
    }

    /// Executing -> Failed (terminal).
    pub fn mark_failed(
        &mut self,
        code: ConversionErrorCode,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ConversionError> {
        if self.status != ConversionStatus::Executing {
            return Err(self.invalid("mark failed"));
        }
        self.status = ConversionStatus::Failed;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Executing -> Pending with exponential backoff, or -> Failed once retries are exhausted.
    ///
    /// Returns `true` when a retry was scheduled.
    pub fn mark_for_retry(
        &mut self,
        code: ConversionErrorCode,
        message: impl Into<String>,
        base_delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, ConversionError> {
        if self.status != ConversionStatus::Executing {
            return Err(self.invalid("schedule retry"));
        }
        if self.retry_count >= self.max_retries {
            self.mark_failed(code, message, now)?;
            return Ok(false);
        }

        self.retry_count += 1;
        let multiplier = 2u32.saturating_pow(self.retry_count - 1);
        let delay = base_delay.saturating_mul(multiplier);
        let next = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.status = ConversionStatus::Pending;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.last_retry_at = Some(now);
        self.next_retry_at = Some(next);
        self.updated_at = now;
        Ok(true)
    }

    /// Executing -> Reconciling. Used whenever a transfer may have succeeded
    /// but the outcome could not be recorded.
    pub fn mark_reconciling(
        &mut self,
        code: ConversionErrorCode,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ConversionError> {
        if self.status != ConversionStatus::Executing {
            return Err(self.invalid("mark reconciling"));
        }
        self.status = ConversionStatus::Reconciling;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Pending, Failed or Reconciling -> Refunded (terminal).
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> Result<(), ConversionError> {
        match self.status {
            ConversionStatus::Pending | ConversionStatus::Failed | ConversionStatus::Reconciling => {
                self.status = ConversionStatus::Refunded;
                self.next_retry_at = None;
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("refund")),
        }
    }

    /// Pending, Failed or Reconciling -> Pending with the backoff cleared.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), ConversionError> {
        if !self.status.is_retryable() {
            return Err(self.invalid("reset for retry"));
        }
        self.status = ConversionStatus::Pending;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Metadata stays writable in every state, terminal ones included.
    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.metadata.insert(key.into(), value.into());
        self.updated_at = now;
    }

    fn has_retry_budget(&self) -> bool {
        self.status.is_retryable()
            && self.retry_count < self.max_retries
            && self.error_code.is_some_and(|code| code.is_retryable())
    }

    /// Whether an automatic retry is permitted right now.
    pub fn can_retry(&self, now: DateTime<Utc>) -> bool {
        self.has_retry_budget() && self.retry_due(now)
    }

    /// Like [`can_retry`](Self::can_retry) but ignores the backoff schedule,
    /// for operator-initiated retries.
    pub fn can_retry_manually(&self) -> bool {
        self.has_retry_budget()
    }

    pub fn is_ready_for_execution(&self, now: DateTime<Utc>) -> bool {
        self.status == ConversionStatus::Pending && self.retry_due(now)
    }
}
