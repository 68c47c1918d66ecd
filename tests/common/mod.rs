#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use conversion_engine::application::config::ConversionExecutorConfig;
use conversion_engine::application::executor::{ConversionExecutionRequest, ConversionExecutor};
use conversion_engine::domain::ledger::{ConversionId, ConversionLedgerEntry, ConversionStatus};
use conversion_engine::domain::ports::{ConversionLedgerStore, TreasuryTransfer};
use conversion_engine::domain::quote::{ConversionQuote, CryptoAmount};
use conversion_engine::domain::treasury::{TransferRequest, TransferResult, TreasuryBalance};
use conversion_engine::error::{ConversionError, Result};
use conversion_engine::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryTreasury};
use rust_decimal_macros::dec;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const DESTINATION: &str = "virtengine1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5eed0dg";
pub const TREASURY_ADDRESS: &str = "virtengine1amhwamhwamhwamhwamhwamhwamhwamhwthhu73";
pub const DENOM: &str = "uve";

pub const CSV_HEADER: &str = "idempotency_key,quote_id,payment_intent_id,fiat_amount,fiat_currency,crypto_amount,crypto_denom,destination_address,conversion_rate,fee,expires_at,payment_status";

pub fn quote(id: &str, crypto_amount: u64) -> ConversionQuote {
    ConversionQuote {
        id: id.to_string(),
        fiat_amount: dec!(100.00),
        fiat_currency: "USD".to_string(),
        crypto_amount: CryptoAmount::new(crypto_amount).unwrap(),
        crypto_denom: DENOM.to_string(),
        destination_address: DESTINATION.to_string(),
        conversion_rate: dec!(0.00001),
        fee: dec!(1.50),
        expires_at: Utc::now() + TimeDelta::minutes(15),
    }
}

pub fn request(key: &str, crypto_amount: u64) -> ConversionExecutionRequest {
    ConversionExecutionRequest::new(quote(&format!("quote-{key}"), crypto_amount), format!("pi_{key}"), key)
}

/// Config with no backoff so retried entries are immediately due. Payment
/// verification is off; tests that exercise it attach a verifier and turn it on.
pub fn config(max_retries: u32) -> ConversionExecutorConfig {
    ConversionExecutorConfig {
        max_retries,
        base_retry_delay: Duration::ZERO,
        treasury_address: TREASURY_ADDRESS.to_string(),
        require_payment_verification: false,
        ..ConversionExecutorConfig::default()
    }
}

pub struct Harness {
    pub executor: ConversionExecutor,
    pub store: InMemoryLedgerStore,
    pub treasury: InMemoryTreasury,
}

pub async fn harness(balance: u64, config: ConversionExecutorConfig) -> Harness {
    let store = InMemoryLedgerStore::new();
    let treasury = InMemoryTreasury::new(TREASURY_ADDRESS);
    treasury.fund(DENOM, balance).await;
    let executor = ConversionExecutor::new(
        Box::new(store.clone()),
        Box::new(treasury.clone()),
        config,
    );
    Harness {
        executor,
        store,
        treasury,
    }
}

/// Store wrapper that can refuse to persist completed entries, simulating a
/// ledger outage right after a transfer lands.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: InMemoryLedgerStore,
    fail_completions: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: InMemoryLedgerStore) -> Self {
        Self {
            inner,
            fail_completions: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_completions(&self, fail: bool) {
        self.fail_completions.store(fail, Ordering::SeqCst);
    }

    fn check(&self, entry: &ConversionLedgerEntry) -> Result<()> {
        if entry.status == ConversionStatus::Completed && self.fail_completions.load(Ordering::SeqCst) {
            return Err(ConversionError::Storage("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversionLedgerStore for FlakyStore {
    async fn save(&self, entry: &ConversionLedgerEntry) -> Result<()> {
        self.check(entry)?;
        self.inner.save(entry).await
    }

    async fn save_if_status(
        &self,
        entry: &ConversionLedgerEntry,
        expected: ConversionStatus,
    ) -> Result<bool> {
        self.check(entry)?;
        self.inner.save_if_status(entry, expected).await
    }

    async fn get_by_id(&self, id: ConversionId) -> Result<Option<ConversionLedgerEntry>> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionLedgerEntry>> {
        self.inner.get_by_idempotency_key(key).await
    }

    async fn list_by_status(&self, status: ConversionStatus) -> Result<Vec<ConversionLedgerEntry>> {
        self.inner.list_by_status(status).await
    }

    async fn list_pending_ready_for_execution(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversionLedgerEntry>> {
        self.inner.list_pending_ready_for_execution(now).await
    }
}

/// How [`UnacknowledgedTreasury`] loses the reply to a transfer it performed.
#[derive(Clone, Copy)]
pub enum LostAck {
    /// The reply arrives after this delay.
    Slow(Duration),
    /// The connection drops after the transfer lands.
    Dropped,
}

/// Treasury that moves funds but fails to report it in time.
#[derive(Clone)]
pub struct UnacknowledgedTreasury {
    pub inner: InMemoryTreasury,
    ack: LostAck,
}

impl UnacknowledgedTreasury {
    pub fn new(inner: InMemoryTreasury, ack: LostAck) -> Self {
        Self { inner, ack }
    }
}

#[async_trait]
impl TreasuryTransfer for UnacknowledgedTreasury {
    async fn send_from_treasury(&self, request: TransferRequest) -> Result<TransferResult> {
        let result = self.inner.send_from_treasury(request).await?;
        match self.ack {
            LostAck::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(result)
            }
            LostAck::Dropped => Err(ConversionError::Treasury("connection reset".to_string())),
        }
    }

    async fn get_treasury_balance(&self, denom: &str) -> Result<TreasuryBalance> {
        self.inner.get_treasury_balance(denom).await
    }

    async fn validate_address(&self, address: &str) -> Result<()> {
        self.inner.validate_address(address).await
    }
}

pub fn csv_row(key: &str, crypto_amount: u64, expires_at: &str) -> String {
    csv_row_with_payment(key, crypto_amount, expires_at, "succeeded")
}

pub fn csv_row_with_payment(key: &str, crypto_amount: u64, expires_at: &str, payment_status: &str) -> String {
    format!(
        "{key},quote-{key},pi_{key},100.00,USD,{crypto_amount},{DENOM},{DESTINATION},0.00001,1.50,{expires_at},{payment_status}"
    )
}

pub fn write_requests_csv(path: &Path, rows: &[String]) -> std::result::Result<(), Error> {
    let mut content = String::from(CSV_HEADER);
    content.push('\n');
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    std::fs::write(path, content)
}
