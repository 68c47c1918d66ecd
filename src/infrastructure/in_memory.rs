use crate::domain::ledger::{
    ConversionErrorCode, ConversionId, ConversionLedgerEntry, ConversionStatus,
};
use crate::domain::payment::{PaymentIntent, PaymentIntentStatus};
use crate::domain::ports::{ConversionLedgerStore, PaymentVerifier, TreasuryTransfer};
use crate::domain::treasury::{TransferRequest, TransferResult, TreasuryBalance};
use crate::error::{ConversionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct LedgerState {
    entries: HashMap<ConversionId, ConversionLedgerEntry>,
    by_idempotency_key: HashMap<String, ConversionId>,
}

impl LedgerState {
    fn upsert(&mut self, entry: &ConversionLedgerEntry) -> Result<()> {
        if let Some(owner) = self.by_idempotency_key.get(&entry.idempotency_key)
            && *owner != entry.id
        {
            return Err(ConversionError::DuplicateIdempotencyKey(
                entry.idempotency_key.clone(),
            ));
        }
        self.by_idempotency_key
            .insert(entry.idempotency_key.clone(), entry.id);
        self.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn sorted<F>(&self, predicate: F) -> Vec<ConversionLedgerEntry>
    where
        F: Fn(&ConversionLedgerEntry) -> bool,
    {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }
}

/// A thread-safe in-memory ledger store.
///
/// `Clone` shares the underlying state. Reads return copies.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ConversionLedgerStore for InMemoryLedgerStore {
    async fn save(&self, entry: &ConversionLedgerEntry) -> Result<()> {
        self.state.write().await.upsert(entry)
    }

    async fn save_if_status(
        &self,
        entry: &ConversionLedgerEntry,
        expected: ConversionStatus,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.entries.get(&entry.id) {
            Some(stored) if stored.status == expected => {
                state.upsert(entry)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_by_id(&self, id: ConversionId) -> Result<Option<ConversionLedgerEntry>> {
        Ok(self.state.read().await.entries.get(&id).cloned())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionLedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .by_idempotency_key
            .get(key)
            .and_then(|id| state.entries.get(id))
            .cloned())
    }

    async fn list_by_status(&self, status: ConversionStatus) -> Result<Vec<ConversionLedgerEntry>> {
        Ok(self.state.read().await.sorted(|e| e.status == status))
    }

    async fn list_pending_ready_for_execution(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversionLedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .sorted(|e| e.is_ready_for_execution(now)))
    }
}

struct TreasuryState {
    balances: HashMap<String, TreasuryBalance>,
    completed: HashMap<String, TransferResult>,
    sequence: u64,
    block_height: u64,
    fail_next: usize,
    unavailable: bool,
}

/// Deterministic treasury for tests and local runs.
///
/// Issues sequential transaction hashes and block heights, and replays the
/// original result when an idempotency key is seen again.
#[derive(Clone)]
pub struct InMemoryTreasury {
    address: String,
    address_prefix: String,
    state: Arc<Mutex<TreasuryState>>,
}

impl InMemoryTreasury {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            address_prefix: "virtengine1".to_string(),
            state: Arc::new(Mutex::new(TreasuryState {
                balances: HashMap::new(),
                completed: HashMap::new(),
                sequence: 0,
                block_height: 0,
                fail_next: 0,
                unavailable: false,
            })),
        }
    }

    pub fn with_address_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.address_prefix = prefix.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Adds `amount` base units of `denom` to the available balance.
    pub async fn fund(&self, denom: &str, amount: u64) {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(denom.to_string()).or_default();
        balance.available = balance.available.saturating_add(amount);
        balance.total = balance.total.saturating_add(amount);
    }

    pub async fn available(&self, denom: &str) -> u64 {
        let state = self.state.lock().await;
        state.balances.get(denom).map_or(0, |b| b.available)
    }

    /// Makes the next `count` transfers report failure without moving funds.
    pub async fn fail_next_transfers(&self, count: usize) {
        self.state.lock().await.fail_next = count;
    }

    /// While set, every call fails with a transport error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Number of distinct transfers that actually moved funds.
    pub async fn transfer_count(&self) -> u64 {
        self.state.lock().await.sequence
    }

    /// Bech32 decode with checksum, then the human-readable part must match
    /// the configured prefix without its `1` separator.
    fn check_address(&self, address: &str) -> std::result::Result<(), String> {
        let expected_hrp = self
            .address_prefix
            .strip_suffix('1')
            .unwrap_or(&self.address_prefix);
        let (hrp, _data) =
            bech32::decode(address).map_err(|e| format!("invalid bech32 address: {}", e))?;
        if hrp.as_str() != expected_hrp {
            return Err(format!("address must start with {}", self.address_prefix));
        }
        Ok(())
    }

    async fn ensure_available(&self) -> Result<()> {
        if self.state.lock().await.unavailable {
            return Err(ConversionError::Treasury("treasury unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TreasuryTransfer for InMemoryTreasury {
    async fn send_from_treasury(&self, request: TransferRequest) -> Result<TransferResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.unavailable {
            return Err(ConversionError::Treasury("treasury unavailable".to_string()));
        }

        if let Some(previous) = state.completed.get(&request.idempotency_key) {
            return Ok(previous.clone());
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Ok(TransferResult::rejected(
                &self.address,
                "simulated transfer failure",
            ));
        }
        if let Err(reason) = self.check_address(&request.destination) {
            return Ok(TransferResult::rejected(&self.address, reason));
        }

        let amount = request.amount.value();
        let balance = state.balances.entry(request.denom.clone()).or_default();
        if balance.available < amount {
            return Ok(TransferResult::rejected(
                &self.address,
                format!(
                    "insufficient funds: {} {} available",
                    balance.available, request.denom
                ),
            ));
        }
        balance.available -= amount;
        balance.total -= amount;

        state.sequence += 1;
        state.block_height += 1;
        let result = TransferResult {
            tx_hash: format!("0x{:064x}", state.sequence),
            block_height: state.block_height,
            treasury_address: self.address.clone(),
            success: true,
            error: None,
        };
        state
            .completed
            .insert(request.idempotency_key, result.clone());
        Ok(result)
    }

    async fn get_treasury_balance(&self, denom: &str) -> Result<TreasuryBalance> {
        self.ensure_available().await?;
        let state = self.state.lock().await;
        Ok(state.balances.get(denom).copied().unwrap_or_default())
    }

    async fn validate_address(&self, address: &str) -> Result<()> {
        self.ensure_available().await?;
        self.check_address(address)
            .map_err(|reason| ConversionError::rejected(ConversionErrorCode::InvalidAddress, reason))
    }
}

/// Payment verifier backed by a map of intent ID to status.
#[derive(Default, Clone)]
pub struct InMemoryPaymentVerifier {
    intents: Arc<RwLock<HashMap<String, PaymentIntentStatus>>>,
}

impl InMemoryPaymentVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, id: impl Into<String>, status: PaymentIntentStatus) {
        self.intents.write().await.insert(id.into(), status);
    }
}

#[async_trait]
impl PaymentVerifier for InMemoryPaymentVerifier {
    async fn get_payment_intent(&self, id: &str) -> Result<PaymentIntent> {
        let intents = self.intents.read().await;
        let status = intents
            .get(id)
            .copied()
            .ok_or_else(|| ConversionError::PaymentVerification(format!("unknown payment intent {}", id)))?;
        Ok(PaymentIntent {
            id: id.to_string(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quote::{ConversionQuote, CryptoAmount};
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    const DESTINATION: &str = "virtengine1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5eed0dg";
    const TREASURY: &str = "virtengine1amhwamhwamhwamhwamhwamhwamhwamhwthhu73";

    fn entry(key: &str) -> ConversionLedgerEntry {
        let quote = ConversionQuote {
            id: format!("quote-{key}"),
            fiat_amount: dec!(100.00),
            fiat_currency: "USD".to_string(),
            crypto_amount: CryptoAmount::new(10_000_000).unwrap(),
            crypto_denom: "uve".to_string(),
            destination_address: DESTINATION.to_string(),
            conversion_rate: dec!(0.1),
            fee: dec!(0),
            expires_at: Utc::now() + TimeDelta::minutes(5),
        };
        ConversionLedgerEntry::new(key, &quote, "uve", "pi_1", 3, BTreeMap::new(), Utc::now())
    }

    fn transfer(key: &str, amount: u64) -> TransferRequest {
        TransferRequest {
            destination: DESTINATION.to_string(),
            amount: CryptoAmount::new(amount).unwrap(),
            denom: "uve".to_string(),
            memo: "conversion:test".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_save_and_lookup() {
        let store = InMemoryLedgerStore::new();
        let e = entry("k1");
        store.save(&e).await.unwrap();

        assert_eq!(store.get_by_id(e.id).await.unwrap(), Some(e.clone()));
        assert_eq!(store.get_by_idempotency_key("k1").await.unwrap(), Some(e));
        assert!(store.get_by_idempotency_key("k2").await.unwrap().is_none());
        assert!(store.get_by_id(ConversionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_returns_independent_copies() {
        let store = InMemoryLedgerStore::new();
        let e = entry("k1");
        store.save(&e).await.unwrap();

        let mut copy = store.get_by_id(e.id).await.unwrap().unwrap();
        copy.status = ConversionStatus::Completed;
        copy.metadata.insert("x".into(), "y".into());

        let stored = store.get_by_id(e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversionStatus::Pending);
        assert!(stored.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_store_enforces_unique_idempotency_key() {
        let store = InMemoryLedgerStore::new();
        let first = entry("same");
        let second = entry("same");
        store.save(&first).await.unwrap();

        let err = store.save(&second).await.unwrap_err();
        assert!(matches!(err, ConversionError::DuplicateIdempotencyKey(k) if k == "same"));
        assert_eq!(store.len().await, 1);

        // Re-saving the owner is an update.
        store.save(&first).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_compare_and_set() {
        let store = InMemoryLedgerStore::new();
        let mut e = entry("k1");
        store.save(&e).await.unwrap();

        e.mark_executing(Utc::now()).unwrap();
        assert!(store.save_if_status(&e, ConversionStatus::Pending).await.unwrap());
        // Stored status is now Executing, so a second claim fails.
        assert!(!store.save_if_status(&e, ConversionStatus::Pending).await.unwrap());
        // Unknown entries are never written.
        assert!(!store.save_if_status(&entry("k2"), ConversionStatus::Pending).await.unwrap());
        assert!(store.get_by_idempotency_key("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_listings() {
        let store = InMemoryLedgerStore::new();
        let now = Utc::now();

        let ready = entry("ready");
        let mut waiting = entry("waiting");
        waiting.next_retry_at = Some(now + TimeDelta::minutes(1));
        let mut failed = entry("failed");
        failed.status = ConversionStatus::Failed;

        for e in [&ready, &waiting, &failed] {
            store.save(e).await.unwrap();
        }

        let pending = store.list_by_status(ConversionStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);

        let due = store.list_pending_ready_for_execution(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ready.id);

        let later = store
            .list_pending_ready_for_execution(now + TimeDelta::minutes(2))
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
    }

    #[tokio::test]
    async fn test_treasury_transfer_moves_funds() {
        let treasury = InMemoryTreasury::new(TREASURY);
        treasury.fund("uve", 1_000).await;

        let result = treasury.send_from_treasury(transfer("t1", 400)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.tx_hash, format!("0x{:064x}", 1));
        assert_eq!(result.block_height, 1);
        assert_eq!(result.treasury_address, TREASURY);
        assert_eq!(treasury.available("uve").await, 600);

        let balance = treasury.get_treasury_balance("uve").await.unwrap();
        assert_eq!(balance.total, 600);
    }

    #[tokio::test]
    async fn test_treasury_is_idempotent_per_key() {
        let treasury = InMemoryTreasury::new(TREASURY);
        treasury.fund("uve", 1_000).await;

        let first = treasury.send_from_treasury(transfer("t1", 400)).await.unwrap();
        let replay = treasury.send_from_treasury(transfer("t1", 400)).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(treasury.available("uve").await, 600);
        assert_eq!(treasury.transfer_count().await, 1);
    }

    #[tokio::test]
    async fn test_treasury_rejects_overdraft_and_injected_failures() {
        let treasury = InMemoryTreasury::new(TREASURY);
        treasury.fund("uve", 100).await;

        let result = treasury.send_from_treasury(transfer("t1", 400)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("insufficient funds"));

        treasury.fail_next_transfers(1).await;
        let result = treasury.send_from_treasury(transfer("t2", 50)).await.unwrap();
        assert!(!result.success);
        let result = treasury.send_from_treasury(transfer("t2", 50)).await.unwrap();
        assert!(result.success);
        assert_eq!(treasury.available("uve").await, 50);
    }

    #[tokio::test]
    async fn test_treasury_address_validation() {
        let treasury = InMemoryTreasury::new(TREASURY);
        assert!(treasury.validate_address(DESTINATION).await.is_ok());
        assert!(treasury.validate_address(TREASURY).await.is_ok());
        // Valid checksum, wrong human-readable part.
        assert!(treasury.validate_address("cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu").await.is_err());
        assert!(treasury.validate_address("virtengine1short").await.is_err());
        // One substituted character breaks the checksum.
        assert!(treasury.validate_address("virtengine1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5eed0dq").await.is_err());
        let unchecked = format!("virtengine1{}", "q".repeat(38));
        assert!(treasury.validate_address(&unchecked).await.is_err());

        let err = treasury.validate_address("virtengine1BAD").await.unwrap_err();
        assert_eq!(err.code(), ConversionErrorCode::InvalidAddress);
    }

    #[tokio::test]
    async fn test_treasury_prefix_is_configurable() {
        let treasury = InMemoryTreasury::new(TREASURY).with_address_prefix("cosmos1");
        assert!(treasury.validate_address("cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu").await.is_ok());
        assert!(treasury.validate_address(DESTINATION).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_treasury_fails_every_call() {
        let treasury = InMemoryTreasury::new(TREASURY);
        treasury.fund("uve", 1_000).await;
        treasury.set_unavailable(true).await;

        assert!(matches!(
            treasury.send_from_treasury(transfer("t1", 10)).await,
            Err(ConversionError::Treasury(_))
        ));
        assert!(matches!(
            treasury.get_treasury_balance("uve").await,
            Err(ConversionError::Treasury(_))
        ));
        assert!(matches!(
            treasury.validate_address(DESTINATION).await,
            Err(ConversionError::Treasury(_))
        ));

        treasury.set_unavailable(false).await;
        assert!(treasury.send_from_treasury(transfer("t1", 10)).await.unwrap().success);
        assert_eq!(treasury.available("uve").await, 990);
    }

    #[tokio::test]
    async fn test_payment_verifier_lookup() {
        let verifier = InMemoryPaymentVerifier::new();
        verifier.set_status("pi_1", PaymentIntentStatus::Succeeded).await;

        let intent = verifier.get_payment_intent("pi_1").await.unwrap();
        assert!(intent.status.is_successful());
        assert!(matches!(
            verifier.get_payment_intent("pi_missing").await,
            Err(ConversionError::PaymentVerification(_))
        ));
    }
}
