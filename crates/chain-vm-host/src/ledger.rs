//! Ledger interface consumed by syscalls.
//!
//! The node supplies a [`TxContext`] per transaction. It scopes every state
//! operation to a contract name and records what the transaction wrote.
//! [`MemoryLedger`] and [`MemoryTxContext`] are an in-memory implementation
//! used by the CLI and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use chain_vm_common::{ContractId, LedgerError};

/// One row of a relational query, column name to value.
pub type Row = BTreeMap<String, Vec<u8>>;

/// A recorded state write. `value` is `None` for deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    /// Contract the key belongs to.
    pub contract: String,
    /// State key.
    pub key: Vec<u8>,
    /// Written value, `None` if deleted.
    pub value: Option<Vec<u8>>,
}

/// Cursor over key-value pairs in key order.
pub trait StateIterator: Send {
    /// Returns `true` if another pair is available.
    fn has_next(&mut self) -> bool;

    /// Return the next pair.
    fn next_pair(&mut self) -> Option<(Vec<u8>, Vec<u8>)>;
}

/// Cursor over query result rows.
pub trait ResultSet: Send {
    /// Returns `true` if another row is available.
    fn has_next(&mut self) -> bool;

    /// Return the next row.
    fn next_row(&mut self) -> Option<Row>;
}

/// Per-transaction view of the ledger.
///
/// Relational operations are optional; the defaults report them as
/// unsupported.
pub trait TxContext: Send + Sync {
    /// Identifier of the running transaction.
    fn tx_id(&self) -> &str;

    /// Read a value.
    fn get(&self, contract: &str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Write a value.
    fn put(&self, contract: &str, key: &[u8], value: &[u8]) -> Result<(), LedgerError>;

    /// Delete a value.
    fn delete(&self, contract: &str, key: &[u8]) -> Result<(), LedgerError>;

    /// Iterate keys in `[start, limit)`.
    fn select(
        &self,
        contract: &str,
        start: &[u8],
        limit: &[u8],
    ) -> Result<Box<dyn StateIterator>, LedgerError>;

    /// Iterate keys starting with `prefix`.
    fn select_prefix(
        &self,
        contract: &str,
        prefix: &[u8],
    ) -> Result<Box<dyn StateIterator>, LedgerError>;

    /// Run an update statement, returning the affected row count.
    fn execute_update(&self, _contract: &str, _sql: &str) -> Result<i32, LedgerError> {
        Err(LedgerError::Unsupported {
            operation: "execute_update".into(),
        })
    }

    /// Run a DDL statement.
    fn execute_ddl(&self, _contract: &str, _sql: &str) -> Result<(), LedgerError> {
        Err(LedgerError::Unsupported {
            operation: "execute_ddl".into(),
        })
    }

    /// Run a query returning many rows.
    fn query(&self, _contract: &str, _sql: &str) -> Result<Box<dyn ResultSet>, LedgerError> {
        Err(LedgerError::Unsupported {
            operation: "execute_query".into(),
        })
    }

    /// Run a query returning at most one row.
    fn query_one(&self, _contract: &str, _sql: &str) -> Result<Option<Row>, LedgerError> {
        Err(LedgerError::Unsupported {
            operation: "execute_query_one".into(),
        })
    }

    /// Look up a deployed contract and its bytecode by name.
    fn get_contract(&self, name: &str) -> Result<(ContractId, Arc<[u8]>), LedgerError>;

    /// Writes made by this transaction, in order.
    fn write_set(&self) -> Vec<WriteEntry>;
}

/// Iterator over an owned, already ordered list of pairs.
#[derive(Debug, Default)]
pub struct VecStateIterator {
    pairs: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    peeked: Option<(Vec<u8>, Vec<u8>)>,
}

impl VecStateIterator {
    /// Create an iterator over `pairs`.
    pub fn new(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            pairs: pairs.into_iter(),
            peeked: None,
        }
    }
}

impl StateIterator for VecStateIterator {
    fn has_next(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.pairs.next();
        }
        self.peeked.is_some()
    }

    fn next_pair(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.peeked.take().or_else(|| self.pairs.next())
    }
}

/// Result set over an owned list of rows.
#[derive(Debug, Default)]
pub struct VecResultSet {
    rows: std::collections::VecDeque<Row>,
}

impl VecResultSet {
    /// Create a result set over `rows`.
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }
}

impl ResultSet for VecResultSet {
    fn has_next(&mut self) -> bool {
        !self.rows.is_empty()
    }

    fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }
}

type StateKey = (String, Vec<u8>);

/// Committed in-memory state and deployed contracts.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<BTreeMap<StateKey, Vec<u8>>>,
    contracts: RwLock<HashMap<String, (ContractId, Arc<[u8]>)>>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register contract bytecode, replacing any earlier version.
    pub fn deploy(&self, contract: ContractId, bytecode: impl Into<Arc<[u8]>>) {
        self.contracts
            .write()
            .insert(contract.name.clone(), (contract, bytecode.into()));
    }

    /// Read a committed value.
    pub fn get(&self, contract: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.state
            .read()
            .get(&(contract.to_string(), key.to_vec()))
            .cloned()
    }

    /// Start a transaction against this ledger.
    pub fn begin(self: &Arc<Self>, tx_id: impl Into<String>) -> Arc<MemoryTxContext> {
        Arc::new(MemoryTxContext {
            ledger: Arc::clone(self),
            tx_id: tx_id.into(),
            pending: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
        })
    }
}

/// A transaction over a [`MemoryLedger`].
///
/// Writes are buffered and only reach the ledger on [`commit`](Self::commit).
#[derive(Debug)]
pub struct MemoryTxContext {
    ledger: Arc<MemoryLedger>,
    tx_id: String,
    pending: Mutex<BTreeMap<StateKey, Option<Vec<u8>>>>,
    writes: Mutex<Vec<WriteEntry>>,
}

impl MemoryTxContext {
    /// Apply buffered writes to the ledger.
    pub fn commit(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut state = self.ledger.state.write();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    state.insert(key, value);
                }
                None => {
                    state.remove(&key);
                }
            }
        }
    }

    fn record(&self, contract: &str, key: &[u8], value: Option<Vec<u8>>) {
        self.pending
            .lock()
            .insert((contract.to_string(), key.to_vec()), value.clone());
        self.writes.lock().push(WriteEntry {
            contract: contract.to_string(),
            key: key.to_vec(),
            value,
        });
    }

    /// Merged view of committed and pending pairs matching `filter`.
    fn scan(&self, contract: &str, filter: impl Fn(&[u8]) -> bool) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .ledger
            .state
            .read()
            .iter()
            .filter(|((c, k), _)| c == contract && filter(k))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();

        for ((c, k), v) in self.pending.lock().iter() {
            if c != contract || !filter(k) {
                continue;
            }
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }

        merged.into_iter().collect()
    }
}

impl TxContext for MemoryTxContext {
    fn tx_id(&self) -> &str {
        &self.tx_id
    }

    fn get(&self, contract: &str, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        let state_key = (contract.to_string(), key.to_vec());
        if let Some(pending) = self.pending.lock().get(&state_key) {
            return Ok(pending.clone());
        }
        Ok(self.ledger.state.read().get(&state_key).cloned())
    }

    fn put(&self, contract: &str, key: &[u8], value: &[u8]) -> Result<(), LedgerError> {
        self.record(contract, key, Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, contract: &str, key: &[u8]) -> Result<(), LedgerError> {
        self.record(contract, key, None);
        Ok(())
    }

    fn select(
        &self,
        contract: &str,
        start: &[u8],
        limit: &[u8],
    ) -> Result<Box<dyn StateIterator>, LedgerError> {
        let pairs = self.scan(contract, |k| k >= start && k < limit);
        Ok(Box::new(VecStateIterator::new(pairs)))
    }

    fn select_prefix(
        &self,
        contract: &str,
        prefix: &[u8],
    ) -> Result<Box<dyn StateIterator>, LedgerError> {
        let pairs = self.scan(contract, |k| k.starts_with(prefix));
        Ok(Box::new(VecStateIterator::new(pairs)))
    }

    fn get_contract(&self, name: &str) -> Result<(ContractId, Arc<[u8]>), LedgerError> {
        self.ledger
            .contracts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::ContractNotFound { name: name.into() })
    }

    fn write_set(&self) -> Vec<WriteEntry> {
        self.writes.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut iter: Box<dyn StateIterator>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while iter.has_next() {
            if let Some(pair) = iter.next_pair() {
                out.push(pair);
            }
        }
        out
    }

    #[test]
    fn test_pending_writes_visible_before_commit() {
        let ledger = MemoryLedger::new();
        let tx = ledger.begin("tx1");

        tx.put("counter", b"count#a", &[1, 0, 0, 0]).unwrap();

        assert_eq!(tx.get("counter", b"count#a").unwrap(), Some(vec![1, 0, 0, 0]));
        assert_eq!(tx.get("other", b"count#a").unwrap(), None);
        assert_eq!(ledger.get("counter", b"count#a"), None);

        tx.commit();
        assert_eq!(ledger.get("counter", b"count#a"), Some(vec![1, 0, 0, 0]));
    }

    #[test]
    fn test_delete_and_write_set_order() {
        let ledger = MemoryLedger::new();
        let setup = ledger.begin("tx0");
        setup.put("c", b"k", b"v").unwrap();
        setup.commit();

        let tx = ledger.begin("tx1");
        tx.put("c", b"a", b"1").unwrap();
        tx.delete("c", b"k").unwrap();

        assert_eq!(tx.get("c", b"k").unwrap(), None);
        let writes = tx.write_set();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].key, b"a");
        assert_eq!(writes[1].value, None);
    }

    #[test]
    fn test_range_and_prefix_iteration() {
        let ledger = MemoryLedger::new();
        let setup = ledger.begin("tx0");
        for key in ["a1", "a2", "b1", "b2"] {
            setup.put("c", key.as_bytes(), key.as_bytes()).unwrap();
        }
        setup.commit();

        let tx = ledger.begin("tx1");
        tx.put("c", b"a3", b"a3").unwrap();
        tx.delete("c", b"a1").unwrap();

        let keys: Vec<Vec<u8>> = drain(tx.select_prefix("c", b"a").unwrap())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a2".to_vec(), b"a3".to_vec()]);

        let range = drain(tx.select("c", b"a3", b"b2").unwrap());
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, b"a3");
        assert_eq!(range[1].0, b"b1");
    }

    #[test]
    fn test_contract_lookup() {
        let ledger = MemoryLedger::new();
        ledger.deploy(ContractId::new("counter", "1.0.0"), vec![0u8, 97, 115, 109]);
        let tx = ledger.begin("tx1");

        let (id, code) = tx.get_contract("counter").unwrap();
        assert_eq!(id.version, "1.0.0");
        assert_eq!(code.len(), 4);

        let err = tx.get_contract("missing").unwrap_err();
        assert_eq!(err, LedgerError::ContractNotFound { name: "missing".into() });
    }

    #[test]
    fn test_sql_unsupported_by_default() {
        let ledger = MemoryLedger::new();
        let tx = ledger.begin("tx1");

        assert!(matches!(
            tx.execute_update("c", "update t set a = 1"),
            Err(LedgerError::Unsupported { .. })
        ));
        assert!(tx.query_one("c", "select 1").is_err());
    }

    #[test]
    fn test_vec_result_set() {
        let mut row = Row::new();
        row.insert("id".into(), b"1".to_vec());
        let mut rs = VecResultSet::new(vec![row.clone()]);

        assert!(rs.has_next());
        assert_eq!(rs.next_row(), Some(row));
        assert!(!rs.has_next());
    }
}
