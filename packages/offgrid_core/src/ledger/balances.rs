//! Account balances (`balances.json`)
//!
//! The file holds the balances together with the ids of every effect
//! already applied to them. Both change in one atomic write, so replaying a
//! finalization or a settlement credit after a crash is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Account, LedgerError, Transaction};
use crate::persist::{self, PersistError};

pub type Balances = BTreeMap<Account, f64>;

/// Fee charged by the wallet `transfer` primitive.
pub const DEFAULT_FEE_RATE: f64 = 0.001;

pub fn default_balances() -> Balances {
    let mut balances = Balances::new();
    balances.insert(Account::System, 0.0);
    balances
}

#[derive(Debug, Serialize, Deserialize)]
struct BalanceFile {
    #[serde(default = "default_balances")]
    accounts: Balances,
    /// Transaction ids and settlement keys whose effects are in `accounts`
    #[serde(default)]
    applied: BTreeSet<String>,
}

impl Default for BalanceFile {
    fn default() -> Self {
        Self {
            accounts: default_balances(),
            applied: BTreeSet::new(),
        }
    }
}

/// Result of a wallet transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub src: Account,
    pub dst: Account,
    pub amount: f64,
    pub fee: f64,
    pub net_received: f64,
}

#[derive(Debug)]
pub struct BalanceBook {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BalanceBook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, LedgerError> {
        self.lock
            .lock()
            .map_err(|e| LedgerError::Storage(PersistError::LockPoisoned(e.to_string())))
    }

    fn load_file(&self) -> Result<BalanceFile, LedgerError> {
        Ok(persist::read_json_or(&self.path, BalanceFile::default)?)
    }

    fn save_file(&self, file: &BalanceFile) -> Result<(), LedgerError> {
        Ok(persist::write_json_atomic(&self.path, file)?)
    }

    pub fn load(&self) -> Result<Balances, LedgerError> {
        Ok(self.load_file()?.accounts)
    }

    pub fn balance(&self, account: &Account) -> Result<f64, LedgerError> {
        Ok(self.load()?.get(account).copied().unwrap_or(0.0))
    }

    /// Whether the effect recorded under `key` has been applied.
    pub fn is_applied(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.load_file()?.applied.contains(key))
    }

    pub fn credit(&self, account: &Account, amount: f64) -> Result<f64, LedgerError> {
        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        let entry = file.accounts.entry(account.clone()).or_insert(0.0);
        *entry += amount;
        let now = *entry;
        self.save_file(&file)?;
        Ok(now)
    }

    /// Apply a set of credits once under `key`. Returns `false`, changing
    /// nothing, if `key` was applied before.
    pub fn credit_once(&self, key: &str, credits: &[(Account, f64)]) -> Result<bool, LedgerError> {
        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        if file.applied.contains(key) {
            log::debug!("credits {} already applied", key);
            return Ok(false);
        }
        for (account, amount) in credits {
            *file.accounts.entry(account.clone()).or_insert(0.0) += amount;
        }
        file.applied.insert(key.to_string());
        self.save_file(&file)?;
        Ok(true)
    }

    /// Debit without overdraft.
    pub fn debit(&self, account: &Account, amount: f64) -> Result<f64, LedgerError> {
        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        let available = file.accounts.get(account).copied().unwrap_or(0.0);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: account.to_string(),
                needed: amount,
                available,
            });
        }
        file.accounts.insert(account.clone(), available - amount);
        self.save_file(&file)?;
        Ok(available - amount)
    }

    /// Wallet transfer: `amount` leaves `src`, `amount * fee_rate` goes to the
    /// system account and the rest to `dst`.
    pub fn transfer(
        &self,
        src: &Account,
        dst: &Account,
        amount: f64,
        fee_rate: f64,
    ) -> Result<TransferReceipt, LedgerError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LedgerError::InvalidAmount(amount.to_string()));
        }
        let fee = amount * fee_rate;
        let net = amount - fee;

        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        let balances = &mut file.accounts;
        let available = balances.get(src).copied().unwrap_or(0.0);
        if !src.is_mint() && available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: src.to_string(),
                needed: amount,
                available,
            });
        }
        balances.insert(src.clone(), available - amount);
        *balances.entry(dst.clone()).or_insert(0.0) += net;
        *balances.entry(Account::System).or_insert(0.0) += fee;
        self.save_file(&file)?;

        Ok(TransferReceipt {
            src: src.clone(),
            dst: dst.clone(),
            amount,
            fee,
            net_received: net,
        })
    }

    /// Apply a finalized transaction's effects and record its id in the same
    /// write. Returns `false` if the id was already applied. Nothing is
    /// written when the source lacks funds.
    pub fn apply_transaction(&self, tx: &Transaction) -> Result<bool, LedgerError> {
        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        if file.applied.contains(&tx.id) {
            return Ok(false);
        }
        let body = &tx.body;
        let needed = body.amount + body.fee;

        let balances = &mut file.accounts;
        let available = balances.get(&body.src).copied().unwrap_or(0.0);
        if !body.src.is_mint() && available < needed {
            return Err(LedgerError::InsufficientFunds {
                account: body.src.to_string(),
                needed,
                available,
            });
        }
        balances.insert(body.src.clone(), available - needed);
        *balances.entry(body.dst.clone()).or_insert(0.0) += body.amount;
        *balances.entry(Account::System).or_insert(0.0) += body.fee;
        file.applied.insert(tx.id.clone());
        self.save_file(&file)?;
        Ok(true)
    }

    /// Read-modify-write under the book's lock. Used by gossip reconciliation.
    pub fn update<R>(&self, f: impl FnOnce(&mut Balances) -> R) -> Result<R, LedgerError> {
        let _guard = self.lock()?;
        let mut file = self.load_file()?;
        let result = f(&mut file.accounts);
        self.save_file(&file)?;
        Ok(result)
    }
}
