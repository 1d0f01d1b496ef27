use std::collections::BTreeMap;
use std::fmt;

use crate::common::digest::{digest_parts, Digest, Hashable};
use crate::consensus::Transaction;

/*
    Account balances, mutated only by delivery. An invalid transfer
    (unknown debit account, insufficient funds) is skipped outright: every
    replica sees the same balances at the same point in the order, so
    every replica independently makes the same decision.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    Applied,
    Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    accounts: BTreeMap<String, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    pub fn balance(&self, account: &str) -> Option<u64> {
        self.accounts.get(account).copied()
    }

    pub fn apply(&mut self, transaction: &Transaction) -> Outcome {
        match transaction {
            Transaction::Deposit { account, amount } => {
                let current = self.accounts.get(account).copied().unwrap_or(0);
                match current.checked_add(*amount) {
                    Some(next) => {
                        self.accounts.insert(account.clone(), next);
                        Outcome::Applied
                    }
                    None => Outcome::Skipped,
                }
            }
            Transaction::Transfer { from, to, amount } => {
                let Some(&debit) = self.accounts.get(from) else {
                    return Outcome::Skipped;
                };
                if debit < *amount {
                    return Outcome::Skipped;
                }
                let credit = if from == to {
                    debit - amount
                } else {
                    self.accounts.get(to).copied().unwrap_or(0)
                };
                let Some(credited) = credit.checked_add(*amount) else {
                    return Outcome::Skipped;
                };
                self.accounts.insert(from.clone(), debit - amount);
                self.accounts.insert(to.clone(), credited);
                Outcome::Applied
            }
        }
    }

    pub fn snapshot(&self) -> Balances {
        Balances(
            self.accounts
                .iter()
                .map(|(name, balance)| (name.clone(), *balance))
                .collect(),
        )
    }
}

/// Sorted `account -> balance` pairs as of one delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Balances(pub Vec<(String, u64)>);

impl fmt::Display for Balances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BALANCES")?;
        for (account, balance) in &self.0 {
            write!(f, " {account}:{balance}")?;
        }
        Ok(())
    }
}

impl Hashable for Balances {
    fn hash(&self) -> Digest {
        let lines: Vec<String> = self.0.iter().map(|(a, b)| format!("{a}:{b}")).collect();
        digest_parts(lines.iter().map(|l| l.as_bytes()))
    }
}
