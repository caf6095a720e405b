use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use alloy::primitives::Address;
use tracing::{debug, warn};

use crate::error::{BarrageError, NonceConflictKind};

struct AccountNonces {
    /// Next fresh nonce; authoritative between network syncs.
    next: u64,
    /// Nonces re-offered by reconciliation, served before `next`.
    reoffered: BTreeSet<u64>,
    /// Serializes allocate+submit per account when pipelining is off.
    gate: Arc<tokio::sync::Mutex<()>>,
}

/// Hands out strictly increasing, never-repeating nonces per account
/// without touching the network. Accounts must be seeded once via
/// [`NonceAllocator::reconcile`] with the chain's confirmed count;
/// after that the local counter is authoritative until the next
/// reconciliation.
#[derive(Default)]
pub struct NonceAllocator {
    accounts: Mutex<HashMap<Address, AccountNonces>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next nonce for `address`. Never blocks on the
    /// network; only contends on the internal lock. Re-offered nonces
    /// (from reconciliation) are drained in increasing order before
    /// fresh ones.
    pub fn allocate(&self, address: Address) -> Result<u64, BarrageError> {
        let mut accounts = self.accounts.lock().expect("nonce lock poisoned");
        let entry = accounts
            .get_mut(&address)
            .ok_or(BarrageError::NonceConflict {
                address,
                kind: NonceConflictKind::Unseeded,
            })?;
        let nonce = match entry.reoffered.pop_first() {
            Some(n) => n,
            None => {
                let n = entry.next;
                entry.next += 1;
                n
            }
        };
        debug!(%address, nonce, "allocated nonce");
        Ok(nonce)
    }

    /// Resyncs the local counter with the chain's confirmed
    /// transaction count and re-offers `unconfirmed` nonces whose
    /// transactions never landed. Idempotent: repeating the call with
    /// the same arguments leaves the state unchanged.
    pub fn reconcile(&self, address: Address, confirmed: u64, unconfirmed: &[u64]) {
        let mut accounts = self.accounts.lock().expect("nonce lock poisoned");
        let entry = accounts.entry(address).or_insert_with(|| AccountNonces {
            next: confirmed,
            reoffered: BTreeSet::new(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        });

        if confirmed > entry.next {
            warn!(
                %address,
                local = entry.next,
                confirmed,
                "chain is ahead of local counter, resyncing"
            );
            entry.next = confirmed;
        }

        // Anything below the confirmed count landed onchain and must
        // never be offered again.
        entry.reoffered.retain(|n| *n >= confirmed);
        for &nonce in unconfirmed {
            if nonce >= confirmed && nonce < entry.next {
                entry.reoffered.insert(nonce);
            }
        }
        debug!(
            %address,
            confirmed,
            reoffered = entry.reoffered.len(),
            "reconciled nonce state"
        );
    }

    pub fn is_seeded(&self, address: Address) -> bool {
        self.accounts
            .lock()
            .expect("nonce lock poisoned")
            .contains_key(&address)
    }

    /// The submission gate for `address`. Held across allocation and
    /// the first submit attempt when pipelining is disabled, so nonces
    /// reach the wire in allocation order.
    pub fn submit_gate(&self, address: Address) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.accounts
            .lock()
            .expect("nonce lock poisoned")
            .get(&address)
            .map(|entry| entry.gate.clone())
    }

    /// Next nonce that would be handed out for `address`, re-offers
    /// included.
    pub fn peek(&self, address: Address) -> Option<u64> {
        let accounts = self.accounts.lock().expect("nonce lock poisoned");
        accounts
            .get(&address)
            .map(|entry| entry.reoffered.first().copied().unwrap_or(entry.next))
    }
}
