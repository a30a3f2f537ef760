use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

/// Registry account as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub login: String,
    pub password: String,
    /// Remaining registry requests this account may issue during the run.
    #[serde(alias = "requests_limit")]
    pub request_quota: u64,
    /// Rotate to a fresh session after this many lookups even if quota remains.
    #[serde(default)]
    pub max_requests_per_session: Option<u64>,
}

impl Credential {
    pub fn new(login: impl Into<String>, password: impl Into<String>, request_quota: u64) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
            request_quota,
            max_requests_per_session: None,
        }
    }
}

#[derive(Debug)]
pub struct PooledCredential {
    index: usize,
    login: String,
    password: String,
    max_requests_per_session: Option<u64>,
    remaining: AtomicU64,
    disabled: AtomicBool,
}

impl PooledCredential {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn max_requests_per_session(&self) -> Option<u64> {
        self.max_requests_per_session
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Atomic check-and-decrement of one request unit.
    pub fn try_reserve(&self) -> bool {
        if self.is_disabled() {
            return false;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    pub fn refund(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }
}

/// Round-robin pool of registry accounts shared by all workers of one run.
#[derive(Debug)]
pub struct CredentialPool {
    slots: Vec<Arc<PooledCredential>>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let slots = credentials
            .into_iter()
            .enumerate()
            .map(|(index, credential)| {
                Arc::new(PooledCredential {
                    index,
                    login: credential.login,
                    password: credential.password,
                    max_requests_per_session: credential.max_requests_per_session,
                    remaining: AtomicU64::new(credential.request_quota),
                    disabled: AtomicBool::new(false),
                })
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserves one request unit on the next credential in rotation that still has quota.
    ///
    /// Every slot is inspected once per call, so `None` means the whole pool is exhausted
    /// (or disabled) and callers must stop opening sessions.
    pub fn try_reserve_next(&self) -> Option<Arc<PooledCredential>> {
        let count = self.slots.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::SeqCst);
        (0..count)
            .map(|offset| &self.slots[(start + offset) % count])
            .find(|slot| slot.try_reserve())
            .map(Arc::clone)
    }

    /// Takes a credential out of rotation for the rest of the run.
    pub fn disable(&self, credential: &PooledCredential) {
        if let Some(slot) = self.slots.get(credential.index) {
            slot.disabled.store(true, Ordering::SeqCst);
        }
    }

    pub fn remaining_capacity(&self) -> u64 {
        self.slots
            .iter()
            .filter(|slot| !slot.is_disabled())
            .map(|slot| slot.remaining())
            .sum()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_capacity() == 0
    }

    pub fn get(&self, index: usize) -> Option<&Arc<PooledCredential>> {
        self.slots.get(index)
    }
}
