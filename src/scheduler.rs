use anyhow::Result;
use futures::{StreamExt, stream::FuturesUnordered};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    common::{min_request_interval, wait_for_rate_slot},
    constants::{DEFAULT_MAX_KEY_ATTEMPTS, DEFAULT_THREAD_LIMIT},
    credentials::{Credential, CredentialPool, PooledCredential},
    model::{LookupKey, ResolvedRecord},
    progress::ProgressSink,
    session::{LookupOutcome, RegistrySession, SessionFactory, SrzEndpoint, SrzSessionFactory},
};

/// What happens to the request unit charged for a lookup that failed in transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundPolicy {
    #[default]
    NoRefund,
    RefundOnTransportFailure,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub thread_limit: usize,
    /// Total lookup attempts allowed per key; transport failures requeue below this bound.
    pub max_key_attempts: u32,
    pub refund_policy: RefundPolicy,
    /// Global request start rate shared by all workers; 0 disables throttling.
    pub requests_per_second: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            thread_limit: DEFAULT_THREAD_LIMIT,
            max_key_attempts: DEFAULT_MAX_KEY_ATTEMPTS,
            refund_policy: RefundPolicy::default(),
            requests_per_second: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub resolved: Vec<ResolvedRecord>,
    pub requested: usize,
    pub unresolved: usize,
    pub not_found: usize,
    pub transport_failures: usize,
    /// Keys that used up `max_key_attempts` on transport failures.
    pub abandoned: usize,
    pub workers: usize,
    pub pool_exhausted: bool,
    pub interrupted: bool,
}

impl ReconcileOutcome {
    pub fn summary(&self) -> String {
        format!(
            "requested={} resolved={} not_found={} unresolved={} transport_failures={} workers={}{}{}",
            self.requested,
            self.resolved.len(),
            self.not_found,
            self.unresolved,
            self.transport_failures,
            self.workers,
            if self.pool_exhausted {
                " (credential quota exhausted)"
            } else {
                ""
            },
            if self.interrupted { " (interrupted)" } else { "" },
        )
    }
}

struct BacklogEntry {
    key: LookupKey,
    attempts: u32,
}

struct Backlog {
    entries: Mutex<Vec<BacklogEntry>>,
}

impl Backlog {
    fn new(keys: Vec<LookupKey>) -> Self {
        let mut entries: Vec<BacklogEntry> = keys
            .into_iter()
            .map(|key| BacklogEntry { key, attempts: 0 })
            .collect();
        // Popped from the back; keep the caller's order.
        entries.reverse();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn pop(&self) -> Option<BacklogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn push(&self, entry: BacklogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct ActiveSession<S> {
    session: S,
    credential: Arc<PooledCredential>,
    requests: u64,
}

impl<S> ActiveSession<S> {
    /// Reserves the unit for the next lookup on this session's own credential.
    fn take_request_unit(&mut self) -> bool {
        if self
            .credential
            .max_requests_per_session()
            .is_some_and(|cap| self.requests >= cap)
        {
            return false;
        }
        self.credential.try_reserve()
    }
}

struct RunState<'a> {
    pool: &'a CredentialPool,
    backlog: Backlog,
    options: &'a SchedulerOptions,
    progress: &'a dyn ProgressSink,
    shutdown: &'a AtomicBool,
    resolved: Mutex<Vec<ResolvedRecord>>,
    total: usize,
    not_found: AtomicUsize,
    transport_failures: AtomicUsize,
    abandoned: AtomicUsize,
    pool_exhausted: AtomicBool,
    next_slot: Arc<AsyncMutex<Instant>>,
    min_interval: Duration,
}

/// Drains `keys` through `min(thread_limit, keys)` workers sharing `pool`.
///
/// Always completes: rejected credentials, transport failures and quota exhaustion
/// only shrink the result, reported through `unresolved`.
pub async fn reconcile<F: SessionFactory>(
    factory: &F,
    keys: Vec<LookupKey>,
    pool: &CredentialPool,
    options: &SchedulerOptions,
    progress: &dyn ProgressSink,
    shutdown: &AtomicBool,
) -> ReconcileOutcome {
    let total = keys.len();
    let worker_count = options.thread_limit.max(1).min(total);

    let run = RunState {
        pool,
        backlog: Backlog::new(keys),
        options,
        progress,
        shutdown,
        resolved: Mutex::new(Vec::new()),
        total,
        not_found: AtomicUsize::new(0),
        transport_failures: AtomicUsize::new(0),
        abandoned: AtomicUsize::new(0),
        pool_exhausted: AtomicBool::new(false),
        next_slot: Arc::new(AsyncMutex::new(Instant::now())),
        min_interval: min_request_interval(options.requests_per_second),
    };

    info!(
        keys = total,
        workers = worker_count,
        credentials = pool.len(),
        capacity = pool.remaining_capacity(),
        "starting registry reconciliation"
    );

    let mut workers: FuturesUnordered<_> = (0..worker_count)
        .map(|worker_id| run_worker(worker_id, factory, &run))
        .collect();
    while workers.next().await.is_some() {}
    drop(workers);

    let RunState {
        resolved,
        backlog,
        not_found,
        transport_failures,
        abandoned,
        pool_exhausted,
        ..
    } = run;
    let resolved = resolved.into_inner().unwrap_or_else(PoisonError::into_inner);

    let interrupted = shutdown.load(Ordering::SeqCst) && backlog.len() > 0;
    let outcome = ReconcileOutcome {
        requested: total,
        unresolved: total - resolved.len(),
        resolved,
        not_found: not_found.into_inner(),
        transport_failures: transport_failures.into_inner(),
        abandoned: abandoned.into_inner(),
        workers: worker_count,
        pool_exhausted: pool_exhausted.into_inner(),
        interrupted,
    };
    progress.report(
        &format!("done: {}", outcome.summary()),
        outcome.resolved.len(),
        total,
    );
    outcome
}

/// Convenience entry point that talks to the real registry.
pub async fn reconcile_with_registry(
    keys: Vec<LookupKey>,
    credentials: Vec<Credential>,
    endpoint: SrzEndpoint,
    options: &SchedulerOptions,
    progress: &dyn ProgressSink,
    shutdown: &AtomicBool,
) -> Result<ReconcileOutcome> {
    let factory = SrzSessionFactory::new(endpoint)?;
    let pool = CredentialPool::new(credentials);
    Ok(reconcile(&factory, keys, &pool, options, progress, shutdown).await)
}

async fn run_worker<F: SessionFactory>(worker_id: usize, factory: &F, run: &RunState<'_>) {
    let mut current: Option<ActiveSession<F::Session>> = None;

    loop {
        if run.shutdown.load(Ordering::SeqCst) {
            debug!(worker_id, "cancellation requested, stopping worker");
            break;
        }
        let Some(mut entry) = run.backlog.pop() else {
            break;
        };

        // A fresh session is paid for by the unit the pool reserved while acquiring it.
        let needs_rotation = match current.as_mut() {
            Some(active) => !active.take_request_unit(),
            None => true,
        };
        if needs_rotation {
            if let Some(stale) = current.take() {
                close_quietly(worker_id, stale).await;
            }
            match acquire_session(worker_id, factory, run).await {
                Some(fresh) => current = Some(fresh),
                None => {
                    run.backlog.push(entry);
                    break;
                }
            }
        }
        let Some(active) = current.as_mut() else {
            run.backlog.push(entry);
            break;
        };

        wait_for_rate_slot(&run.next_slot, run.min_interval).await;
        active.requests += 1;
        entry.attempts += 1;

        match active.session.lookup(&entry.key.insurance_number).await {
            Ok(LookupOutcome::Found(record)) => {
                let resolved = {
                    let mut records = run.resolved.lock().unwrap_or_else(PoisonError::into_inner);
                    records.push(record);
                    records.len()
                };
                run.progress.report(
                    &format!("resolved {resolved} of {}", run.total),
                    resolved,
                    run.total,
                );
            }
            Ok(LookupOutcome::NotFound) => {
                run.not_found.fetch_add(1, Ordering::SeqCst);
                debug!(
                    worker_id,
                    insurance_number = %entry.key.insurance_number,
                    "registry has no such person"
                );
            }
            Err(err) => {
                run.transport_failures.fetch_add(1, Ordering::SeqCst);
                warn!(
                    worker_id,
                    login = active.credential.login(),
                    insurance_number = %entry.key.insurance_number,
                    attempt = entry.attempts,
                    "registry lookup failed, discarding session: {err:#}"
                );
                if run.options.refund_policy == RefundPolicy::RefundOnTransportFailure {
                    active.credential.refund();
                }
                if let Some(dead) = current.take() {
                    close_quietly(worker_id, dead).await;
                }
                if entry.attempts < run.options.max_key_attempts {
                    run.backlog.push(entry);
                } else {
                    run.abandoned.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    if let Some(active) = current.take() {
        close_quietly(worker_id, active).await;
    }
}

/// Reserves a unit on the next credential and authenticates a fresh session with it.
///
/// Credentials that fail to authenticate are disabled, so each call makes at most one
/// attempt per credential before reporting the pool as exhausted. A session that cannot
/// be opened says nothing about the credential: its unit is refunded and the worker stops.
async fn acquire_session<F: SessionFactory>(
    worker_id: usize,
    factory: &F,
    run: &RunState<'_>,
) -> Option<ActiveSession<F::Session>> {
    let mut tried = HashSet::new();
    while tried.len() < run.pool.len() {
        if run.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        let Some(credential) = run.pool.try_reserve_next() else {
            break;
        };
        if !tried.insert(credential.index()) {
            // A credential came around twice without a usable session in between.
            debug!(worker_id, "full credential rotation without a session");
            break;
        }

        let mut session = match factory.open() {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    worker_id,
                    login = credential.login(),
                    "failed opening registry session, worker stops: {err:#}"
                );
                credential.refund();
                return None;
            }
        };
        match session.authenticate(&credential).await {
            Ok(()) => {
                debug!(
                    worker_id,
                    login = credential.login(),
                    remaining = credential.remaining(),
                    "registry session authenticated"
                );
                return Some(ActiveSession {
                    session,
                    credential,
                    requests: 0,
                });
            }
            Err(err) => {
                warn!(
                    worker_id,
                    login = credential.login(),
                    "registry authentication failed, disabling credential: {err:#}"
                );
                run.pool.disable(&credential);
                if let Err(err) = session.close().await {
                    debug!(worker_id, "ignoring close failure: {err:#}");
                }
            }
        }
    }

    run.pool_exhausted.store(true, Ordering::SeqCst);
    info!(worker_id, "no credential can be reserved, worker stops");
    None
}

async fn close_quietly<S: RegistrySession>(worker_id: usize, mut active: ActiveSession<S>) {
    if let Err(err) = active.session.close().await {
        warn!(
            worker_id,
            login = active.credential.login(),
            "registry logout failed: {err:#}"
        );
    }
}
