//! Credential transactions: reader + lock + whitelist
//!
//! The controller runs at most one credential transaction at a time. A
//! transaction is either an authentication (waiting for the lock to finish
//! its unlock-hold-relock cycle) or an enrollment (waiting for a card and
//! then for the whitelist decision). Both are guarded by the same timeout,
//! and each resolves to a fixed safe state when it expires:
//!
//! - authentication times out **locked**
//! - enrollment times out back in **authentication mode**, nothing stored
//!
//! Waiting is never a blocked call. It is the [`Transaction`] value, looked
//! at again on every [`tick`](SecurityController::tick).

use log::{debug, info, warn};

use crate::credential::Credential;
use crate::lock::{Actuator, LockActuator, LockState, LockTiming};
use crate::protocol::{CorrelationId, Publisher};
use crate::storage::PersistentStore;
use crate::whitelist::{WhitelistManager, WhitelistMode};

/// Deadline for any credential transaction
pub const TIMEOUT_MS: u64 = 5000;

/// Proximity tag reader
pub trait CredentialReader {
    /// Non-blocking poll for a newly presented tag
    fn scan(&mut self) -> Option<Credential>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Authentication,
    Enrollment,
}

/// What an in-flight transaction is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    /// Granted; waiting for the lock to come back to `Locked`
    LockCycle,
    /// Enrollment window open, no card presented yet
    EnrollmentScan,
    /// Card staged for enrollment, waiting for the whitelist decision
    EnrollmentDecision,
}

impl Awaiting {
    pub fn kind(self) -> TransactionKind {
        match self {
            Awaiting::LockCycle => TransactionKind::Authentication,
            Awaiting::EnrollmentScan | Awaiting::EnrollmentDecision => TransactionKind::Enrollment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Lock cycle finished, or the enrollment decision arrived
    Completed,
    /// Unknown credential, locked on the spot
    Rejected,
    /// Deadline passed; safe state applied
    TimedOut,
}

/// At most one transaction, so "authenticating and enrolling at once"
/// cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Idle,
    Pending { awaiting: Awaiting, started_at: u64 },
    Resolved { kind: TransactionKind, resolution: Resolution },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityConfig {
    pub timeout_ms: u64,
    pub lock: LockTiming,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: TIMEOUT_MS,
            lock: LockTiming::default(),
        }
    }
}

pub struct SecurityController<R: CredentialReader, A: Actuator> {
    reader: R,
    lock: LockActuator<A>,
    whitelist: WhitelistManager,
    transaction: Transaction,
    timeout_ms: u64,
}

impl<R: CredentialReader, A: Actuator> SecurityController<R, A> {
    /// Take ownership of the reader and actuator; the lock starts closed
    pub fn new(reader: R, actuator: A, device_id: &str, config: SecurityConfig) -> Self {
        // Each lock phase only advances on the first tick past its delay, so a
        // deadline equal to the cycle is missed at almost any tick spacing.
        if config.timeout_ms <= config.lock.cycle_ms() {
            warn!(
                "Transaction timeout {} ms does not exceed the {} ms lock cycle; grants will time out",
                config.timeout_ms,
                config.lock.cycle_ms()
            );
        }
        Self {
            reader,
            lock: LockActuator::new(actuator, config.lock),
            whitelist: WhitelistManager::new(device_id),
            transaction: Transaction::Idle,
            timeout_ms: config.timeout_ms,
        }
    }

    /// Drop any in-flight transaction and enrollment window, close the lock.
    ///
    /// Used when the broker connection is (re)established.
    pub fn reinitialize(&mut self, device_id: &str, now_ms: u64) {
        info!("Security controller reinitialized");
        self.whitelist = WhitelistManager::new(device_id);
        self.transaction = Transaction::Idle;
        self.lock.lock(now_ms);
    }

    pub fn transaction(&self) -> Transaction {
        self.transaction
    }

    pub fn is_awaiting_auth(&self) -> bool {
        self.awaiting_kind() == Some(TransactionKind::Authentication)
    }

    pub fn is_awaiting_enroll(&self) -> bool {
        self.awaiting_kind() == Some(TransactionKind::Enrollment)
    }

    fn awaiting_kind(&self) -> Option<TransactionKind> {
        match self.transaction {
            Transaction::Pending { awaiting, .. } => Some(awaiting.kind()),
            _ => None,
        }
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    pub fn lock(&self) -> &LockActuator<A> {
        &self.lock
    }

    pub fn whitelist(&self) -> &WhitelistManager {
        &self.whitelist
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Open the enrollment window for request `id`.
    ///
    /// A window still waiting for its card is taken over by the newer
    /// request, which restarts the deadline. Rejected while a grant is
    /// running or a card is already staged for enrollment.
    pub fn enable_register_mode(&mut self, id: CorrelationId, now_ms: u64) -> bool {
        match self.transaction {
            Transaction::Pending {
                awaiting: Awaiting::EnrollmentScan,
                ..
            } => debug!("Enrollment window handed to request {}", id),
            Transaction::Pending { awaiting, .. } => {
                warn!("Enrollment request {} rejected, {:?} in flight", id, awaiting);
                return false;
            }
            _ => {}
        }
        self.whitelist.enter_registration(id);
        self.transaction = Transaction::Pending {
            awaiting: Awaiting::EnrollmentScan,
            started_at: now_ms,
        };
        true
    }

    pub fn revoke<S: PersistentStore + ?Sized>(&mut self, storage: &mut S, uid: &Credential) -> bool {
        self.whitelist.revoke(storage, uid)
    }

    /// One polling step: lock, whitelist, deadlines, then the reader
    pub fn tick<S, P>(&mut self, now_ms: u64, storage: &mut S, outbox: &mut P)
    where
        S: PersistentStore + ?Sized,
        P: Publisher + ?Sized,
    {
        self.lock.tick(now_ms);

        self.whitelist.tick(storage, outbox);
        if let Some(outcome) = self.whitelist.take_response() {
            if self.is_awaiting_enroll() {
                debug!("Enrollment resolved: {:?}", outcome);
                self.whitelist.exit_registration();
                self.resolve(TransactionKind::Enrollment, Resolution::Completed);
            }
        }

        if let Transaction::Pending { awaiting, started_at } = self.transaction {
            let expired = now_ms.saturating_sub(started_at) >= self.timeout_ms;
            match awaiting {
                Awaiting::LockCycle => {
                    // Completion wins a tie with the deadline.
                    if self.lock.is_locked() {
                        self.resolve(TransactionKind::Authentication, Resolution::Completed);
                    } else if expired {
                        warn!("Authentication timed out, forcing lock");
                        self.lock.lock(now_ms);
                        self.resolve(TransactionKind::Authentication, Resolution::TimedOut);
                    }
                }
                Awaiting::EnrollmentScan | Awaiting::EnrollmentDecision => {
                    if expired {
                        warn!("Enrollment timed out, back to authentication");
                        self.whitelist.exit_registration();
                        self.resolve(TransactionKind::Enrollment, Resolution::TimedOut);
                    }
                }
            }
        }

        if self.accepts_scan() {
            if let Some(uid) = self.reader.scan() {
                self.on_scan(uid, now_ms, storage);
            }
        }
    }

    fn accepts_scan(&self) -> bool {
        match self.transaction {
            Transaction::Idle | Transaction::Resolved { .. } => true,
            // The open enrollment window is itself waiting for this scan.
            Transaction::Pending { awaiting, .. } => awaiting == Awaiting::EnrollmentScan,
        }
    }

    fn on_scan<S: PersistentStore + ?Sized>(&mut self, uid: Credential, now_ms: u64, storage: &mut S) {
        debug!("Scanned {}", uid.to_hex());

        if self.whitelist.mode() == WhitelistMode::Registration {
            let started_at = match self.transaction {
                Transaction::Pending { started_at, .. } => started_at,
                _ => now_ms,
            };
            self.whitelist.stage(uid);
            self.transaction = Transaction::Pending {
                awaiting: Awaiting::EnrollmentDecision,
                started_at,
            };
            return;
        }

        let granted = self.whitelist.is_whitelisted(storage, &uid);
        self.whitelist.stage(uid);
        if !granted {
            self.lock.lock(now_ms);
            self.resolve(TransactionKind::Authentication, Resolution::Rejected);
        } else if self.lock.unlock(now_ms) {
            self.transaction = Transaction::Pending {
                awaiting: Awaiting::LockCycle,
                started_at: now_ms,
            };
        } else {
            warn!("Granted credential but lock busy in {:?}", self.lock.state());
        }
    }

    fn resolve(&mut self, kind: TransactionKind, resolution: Resolution) {
        info!("{:?} transaction {:?}", kind, resolution);
        self.transaction = Transaction::Resolved { kind, resolution };
    }
}
