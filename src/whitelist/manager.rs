//! Authentication / enrollment decisions over the whitelist
//!
//! The manager holds the most recent scan and decides, on its next
//! [`tick`](WhitelistManager::tick), whether that scan is checked against
//! the whitelist or enrolled into it. Without a staged scan a tick does
//! nothing; the manager only moves when upstream supplies input.

use log::{info, warn};
use zeroize::Zeroize;

use crate::credential::Credential;
use crate::protocol::{self, AccessEnvelope, CorrelationId, Publisher, Topics, STATUS_TOPIC};
use crate::storage::PersistentStore;
use crate::whitelist::store::WhitelistStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistMode {
    Authentication,
    Registration,
}

/// Outcome of an enrollment decision, raised once per enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// Credential written; response published
    Enrolled,
    /// Already whitelisted; nothing written or published
    AlreadyEnrolled,
    /// Whitelist full. The response is still published (the remote side
    /// cannot tell this apart from success).
    StoreFull,
}

/// A scan waiting for a decision, tagged with the mode it was taken in
struct Staged {
    uid: Credential,
    mode: WhitelistMode,
}

pub struct WhitelistManager {
    topics: Topics,
    mode: WhitelistMode,
    pending: Option<Staged>,
    correlation_id: CorrelationId,
    response: Option<EnrollOutcome>,
}

impl WhitelistManager {
    pub fn new(device_id: &str) -> Self {
        Self {
            topics: Topics::new(device_id),
            mode: WhitelistMode::Authentication,
            pending: None,
            correlation_id: CorrelationId::new(),
            response: None,
        }
    }

    pub fn mode(&self) -> WhitelistMode {
        self.mode
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Record the latest scan, replacing any scan not yet decided.
    ///
    /// The scan is decided in the mode current now, so a card read before
    /// an enrollment window opened is never enrolled by it.
    pub fn stage(&mut self, uid: Credential) {
        let staged = Staged {
            uid,
            mode: self.mode,
        };
        if let Some(mut previous) = self.pending.replace(staged) {
            warn!("Unconsumed scan {} overwritten", previous.uid.to_hex());
            previous.uid.zeroize();
        }
    }

    /// Open a one-credential enrollment window for request `id`.
    ///
    /// A second request before the first completes replaces its id.
    pub fn enter_registration(&mut self, id: CorrelationId) {
        if self.mode == WhitelistMode::Registration {
            warn!("Enrollment {} superseded by {}", self.correlation_id, id);
        }
        info!("Enrollment window open for request {}", id);
        self.correlation_id = id;
        self.mode = WhitelistMode::Registration;
    }

    pub fn exit_registration(&mut self) {
        if self.mode == WhitelistMode::Registration {
            info!("Enrollment window closed");
        }
        self.mode = WhitelistMode::Authentication;
    }

    pub fn is_whitelisted<S: PersistentStore + ?Sized>(&self, storage: &mut S, uid: &Credential) -> bool {
        WhitelistStore::new(storage).contains(uid)
    }

    /// Delete `uid` from the whitelist, whatever the mode
    pub fn revoke<S: PersistentStore + ?Sized>(&mut self, storage: &mut S, uid: &Credential) -> bool {
        let removed = WhitelistStore::new(storage).remove(uid);
        if removed {
            info!("Revoked {}", uid.to_hex());
        } else {
            info!("Revoke for unknown credential {}, nothing to do", uid.to_hex());
        }
        removed
    }

    /// Decide the staged scan, if any
    pub fn tick<S, P>(&mut self, storage: &mut S, outbox: &mut P)
    where
        S: PersistentStore + ?Sized,
        P: Publisher + ?Sized,
    {
        let Some(Staged { mut uid, mode }) = self.pending.take() else {
            return;
        };

        match mode {
            WhitelistMode::Authentication => {
                let granted = self.is_whitelisted(storage, &uid);
                info!("Authentication of {}: {}", uid.to_hex(), granted);
                let status: &[u8] = if granted { b"true" } else { b"false" };
                if !outbox.publish(STATUS_TOPIC, status) {
                    warn!("Status publication dropped");
                }
            }
            WhitelistMode::Registration => {
                let outcome = self.enroll(storage, outbox, &uid);
                info!("Enrollment of {}: {:?}", uid.to_hex(), outcome);
                self.response = Some(outcome);
                self.mode = WhitelistMode::Authentication;
            }
        }

        uid.zeroize();
    }

    fn enroll<S, P>(&mut self, storage: &mut S, outbox: &mut P, uid: &Credential) -> EnrollOutcome
    where
        S: PersistentStore + ?Sized,
        P: Publisher + ?Sized,
    {
        let mut store = WhitelistStore::new(storage);
        if store.contains(uid) {
            return EnrollOutcome::AlreadyEnrolled;
        }
        let outcome = if store.insert(uid) {
            EnrollOutcome::Enrolled
        } else {
            EnrollOutcome::StoreFull
        };
        self.publish_enrollment(outbox, uid);
        outcome
    }

    fn publish_enrollment<P: Publisher + ?Sized>(&self, outbox: &mut P, uid: &Credential) {
        let response = AccessEnvelope::EnrollResponse {
            id: self.correlation_id.clone(),
            credential: uid.clone(),
        };
        match protocol::encode(&response) {
            Ok(payload) => {
                if !outbox.publish(&self.topics.enroll_response(), &payload) {
                    warn!("Enrollment response for {} dropped", self.correlation_id);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Consume the pending enrollment outcome; fires once per decision
    pub fn take_response(&mut self) -> Option<EnrollOutcome> {
        self.response.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Outbox;
    use crate::storage::MemoryStorage;

    fn uid(bytes: &[u8]) -> Credential {
        Credential::from_slice(bytes).unwrap()
    }

    fn id(s: &str) -> CorrelationId {
        CorrelationId::try_from(s).unwrap()
    }

    #[test]
    fn test_tick_without_scan_is_noop() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");
        manager.tick(&mut storage, &mut outbox);
        assert!(outbox.messages.is_empty());
        assert!(!storage.is_dirty());
    }

    #[test]
    fn test_authentication_publishes_status_and_consumes_scan() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");
        WhitelistStore::new(&mut storage).insert(&uid(&[9, 9]));

        manager.stage(uid(&[9, 9]));
        manager.tick(&mut storage, &mut outbox);
        manager.stage(uid(&[1]));
        manager.tick(&mut storage, &mut outbox);
        manager.tick(&mut storage, &mut outbox);

        assert_eq!(outbox.payloads_on(STATUS_TOPIC), vec![b"true".to_vec(), b"false".to_vec()]);
        assert_eq!(manager.take_response(), None);
    }

    #[test]
    fn test_last_scan_wins() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");
        manager.enter_registration(id("r"));
        manager.stage(uid(&[1]));
        manager.stage(uid(&[2]));
        manager.tick(&mut storage, &mut outbox);

        let records = WhitelistStore::new(&mut storage).records().unwrap();
        assert_eq!(records, vec![uid(&[2])]);
    }

    #[test]
    fn test_registration_is_one_shot() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");

        manager.enter_registration(id("req-1"));
        manager.stage(uid(&[0xAA, 0xBB]));
        manager.tick(&mut storage, &mut outbox);
        assert_eq!(manager.mode(), WhitelistMode::Authentication);
        assert_eq!(manager.take_response(), Some(EnrollOutcome::Enrolled));
        assert_eq!(manager.take_response(), None);

        // Next scan is only authenticated.
        manager.stage(uid(&[0xCC]));
        manager.tick(&mut storage, &mut outbox);
        assert!(!manager.is_whitelisted(&mut storage, &uid(&[0xCC])));
    }

    #[test]
    fn test_duplicate_enrollment_writes_nothing() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");
        WhitelistStore::new(&mut storage).insert(&uid(&[5]));
        let commits = storage.commits();

        manager.enter_registration(id("dup"));
        manager.stage(uid(&[5]));
        manager.tick(&mut storage, &mut outbox);

        assert_eq!(manager.take_response(), Some(EnrollOutcome::AlreadyEnrolled));
        assert_eq!(manager.mode(), WhitelistMode::Authentication);
        assert_eq!(storage.commits(), commits);
        assert!(outbox.messages.is_empty());
    }

    #[test]
    fn test_full_store_still_reverts_mode() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");
        for i in 0..crate::whitelist::CAPACITY as u8 {
            WhitelistStore::new(&mut storage).insert(&uid(&[i]));
        }

        manager.enter_registration(id("full"));
        manager.stage(uid(&[0x77]));
        manager.tick(&mut storage, &mut outbox);

        assert_eq!(manager.take_response(), Some(EnrollOutcome::StoreFull));
        assert_eq!(manager.mode(), WhitelistMode::Authentication);
        assert!(!manager.is_whitelisted(&mut storage, &uid(&[0x77])));
    }

    #[test]
    fn test_scan_staged_before_window_is_only_authenticated() {
        let mut storage = MemoryStorage::default();
        let mut outbox = Outbox::default();
        let mut manager = WhitelistManager::new("n1");

        manager.stage(uid(&[0x42]));
        manager.enter_registration(id("late"));
        manager.tick(&mut storage, &mut outbox);

        assert!(!manager.is_whitelisted(&mut storage, &uid(&[0x42])));
        assert_eq!(outbox.payloads_on(STATUS_TOPIC), vec![b"false".to_vec()]);
        assert_eq!(manager.mode(), WhitelistMode::Registration);
    }

    #[test]
    fn test_second_request_replaces_correlation_id() {
        let mut manager = WhitelistManager::new("n1");
        manager.enter_registration(id("first"));
        manager.enter_registration(id("second"));
        assert_eq!(manager.correlation_id(), "second");
    }

    #[test]
    fn test_revoke_ignores_mode() {
        let mut storage = MemoryStorage::default();
        let mut manager = WhitelistManager::new("n1");
        WhitelistStore::new(&mut storage).insert(&uid(&[3, 3]));
        manager.enter_registration(id("x"));

        assert!(manager.revoke(&mut storage, &uid(&[3, 3])));
        assert!(!manager.revoke(&mut storage, &uid(&[3, 3])));
        assert_eq!(manager.mode(), WhitelistMode::Registration);
    }
}
