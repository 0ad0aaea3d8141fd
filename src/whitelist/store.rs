//! Fixed-capacity credential whitelist over persistent storage
//!
//! The whitelist is an arena of [`CAPACITY`] fixed-size slots starting at
//! [`WHITELIST_ADDR`]. Each slot is `1 + MAX_LEN` bytes: a length byte
//! followed by the UID, zero padded.
//!
//! A length byte of `0x00` (deleted) or `0xFF` (never written) marks the
//! slot empty. Deleting overwrites the whole slot, not only the length, so
//! no UID bytes survive a revoke.

use log::{debug, warn};

use crate::credential::{Credential, MAX_LEN};
use crate::error::Result;
use crate::storage::{PersistentStore, WHITELIST_ADDR};

/// Number of credential slots
pub const CAPACITY: usize = 5;

/// On-medium size of one slot
pub const SLOT_SIZE: usize = 1 + MAX_LEN;

const EMPTY_ZERO: u8 = 0x00;
const EMPTY_ERASED: u8 = 0xFF;

/// Decoded view of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Occupied(Credential),
}

impl Slot {
    fn decode(raw: &[u8; SLOT_SIZE]) -> Self {
        let len = raw[0];
        if len == EMPTY_ZERO || len == EMPTY_ERASED {
            return Slot::Empty;
        }
        // A length past MAX_LEN can only be a torn or foreign write.
        match Credential::from_slice(raw.get(1..1 + len as usize).unwrap_or_default()) {
            Some(uid) => Slot::Occupied(uid),
            None => Slot::Empty,
        }
    }

    fn encode(uid: &Credential) -> [u8; SLOT_SIZE] {
        let mut raw = [0u8; SLOT_SIZE];
        raw[0] = uid.len() as u8;
        raw[1..1 + uid.len()].copy_from_slice(uid.as_bytes());
        raw
    }
}

/// Whitelist operations borrowing the node's persistent store.
///
/// Not reentrant: one caller at a time, which the single polling loop
/// guarantees by construction.
pub struct WhitelistStore<'a, S: PersistentStore + ?Sized> {
    storage: &'a mut S,
}

impl<'a, S: PersistentStore + ?Sized> WhitelistStore<'a, S> {
    pub fn new(storage: &'a mut S) -> Self {
        Self { storage }
    }

    fn slot_addr(index: usize) -> usize {
        WHITELIST_ADDR + index * SLOT_SIZE
    }

    fn read_slot(&self, index: usize) -> Result<Slot> {
        let mut raw = [0u8; SLOT_SIZE];
        self.storage.read(Self::slot_addr(index), &mut raw)?;
        Ok(Slot::decode(&raw))
    }

    /// Index of the first slot holding exactly `uid`
    fn find(&self, uid: &Credential) -> Result<Option<usize>> {
        for index in 0..CAPACITY {
            if let Slot::Occupied(stored) = self.read_slot(index)? {
                if stored == *uid {
                    return Ok(Some(index));
                }
            }
        }
        Ok(None)
    }

    /// Snapshot of every slot, head to tail
    pub fn slots(&self) -> Result<Vec<Slot>> {
        (0..CAPACITY).map(|i| self.read_slot(i)).collect()
    }

    /// Occupied credentials, head to tail
    pub fn records(&self) -> Result<Vec<Credential>> {
        Ok(self
            .slots()?
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(uid) => Some(uid),
                Slot::Empty => None,
            })
            .collect())
    }

    /// Exact length + byte membership test; unreadable storage counts as absent
    pub fn contains(&self, uid: &Credential) -> bool {
        match self.find(uid) {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("Whitelist lookup failed: {}", e);
                false
            }
        }
    }

    /// Write `uid` into the first empty slot.
    ///
    /// Returns `false` without touching storage when every slot is taken.
    pub fn insert(&mut self, uid: &Credential) -> bool {
        match self.try_insert(uid) {
            Ok(Some(index)) => {
                debug!("Whitelisted {} in slot {}", uid.to_hex(), index);
                true
            }
            Ok(None) => {
                warn!("Whitelist full, {} not stored", uid.to_hex());
                false
            }
            Err(e) => {
                warn!("Whitelist insert failed: {}", e);
                false
            }
        }
    }

    fn try_insert(&mut self, uid: &Credential) -> Result<Option<usize>> {
        for index in 0..CAPACITY {
            if self.read_slot(index)? == Slot::Empty {
                // Whole record in one write call.
                self.storage.write(Self::slot_addr(index), &Slot::encode(uid))?;
                self.storage.commit()?;
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Clear the first slot holding `uid`.
    ///
    /// Returns `false`, with no write, when `uid` is not stored.
    pub fn remove(&mut self, uid: &Credential) -> bool {
        match self.try_remove(uid) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Whitelist remove failed: {}", e);
                false
            }
        }
    }

    fn try_remove(&mut self, uid: &Credential) -> Result<bool> {
        let Some(index) = self.find(uid)? else {
            return Ok(false);
        };
        self.storage
            .write(Self::slot_addr(index), &[EMPTY_ZERO; SLOT_SIZE])?;
        self.storage.commit()?;
        debug!("Removed {} from slot {}", uid.to_hex(), index);
        Ok(true)
    }
}
