//! Credential whitelist
//!
//! # Model
//!
//! Access control here is a flat set: a credential is either whitelisted
//! or it is not. There are no roles, tenants or per-credential rights, and
//! no cryptography. A tag's UID is compared byte for byte.
//!
//! - [`WhitelistStore`] owns the persisted slot layout.
//! - [`WhitelistManager`] owns the authentication/enrollment mode, the
//!   staged scan and the correlation id of the current enrollment request.
//!
//! # Known limitations
//!
//! - The store holds [`CAPACITY`] credentials. Enrolling beyond that fails
//!   silently apart from a log line; the remote side still gets a response.
//! - A slot is written with one storage write, but a power cut during that
//!   write can still leave a torn record, which reads back as an empty slot
//!   or as a truncated credential.
//! - Only one enrollment request is tracked at a time.

mod manager;
mod store;

pub use manager::{EnrollOutcome, WhitelistManager, WhitelistMode};
pub use store::{Slot, WhitelistStore, CAPACITY, SLOT_SIZE};
