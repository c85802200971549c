//! Persistent message broker core: the storage engine plus the
//! long-polling pull path (section 1). The remoting transport,
//! name-service tier, and administrative CRUD surfaces are external
//! collaborators referenced only by interface — see [`remoting`] for the
//! envelope shape this crate expects from them.

pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod remoting;
pub mod store;
