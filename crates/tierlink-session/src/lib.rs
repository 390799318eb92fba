//! Identity and authorization for tierlink.
//!
//! This crate answers "is this identity allowed to talk to this server
//! right now":
//!
//! 1. **Authentication**: checking an account's password once, at the
//!    login tier ([`Authenticator`])
//! 2. **Tickets**: minting, redeeming, renewing and expiring the
//!    authorization that every later tier trusts ([`TicketRegistry`])
//! 3. **Transfers**: parking a handed-off character payload until its
//!    client arrives ([`PendingTransfers`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Node (above)      ← gates packets, runs logins and handoffs
//!     ↕
//! Session (this crate)
//!     ↕
//! Protocol (below)  ← IdentityId, ServerId
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod error;
mod registry;
mod ticket;
mod transfer;

pub use auth::{AccountRecord, Authenticator};
pub use error::SessionError;
pub use registry::TicketRegistry;
pub use ticket::{AuthorityTicket, TicketConfig};
pub use transfer::{PendingTransfer, PendingTransfers};
