//! Parties domain module (customers and suppliers).
//!
//! Counter-parties carry running balances (outstanding, billed, payments)
//! that are only ever changed by posting an exact `BalanceDelta`.

pub mod party;

pub use party::{
    BalanceDelta, ContactInfo, Party, PartyCommand, PartyEvent, PartyKind, PartyStatus,
    PostDocument, PostPayment, RegisterParty, ReleaseOutstanding, SuspendParty,
};
