//! Outreach — quota-aware batch dispatcher for relationship invites.
//!
//! Sends a bounded number of invites per account against an external
//! social-graph service while respecting a weekly allowance and an overall
//! slot ceiling, reconciling requests that time out, and advising when an
//! account should cool down.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod relationship;

pub mod dispatch;
