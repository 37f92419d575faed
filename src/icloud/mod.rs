//! Clients for iCloud web services reached with an authenticated session.

pub mod photos;
