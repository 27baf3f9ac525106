//! utm-dss - DSS HTTP client, peer-USS notification, and per-audience token
//! cache for the UTM coordination engine.

pub mod client;
pub mod errors;
pub mod token_cache;

pub use client::{DssClient, DssReference, OperationalIntentSubmission, PeerNotificationDetails, PeerNotificationPayload};
pub use errors::DssError;
pub use token_cache::{DssOAuthConfig, TokenCache, TokenType};
