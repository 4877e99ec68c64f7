//! drmgate - DRM-gated resource decryption pipeline.
//!
//! This crate provides the orchestration around an opaque platform DRM
//! engine:
//! - Session lifecycle with bounded retries and on-demand provisioning.
//! - License request/response transactions against a remote license server,
//!   single-flight with a caller-side timeout.
//! - Offline key-set caching and restoration across sessions.
//! - Block-aligned bulk decryption of protected resource streams.
//!
//! The engine itself (cipher, certificate store, key negotiation internals)
//! stays behind the [`engine::DrmEngine`] trait; implement it over the
//! vendor capability and hand a factory to
//! [`decrypt::ResourceDecryptor::start`].

/// Shared key-set cache.
pub mod cache;
/// Pipeline configuration and demo defaults.
pub mod config;
/// Resource decryption pipeline.
pub mod decrypt;
/// DRM engine capability interface.
pub mod engine;
/// Server response envelope handling.
pub mod envelope;
/// Common error types.
pub mod error;
/// Engine lifecycle worker.
pub mod events;
/// Single-transaction HTTP client.
pub mod http;
/// License acquisition orchestration.
pub mod license;
/// Device provisioning client.
pub mod provision;
/// Session lifecycle management.
pub mod session;
