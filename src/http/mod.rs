//! HTTP layer for the IPTV proxy.
//!
//! Translates pipeline outcomes into HTTP responses and exposes the health
//! and metrics endpoints.

pub mod handler;
