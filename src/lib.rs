//! Offline-first storage with a durable change queue that syncs to a
//! PostgREST backend when connectivity allows.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod sync;
pub mod translate;
pub mod unified;
