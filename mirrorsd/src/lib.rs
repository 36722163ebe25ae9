//! A Discord message-mirroring fabric.
//!
//! A pool of user-session gateway clients ([collectors](collector)) observes
//! messages across many source guilds, normalizes them, and pushes them onto a
//! durable queue. A single bot-session process (the [republisher](republisher))
//! drains the queue, materializes equivalent channels in one destination guild,
//! and re-emits every message through webhooks. Around that pipeline sit the
//! [routing store](store), the bidirectional [DM relay](relay), the
//! [layout guardian](layout) that reshapes and prunes the destination's
//! ephemeral categories, and a hot-reloading [config](config) layer.

#![warn(clippy::pedantic, clippy::nursery)]
// @formatter:off
#![allow(
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::default_trait_access,
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::option_if_let_else,
    // pedantic
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    // nursery
    clippy::missing_const_for_fn,
)]
// @formatter:on

#[macro_use]
extern crate bitflags;

#[macro_use]
mod macros;
mod serde_utils;

pub mod collector;
pub mod config;
pub mod control;
pub mod errors;
pub mod http;
pub mod layout;
pub mod model;
pub mod relay;
pub mod republisher;
pub mod shard;
pub mod store;
pub mod utils;
