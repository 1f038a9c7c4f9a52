//! Cloud-provider API client contract.
//!
//! This is an external collaborator — the core (registry, provisioner,
//! lifecycle) only ever talks to the `CloudApi` trait. `hetzner` is the
//! one concrete adapter, kept deliberately thin.

mod client;
pub mod hetzner;

pub use client::{CloudApi, CloudError};
