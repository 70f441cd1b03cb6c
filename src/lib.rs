//! MTR-style multi-hop path probing.
//!
//! A [`trace::Controller`] sweeps TTLs toward a target with one
//! [`probe::Prober`], folds every result into per-hop statistics and
//! publishes lifecycle [`trace::Event`]s. [`trace::Controller::snapshot`]
//! returns the current [`state::Snapshot`] at any time.

pub mod config;
pub mod error;
pub mod export;
pub mod lookup;
pub mod probe;
pub mod state;
pub mod trace;
