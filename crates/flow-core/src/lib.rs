//! # flow-core
//!
//! Component-facing contracts for the Flow component controller.
//!
//! This crate defines everything a component implementation needs to plug
//! into the controller, plus two cross-cutting concerns that are intrinsic
//! to component lifecycle management:
//!
//! - **Component contract**: the [`component::Component`] trait, the
//!   [`component::Options`] handed to builders, and the explicit (non-global)
//!   [`component::ComponentRegistry`] of block name → builder.
//! - **Health**: the three-state-plus-exited [`health::Health`] model with
//!   least-healthy combination.
//! - **Registry wrapper**: [`registry::Unregisterer`], a metrics registrar
//!   that remembers every collector a component registers so the whole set
//!   can be torn down when the component is removed.
//! - **Series model and relabeling**: label sets with 64-bit fingerprints,
//!   the Prometheus stale-marker convention, relabel rules, and the
//!   fingerprint-keyed LRU cache used by the forwarding fast-path.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod component;
pub mod health;
pub mod registry;
pub mod relabel;
pub mod series;

pub use component::{Component, ComponentRegistry, Options, Registration};
pub use health::{Health, HealthStatus};
pub use registry::Unregisterer;
