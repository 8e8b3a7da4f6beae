//! The scale set reconciliation engine.
//!
//! Everything in here is independent of Kubernetes & of the cloud's wire format. The engine talks
//! to the outside world only through the traits of `cloud`, `capability`, `image`, `bootstrap` and
//! `store`, which are implemented by the `azure` & `k8s` modules.

pub mod bootstrap;
pub mod capability;
pub mod cloud;
pub mod compiler;
pub mod diff;
pub mod image;
pub mod machine;
pub mod pass;
pub mod reconciler;
pub mod resource;
pub mod scope;
pub mod spec;
pub mod store;
pub mod strategy;
#[cfg(test)]
mod strategy_test;
pub mod sync;
pub mod validation;
#[cfg(test)]
mod validation_test;
