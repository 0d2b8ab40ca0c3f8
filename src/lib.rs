//! Porch - package orchestration
//!
//! Versioned configuration packages (KRM resources plus a `Kptfile`) stored
//! in git repositories, OCI registries or plain directories, with a
//! lifecycle of Draft, Proposed, Published and DeletionProposed revisions.
//!
//! The core ([`engine`], [`repository`], [`merge`], [`discovery`]) is
//! synchronous and cancellable through [`cancel::CancellationToken`].
//! [`api`] serves it over HTTP, [`controllers`] reconcile PackageVariants
//! and PackageVariantSets against it, and [`gitserver`] is a small git
//! smart-HTTP server for tests and isolated deployments.

pub mod api;
pub mod cancel;
pub mod config;
pub mod controllers;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod git;
pub mod gitserver;
pub mod hash;
pub mod merge;
pub mod metadata;
pub mod model;
pub mod reference;
pub mod repository;
pub mod resources;
pub mod retry;
pub mod temp;

pub use error::{PorchError, Result};
