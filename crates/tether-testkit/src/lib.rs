//! # Tether Testkit
//!
//! Testing utilities for Tether.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: An engine wired to in-memory stores and an in-memory
//!   remote peer, with predictable keys on both sides
//! - **Generators**: Proptest strategies for id triples, payloads and
//!   registry inputs
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether_testkit::fixtures::EngineFixture;
//!
//! async fn example() -> tether::Result<()> {
//!     let mut fixture = EngineFixture::new().await?;
//!     let rt_id = fixture.create("todos", json!({"title": "milk"})).await?;
//!     fixture.engine.online().await?;
//!     assert!(fixture.todo(rt_id).is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use tether::{Registry, Source};
//! use tether_testkit::generators::registry_input;
//!
//! proptest! {
//!     #[test]
//!     fn handles_keep_their_rt_id(inputs in prop::collection::vec(registry_input(), 0..32)) {
//!         let mut registry = Registry::new("todos");
//!         for (source, envelope) in inputs {
//!             registry.process(source, envelope);
//!         }
//!         for handle in registry.all() {
//!             let rt_id = handle.rt_id().unwrap();
//!             prop_assert_eq!(registry.get(rt_id).unwrap().rt_id(), Some(rt_id));
//!         }
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{EngineFixture, FixtureKeys};
pub use generators::{envelope_for, registry_input, IdTriple};
