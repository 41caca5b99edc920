//! Stratum multi-tier entity engine.
//!
//! Presents a unified record model on top of four backends and keeps them
//! coherent across writes:
//!
//! - a relational row store (MySQL via `sqlx`)
//! - a shared out-of-process cache (redis protocol)
//! - a process-local LRU cache
//! - a message bus (AMQP) for deferred mutations and invalidations
//!
//! ## Usage
//!
//! Entity types are registered once into a [`Registry`], validated into an
//! immutable [`ValidatedRegistry`], and each logical request creates its own
//! [`Engine`] handle:
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register_mysql_pool("default", "mysql://app@localhost/app");
//! registry.register_entity::<User>();
//! let validated = registry.validate()?;
//!
//! let mut engine = validated.create_engine();
//! let user = Tracked::new(User { name: "Ada".into(), ..Default::default() });
//! engine.track(&user);
//! engine.flush().await?;
//! ```

pub mod bus;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod entity;
pub mod migrate;
pub mod schema;

mod error;

pub use config::EngineSettings;
pub use db::{Pager, Predicate};
pub use engine::{BatchFlusher, Engine, FlushOptions, Lock, Locker};
pub use entity::{Entity, EntityDef, EntityMeta, Ref, SqlValue, Tracked};
pub use error::StratumError;
pub use migrate::Alter;
pub use schema::{Registry, TableSchema, ValidatedRegistry};
