//! An archetype-based component storage engine.
//!
//! # Archetypes
//! The archetype of an entity is the exact set of component types it owns,
//! identified by a [`Signature`].
//! All entities of the same archetype are stored in one [`Table`](table::Table),
//! which packs their components into fixed-capacity pages in struct-of-arrays layout:
//! each page has one contiguous column per component type,
//! so iterating a component of an archetype walks contiguous memory.
//!
//! Component types are not known to the storage engine statically.
//! Each type is described by a [`comp::Descriptor`],
//! and each stored instance carries a [`comp::Functions`] pair to drop and relocate it.
//!
//! # Staging and committing
//! Structural changes (adding or removing components and destroying entities)
//! never touch the tables directly.
//! They are appended to a per-entity staging log through `&self` methods of [`Pool`],
//! which may be called from any number of threads at the same time.
//!
//! [`Pool::commit`] then replays the log of each entity,
//! moves the entity to the table of its new archetype,
//! and compacts every table so that no page has holes between commits.
//! Query layers can therefore iterate the rows `0..len` of every page without checking liveness.
//!
//! ```
//! use archpool::{tracer, Entity, Pool};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position(f32, f32);
//!
//! let pool = Pool::new();
//! let entity = Entity::new();
//! pool.insert(&entity, Position(1.0, 2.0));
//! assert_eq!(pool.get_cloned::<Position>(&entity), None);
//!
//! pool.commit(&tracer::Noop);
//! assert_eq!(pool.get_cloned::<Position>(&entity), Some(Position(1.0, 2.0)));
//! ```
//!
//! # Entities
//! The storage engine does not allocate entity identities.
//! An [`Entity`] is a reference-counted handle created by the caller;
//! the pool holds one reference for each stored entity
//! and keeps the [location](Entity::location) of the entity up to date.

#![cfg_attr(debug_assertions, allow(dead_code, unused_variables))]
#![cfg_attr(not(debug_assertions), deny(missing_docs))]
#![cfg_attr(doc, warn(missing_docs))]

pub mod tracer;
pub use tracer::Tracer;

pub mod alloc;

pub mod comp;

pub mod entity;
pub use entity::Entity;

pub mod page;

pub mod pool;
pub use pool::Pool;

pub mod signature;
pub use signature::Signature;

pub(crate) mod stage;

pub mod table;

#[cfg(any(test, feature = "internal-bench"))]
pub mod test_util;

pub mod util;
