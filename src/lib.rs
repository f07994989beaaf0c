#![warn(missing_docs)]

//! # Weft synchronous ECS
//!
//! Weft is a data-oriented Entity-Component-System runtime for
//! single-threaded simulations. State lives in one [`World`]: entities
//! composed of schema-described components, systems executed in a
//! deterministic order derived from their declared read/write
//! entitlements, and cooperative coroutines scoped to entities.
//!
//! A world is assembled once: component types (ordered field schemas
//! over typed columns, with a choice of sparse, packed or compact
//! storage) and systems (with their queries and schedule constraints)
//! are registered on a [`WorldBuilder`], the execution plan is
//! resolved, and each [`World::execute`] call then advances one frame.
//! Between systems a flush applies deferred deletions, nulls dangling
//! entity references and keeps the reactive queries current.

pub use crate::{
    component::{
        ComponentDef, ComponentType, FieldSpec, FieldType, Schema, StorageKind, Value,
        MAX_NUM_FIELDS,
    },
    coroutine::{Coroutine, CoroutineHandle, CoroutineStarter, Step, Waypoint},
    entity::{Entity, Generation, Index},
    error::{BoxedErr, CanceledError, CheckError, Error, InternalError},
    scheduler::{Access, Props, QueryBuilder, QueryHandle, System, SystemConfig},
    storage::{CompView, CompViewMut},
    world::{
        Control, CustomExecutor, EntityFacet, EntityProbe, Frame, SystemGroup, World,
        WorldBuilder, DEFAULT_GROUP,
    },
};

mod component;
mod coroutine;
mod entity;
mod error;
mod query;
mod scheduler;
mod storage;
mod world;

pub mod prelude;
