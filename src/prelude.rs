//! Prelude module.
//!
//! Contains all of the most common imports, to be glob-imported by
//! user code.

pub use crate::component::{ComponentDef, ComponentType, FieldType, StorageKind, Value};
pub use crate::coroutine::{Coroutine, CoroutineHandle, Step, Waypoint};
pub use crate::entity::Entity;
pub use crate::error::{CanceledError, CheckError, Error};
pub use crate::scheduler::{Props, QueryHandle, System, SystemConfig};
pub use crate::world::{Control, EntityFacet, EntityProbe, Frame, World, WorldBuilder};
