//! Component storage and binding.
//!
//! Translates `(entity, component type)` into typed read-only or
//! writable views whose accessors go straight to the backing field
//! columns. Views are cheap, short-lived borrows; the borrow checker
//! enforces that none survives a suspension point or a storage
//! reallocation.

pub(crate) mod storages;

pub(crate) use self::storages::ComponentStorage;

use crate::component::{ComponentType, Schema, Value};
use crate::entity::{Allocator, Entity, RefGraph, RefSource};
use crate::error::{CheckError, Error};

/// A read-only view of one component instance.
pub struct CompView<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) storage: &'a ComponentStorage,
    pub(crate) slot: u32,
}

impl<'a> CompView<'a> {
    /// Reads a field by name.
    pub fn get(&self, field: &str) -> Result<Value, Error> {
        let idx = resolve(self.schema, self.storage.name(), field)?;
        Ok(self.storage.read_field(self.slot, idx))
    }

    /// Reads a numeric field by name.
    pub fn num(&self, field: &str) -> Result<f64, Error> {
        self.get(field)?
            .as_num()
            .ok_or_else(|| bad_value(self.storage.name(), field))
    }

    /// Reads a boolean field by name.
    pub fn flag(&self, field: &str) -> Result<bool, Error> {
        self.get(field)?
            .as_bool()
            .ok_or_else(|| bad_value(self.storage.name(), field))
    }

    /// Reads a reference field by name.
    pub fn entity_ref(&self, field: &str) -> Result<Option<Entity>, Error> {
        self.get(field)?
            .as_ref_entity()
            .ok_or_else(|| bad_value(self.storage.name(), field))
    }
}

/// A writable view of one component instance. Writes to reference
/// fields keep the back-edge graph in sync.
pub struct CompViewMut<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) storage: &'a mut ComponentStorage,
    pub(crate) refs: &'a mut RefGraph,
    pub(crate) alloc: &'a Allocator,
    pub(crate) entity: Entity,
    pub(crate) comp: ComponentType,
    pub(crate) slot: u32,
}

impl<'a> CompViewMut<'a> {
    /// Reads a field by name.
    pub fn get(&self, field: &str) -> Result<Value, Error> {
        let idx = resolve(self.schema, self.storage.name(), field)?;
        Ok(self.storage.read_field(self.slot, idx))
    }

    /// Reads a numeric field by name.
    pub fn num(&self, field: &str) -> Result<f64, Error> {
        self.get(field)?
            .as_num()
            .ok_or_else(|| bad_value(self.storage.name(), field))
    }

    /// Reads a reference field by name.
    pub fn entity_ref(&self, field: &str) -> Result<Option<Entity>, Error> {
        self.get(field)?
            .as_ref_entity()
            .ok_or_else(|| bad_value(self.storage.name(), field))
    }

    /// Writes a field by name.
    pub fn set<V: Into<Value>>(&mut self, field: &str, value: V) -> Result<(), Error> {
        let idx = resolve(self.schema, self.storage.name(), field)?;
        set_field(
            self.schema,
            self.storage,
            self.refs,
            self.alloc,
            self.entity,
            self.comp,
            self.slot,
            idx,
            value.into(),
        )
    }
}

fn resolve(schema: &Schema, component: &str, field: &str) -> Result<usize, Error> {
    schema.field_index(field).ok_or_else(|| {
        CheckError::UnknownField {
            component: component.into(),
            field: field.into(),
        }
        .into()
    })
}

fn bad_value(component: &str, field: &str) -> Error {
    CheckError::BadValue {
        component: component.into(),
        field: field.into(),
    }
    .into()
}

/// Writes one field, maintaining reference edges for `Ref` columns.
#[allow(clippy::too_many_arguments)]
pub(crate) fn set_field(
    schema: &Schema,
    storage: &mut ComponentStorage,
    refs: &mut RefGraph,
    alloc: &Allocator,
    entity: Entity,
    comp: ComponentType,
    slot: u32,
    field: usize,
    value: Value,
) -> Result<(), Error> {
    let source = RefSource {
        entity: entity.id(),
        comp: comp.id(),
        field: field as u8,
    };
    if let Value::Ref(target) = value {
        if let Some(t) = target {
            if !alloc.is_alive(t) {
                return Err(CheckError::StaleEntity { entity: t }.into());
            }
        }
        let old = storage.get_ref(slot, field);
        if storage.write_field(slot, field, value).is_err() {
            return Err(bad_value(storage.name(), &schema.fields()[field].name));
        }
        if let Some(o) = old {
            refs.remove_edge(source, o.id());
        }
        if let Some(t) = target {
            refs.add_edge(source, t.id());
        }
        return Ok(());
    }
    storage
        .write_field(slot, field, value)
        .map_err(|_| bad_value(storage.name(), &schema.fields()[field].name))
}

/// Populates a freshly acquired (or resurrected) instance: schema
/// defaults first unless the slot is being resurrected, then the
/// supplied values. Unknown names fail the whole init.
#[allow(clippy::too_many_arguments)]
pub(crate) fn init_instance(
    schema: &Schema,
    storage: &mut ComponentStorage,
    refs: &mut RefGraph,
    alloc: &Allocator,
    entity: Entity,
    comp: ComponentType,
    slot: u32,
    values: &[(&str, Value)],
    apply_defaults: bool,
) -> Result<(), Error> {
    if apply_defaults {
        for idx in 0..schema.fields().len() {
            let default = schema.fields()[idx].default;
            set_field(schema, storage, refs, alloc, entity, comp, slot, idx, default)?;
        }
    }
    for &(name, value) in values {
        let idx = resolve(schema, storage.name(), name)?;
        set_field(schema, storage, refs, alloc, entity, comp, slot, idx, value)?;
    }
    Ok(())
}

/// Clears every reference field of an instance, dropping the edges.
pub(crate) fn clear_ref_fields(
    storage: &mut ComponentStorage,
    refs: &mut RefGraph,
    entity: Entity,
    comp: ComponentType,
    slot: u32,
) {
    for field in storage.ref_fields() {
        if let Some(target) = storage.get_ref(slot, field as usize) {
            refs.remove_edge(
                RefSource {
                    entity: entity.id(),
                    comp: comp.id(),
                    field,
                },
                target.id(),
            );
            storage.set_ref(slot, field as usize, None);
        }
    }
}
