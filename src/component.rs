//! Component types, field schemas and the dynamic value model.
//!
//! Components are described at world-build time by a [`ComponentDef`]:
//! an ordered list of typed fields, a storage strategy and an optional
//! validator. Registration yields a [`ComponentType`] handle whose id
//! indexes every per-component table in the world. Field identity is the
//! sequence number; names only matter at the API boundary.

use crate::entity::Entity;
use crate::error::Error;
use crate::world::EntityProbe;

/// The maximum number of fields a component schema may declare.
pub const MAX_NUM_FIELDS: usize = 64;

/// A registered component type. Identity is the dense id assigned at
/// registration; the handle is cheap to copy around.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ComponentType(u16);

impl ComponentType {
    pub(crate) fn new(id: u16) -> Self {
        ComponentType(id)
    }

    /// The dense id of this component type within its world.
    #[inline]
    pub fn id(&self) -> u16 {
        self.0
    }
}

/// Storage strategy for a component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// One slot per possible entity, addressed by entity id. Constant
    /// time, wastes space.
    #[default]
    Sparse,
    /// A compact slot array with an id-to-slot index and a LIFO free
    /// list. Grows geometrically when elastic.
    Packed,
    /// A linear-scan table of live ids. Intended for singletons and
    /// rare types.
    Compact,
}

/// The closed table of field types: each entry knows its width, its
/// default, and how values convert on read and write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    /// A boolean flag.
    Bool,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    Uint32,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// An `Option<Entity>` reference with back-edge tracking.
    Ref,
}

impl FieldType {
    /// The storage width of one element, in bytes.
    pub fn size(&self) -> usize {
        match *self {
            FieldType::Bool | FieldType::Int8 | FieldType::Uint8 => 1,
            FieldType::Int16 | FieldType::Uint16 => 2,
            FieldType::Int32 | FieldType::Uint32 | FieldType::Float32 => 4,
            FieldType::Float64 | FieldType::Ref => 8,
        }
    }

    /// The value a field of this type holds before any write.
    pub fn default_value(&self) -> Value {
        match *self {
            FieldType::Bool => Value::Bool(false),
            FieldType::Ref => Value::Ref(None),
            _ => Value::Num(0.0),
        }
    }
}

/// A dynamic scalar crossing the component API.
///
/// Numeric fields narrow on write (truncating toward zero and wrapping
/// to the column width) and widen back to `f64` on read, so a
/// write-then-read of an in-range value is exact.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// Any numeric field value.
    Num(f64),
    /// A boolean field value.
    Bool(bool),
    /// A reference field value.
    Ref(Option<Entity>),
}

impl Value {
    /// The numeric content, if this is a `Num`.
    pub fn as_num(&self) -> Option<f64> {
        match *self {
            Value::Num(n) => Some(n),
            _ => None,
        }
    }

    /// The boolean content, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// The reference content, if this is a `Ref`.
    pub fn as_ref_entity(&self) -> Option<Option<Entity>> {
        match *self {
            Value::Ref(e) => Some(e),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Num(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Num(v as f64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Num(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Num(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Entity> for Value {
    fn from(v: Entity) -> Self {
        Value::Ref(Some(v))
    }
}

impl From<Option<Entity>> for Value {
    fn from(v: Option<Entity>) -> Self {
        Value::Ref(v)
    }
}

/// One typed slot in a component schema.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// The field name, used for access by name.
    pub name: String,
    /// The field type descriptor.
    pub ty: FieldType,
    /// The default applied by `add` when no value is supplied.
    pub default: Value,
}

/// The ordered field list of a component type.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub(crate) fields: Vec<FieldSpec>,
}

impl Schema {
    /// Resolves a field name to its sequence number.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// `true` for tag components, which store nothing.
    pub fn is_tag(&self) -> bool {
        self.fields.is_empty()
    }

    /// The fields in declaration order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }
}

/// A shape validator: runs against the post-change shape after every
/// mutation involving the declaring component type. Returning `Err`
/// unwinds the mutation.
pub type Validator = Box<dyn Fn(&EntityProbe) -> Result<(), Error> + 'static>;

/// Capacity policy for a component storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum Capacity {
    /// Elastic with the storage kind's default initial capacity.
    #[default]
    Auto,
    /// Elastic with an explicit initial capacity.
    Initial(u32),
    /// Fixed; exhaustion is an authoring error.
    Fixed(u32),
}

/// Everything needed to register a component type with a world.
///
/// Consumed by `WorldBuilder::register_component`, so a def cannot be
/// bound to two live worlds.
pub struct ComponentDef {
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldSpec>,
    pub(crate) storage: Option<StorageKind>,
    pub(crate) capacity: Capacity,
    pub(crate) validator: Option<Validator>,
}

impl ComponentDef {
    /// Starts a def with the given type name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        ComponentDef {
            name: name.into(),
            fields: Vec::new(),
            storage: None,
            capacity: Capacity::default(),
            validator: None,
        }
    }

    /// Appends a field with the type's zero default.
    pub fn field<S: Into<String>>(mut self, name: S, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            default: ty.default_value(),
        });
        self
    }

    /// Appends a field with an explicit default.
    pub fn field_with_default<S, V>(mut self, name: S, ty: FieldType, default: V) -> Self
    where
        S: Into<String>,
        V: Into<Value>,
    {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            default: default.into(),
        });
        self
    }

    /// Appends an entity-reference field. The storage tracks reverse
    /// edges so deletion can null dangling references.
    pub fn ref_field<S: Into<String>>(self, name: S) -> Self {
        self.field(name, FieldType::Ref)
    }

    /// Overrides the world's default storage strategy for this type.
    pub fn storage(mut self, kind: StorageKind) -> Self {
        self.storage = Some(kind);
        self
    }

    /// Makes the storage fixed at the given capacity.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = Capacity::Fixed(capacity);
        self
    }

    /// Keeps the storage elastic but starts it at the given capacity.
    pub fn initial_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Capacity::Initial(capacity);
        self
    }

    /// Attaches a shape validator.
    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&EntityProbe) -> Result<(), Error> + 'static,
    {
        self.validator = Some(Box::new(f));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(2.5f64).as_num(), Some(2.5));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(None::<Entity>).as_ref_entity(), Some(None));
        assert_eq!(Value::from(3i32), Value::Num(3.0));
        assert_eq!(Value::Num(1.0).as_bool(), None);
    }

    #[test]
    fn schema_lookup_is_by_name() {
        let def = ComponentDef::new("Position")
            .field("x", FieldType::Float64)
            .field_with_default("y", FieldType::Float64, 4.0);
        let schema = Schema { fields: def.fields };
        assert_eq!(schema.field_index("y"), Some(1));
        assert_eq!(schema.field_index("z"), None);
        assert_eq!(schema.fields()[1].default, Value::Num(4.0));
        assert!(!schema.is_tag());
    }

    #[test]
    fn field_type_table() {
        assert_eq!(FieldType::Uint8.size(), 1);
        assert_eq!(FieldType::Float64.size(), 8);
        assert_eq!(FieldType::Bool.default_value(), Value::Bool(false));
        assert_eq!(FieldType::Ref.default_value(), Value::Ref(None));
        assert_eq!(FieldType::Int32.default_value(), Value::Num(0.0));
    }
}
