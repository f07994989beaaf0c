//! The storage backends: typed field columns, the width-adaptive index
//! array, and the sparse / packed / compact / tag slot policies.

use ahash::AHashMap;
use hibitset::BitSet;

use crate::component::{Capacity, FieldSpec, FieldType, StorageKind, Value};
use crate::entity::{Entity, Index};
use crate::error::{CheckError, Error, InternalError};

/// One field's values for every slot of a storage, at the field type's
/// native width.
#[derive(Debug)]
pub(crate) enum Column {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Ref(Vec<Option<Entity>>),
}

// Narrowing truncates toward zero and wraps to the column width, the
// way typed-array stores behave.
#[inline]
fn narrow(v: f64) -> i64 {
    v.trunc() as i64
}

impl Column {
    pub fn new(ty: FieldType, len: usize) -> Self {
        match ty {
            FieldType::Bool => Column::Bool(vec![false; len]),
            FieldType::Int8 => Column::I8(vec![0; len]),
            FieldType::Uint8 => Column::U8(vec![0; len]),
            FieldType::Int16 => Column::I16(vec![0; len]),
            FieldType::Uint16 => Column::U16(vec![0; len]),
            FieldType::Int32 => Column::I32(vec![0; len]),
            FieldType::Uint32 => Column::U32(vec![0; len]),
            FieldType::Float32 => Column::F32(vec![0.0; len]),
            FieldType::Float64 => Column::F64(vec![0.0; len]),
            FieldType::Ref => Column::Ref(vec![None; len]),
        }
    }

    pub fn resize(&mut self, len: usize) {
        match *self {
            Column::Bool(ref mut v) => v.resize(len, false),
            Column::I8(ref mut v) => v.resize(len, 0),
            Column::U8(ref mut v) => v.resize(len, 0),
            Column::I16(ref mut v) => v.resize(len, 0),
            Column::U16(ref mut v) => v.resize(len, 0),
            Column::I32(ref mut v) => v.resize(len, 0),
            Column::U32(ref mut v) => v.resize(len, 0),
            Column::F32(ref mut v) => v.resize(len, 0.0),
            Column::F64(ref mut v) => v.resize(len, 0.0),
            Column::Ref(ref mut v) => v.resize(len, None),
        }
    }

    pub fn read(&self, slot: usize) -> Value {
        match *self {
            Column::Bool(ref v) => Value::Bool(v[slot]),
            Column::I8(ref v) => Value::Num(v[slot] as f64),
            Column::U8(ref v) => Value::Num(v[slot] as f64),
            Column::I16(ref v) => Value::Num(v[slot] as f64),
            Column::U16(ref v) => Value::Num(v[slot] as f64),
            Column::I32(ref v) => Value::Num(v[slot] as f64),
            Column::U32(ref v) => Value::Num(v[slot] as f64),
            Column::F32(ref v) => Value::Num(v[slot] as f64),
            Column::F64(ref v) => Value::Num(v[slot]),
            Column::Ref(ref v) => Value::Ref(v[slot]),
        }
    }

    /// Writes a value of the matching kind; `Err(())` on a kind
    /// mismatch, which the caller maps to `CheckError::BadValue`.
    pub fn write(&mut self, slot: usize, value: Value) -> Result<(), ()> {
        match (self, value) {
            (Column::Bool(v), Value::Bool(b)) => v[slot] = b,
            (Column::I8(v), Value::Num(n)) => v[slot] = narrow(n) as i8,
            (Column::U8(v), Value::Num(n)) => v[slot] = narrow(n) as u8,
            (Column::I16(v), Value::Num(n)) => v[slot] = narrow(n) as i16,
            (Column::U16(v), Value::Num(n)) => v[slot] = narrow(n) as u16,
            (Column::I32(v), Value::Num(n)) => v[slot] = narrow(n) as i32,
            (Column::U32(v), Value::Num(n)) => v[slot] = narrow(n) as u32,
            (Column::F32(v), Value::Num(n)) => v[slot] = n as f32,
            (Column::F64(v), Value::Num(n)) => v[slot] = n,
            (Column::Ref(v), Value::Ref(e)) => v[slot] = e,
            _ => return Err(()),
        }
        Ok(())
    }

    pub fn is_ref(&self) -> bool {
        matches!(*self, Column::Ref(_))
    }

    pub fn get_ref(&self, slot: usize) -> Option<Entity> {
        match *self {
            Column::Ref(ref v) => v[slot],
            _ => None,
        }
    }

    pub fn set_ref(&mut self, slot: usize, e: Option<Entity>) {
        if let Column::Ref(ref mut v) = *self {
            v[slot] = e;
        }
    }
}

const EMPTY: i32 = -1;

/// A slot index array that auto-selects among `i8`/`i16`/`i32` element
/// width based on the capacity it must address, re-encoding itself when
/// elastic growth crosses a width boundary.
#[derive(Debug)]
pub(crate) enum IndexArray {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl IndexArray {
    pub fn new(len: usize, capacity: u32) -> Self {
        if capacity <= i8::MAX as u32 {
            IndexArray::I8(vec![EMPTY as i8; len])
        } else if capacity <= i16::MAX as u32 {
            IndexArray::I16(vec![EMPTY as i16; len])
        } else {
            IndexArray::I32(vec![EMPTY; len])
        }
    }

    pub fn get(&self, i: usize) -> i32 {
        match *self {
            IndexArray::I8(ref v) => v[i] as i32,
            IndexArray::I16(ref v) => v[i] as i32,
            IndexArray::I32(ref v) => v[i],
        }
    }

    pub fn set(&mut self, i: usize, value: i32) {
        match *self {
            IndexArray::I8(ref mut v) => v[i] = value as i8,
            IndexArray::I16(ref mut v) => v[i] = value as i16,
            IndexArray::I32(ref mut v) => v[i] = value,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            IndexArray::I8(ref v) => v.len(),
            IndexArray::I16(ref v) => v.len(),
            IndexArray::I32(ref v) => v.len(),
        }
    }

    /// Re-encodes to a width able to address `capacity` slots. Widening
    /// only; existing entries are preserved.
    pub fn promote(&mut self, capacity: u32) {
        let needs = if capacity <= i8::MAX as u32 {
            1
        } else if capacity <= i16::MAX as u32 {
            2
        } else {
            4
        };
        let have = match *self {
            IndexArray::I8(_) => 1,
            IndexArray::I16(_) => 2,
            IndexArray::I32(_) => 4,
        };
        if needs <= have {
            return;
        }
        let len = self.len();
        let mut wider = IndexArray::new(len, capacity);
        for i in 0..len {
            wider.set(i, self.get(i));
        }
        *self = wider;
    }
}

/// A LIFO free list of released slots, stored at the same adaptive
/// width as the slot index.
#[derive(Debug)]
pub(crate) struct FreeList {
    slots: IndexArray,
    len: usize,
}

impl FreeList {
    fn new(capacity: u32) -> Self {
        FreeList {
            slots: IndexArray::new(capacity as usize, capacity),
            len: 0,
        }
    }

    fn push(&mut self, slot: i32) {
        self.slots.set(self.len, slot);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<i32> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.slots.get(self.len))
    }

    fn grow(&mut self, capacity: u32) {
        self.slots.promote(capacity);
        match self.slots {
            IndexArray::I8(ref mut v) => v.resize(capacity as usize, EMPTY as i8),
            IndexArray::I16(ref mut v) => v.resize(capacity as usize, EMPTY as i16),
            IndexArray::I32(ref mut v) => v.resize(capacity as usize, EMPTY),
        }
    }
}

/// How a storage maps entity ids to slots.
#[derive(Debug)]
enum SlotPolicy {
    /// Existence is the shape bit alone; nothing is stored.
    Tag,
    /// `slot == id`; the bitset tracks which ids are acquired.
    Sparse { acquired: BitSet },
    /// Id-to-slot redirection with free-list reuse.
    Packed {
        index: IndexArray,
        free: FreeList,
        next_slot: u32,
    },
    /// `ids[slot]` holds the owning entity id; first-empty linear scan.
    Compact { ids: Vec<Option<Index>> },
}

const PACKED_DEFAULT_CAPACITY: u32 = 8;

/// The per-component-type storage: field columns plus a slot policy.
///
/// Release is deferred: `remove` parks the slot (tagged with the frame
/// number) and the post-frame sweep either frees it or, if the same
/// entity re-added the component in the meantime, leaves it alone.
#[derive(Debug)]
pub(crate) struct ComponentStorage {
    name: String,
    columns: Vec<Column>,
    policy: SlotPolicy,
    capacity: u32,
    elastic: bool,
    max_entities: u32,
    parked: AHashMap<Index, u64>,
}

impl ComponentStorage {
    pub fn new(
        name: &str,
        fields: &[FieldSpec],
        kind: StorageKind,
        capacity: Capacity,
        max_entities: u32,
    ) -> Self {
        // Tag components are forced to sparse and store nothing.
        let kind = if fields.is_empty() {
            StorageKind::Sparse
        } else {
            kind
        };
        let (policy, cap, elastic) = match kind {
            StorageKind::Sparse if fields.is_empty() => (SlotPolicy::Tag, 0, false),
            StorageKind::Sparse => (
                SlotPolicy::Sparse {
                    acquired: BitSet::new(),
                },
                max_entities,
                false,
            ),
            StorageKind::Packed => {
                let (cap, elastic) = match capacity {
                    Capacity::Auto => (PACKED_DEFAULT_CAPACITY, true),
                    Capacity::Initial(n) => (n.max(1), true),
                    Capacity::Fixed(n) => (n.max(1), false),
                };
                let cap = cap.min(max_entities);
                (
                    SlotPolicy::Packed {
                        index: IndexArray::new(max_entities as usize, cap),
                        free: FreeList::new(cap),
                        next_slot: 0,
                    },
                    cap,
                    elastic,
                )
            }
            StorageKind::Compact => {
                let (cap, elastic) = match capacity {
                    Capacity::Auto => (1, true),
                    Capacity::Initial(n) => (n.max(1), true),
                    Capacity::Fixed(n) => (n.max(1), false),
                };
                let cap = cap.min(max_entities);
                (
                    SlotPolicy::Compact {
                        ids: vec![None; cap as usize],
                    },
                    cap,
                    elastic,
                )
            }
        };
        let columns = fields
            .iter()
            .map(|f| Column::new(f.ty, cap as usize))
            .collect();
        ComponentStorage {
            name: name.to_owned(),
            columns,
            policy,
            capacity: cap,
            elastic,
            max_entities,
            parked: AHashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_tag(&self) -> bool {
        matches!(self.policy, SlotPolicy::Tag)
    }

    fn grow(&mut self) -> Result<(), Error> {
        if !self.elastic || self.capacity >= self.max_entities {
            return Err(CheckError::CapacityExhausted {
                name: self.name.clone(),
                capacity: self.capacity,
            }
            .into());
        }
        let new_cap = (self.capacity * 2).min(self.max_entities);
        for col in &mut self.columns {
            col.resize(new_cap as usize);
        }
        match self.policy {
            SlotPolicy::Packed {
                ref mut index,
                ref mut free,
                ..
            } => {
                index.promote(new_cap);
                free.grow(new_cap);
            }
            SlotPolicy::Compact { ref mut ids } => {
                ids.resize(new_cap as usize, None);
            }
            _ => return Err(InternalError::new("grow of non-elastic policy").into()),
        }
        self.capacity = new_cap;
        Ok(())
    }

    /// Allocates a slot for an entity, growing if the policy is elastic.
    pub fn acquire(&mut self, id: Index) -> Result<u32, Error> {
        match self.policy {
            SlotPolicy::Tag => Ok(0),
            SlotPolicy::Sparse { ref mut acquired } => {
                acquired.add(id);
                Ok(id)
            }
            SlotPolicy::Packed { .. } => {
                let slot = loop {
                    match self.policy {
                        SlotPolicy::Packed {
                            ref mut free,
                            ref mut next_slot,
                            ..
                        } => {
                            if let Some(slot) = free.pop() {
                                break slot as u32;
                            }
                            if *next_slot < self.capacity {
                                let slot = *next_slot;
                                *next_slot += 1;
                                break slot;
                            }
                        }
                        _ => unreachable!(),
                    }
                    self.grow()?;
                };
                if let SlotPolicy::Packed { ref mut index, .. } = self.policy {
                    index.set(id as usize, slot as i32);
                }
                Ok(slot)
            }
            SlotPolicy::Compact { .. } => loop {
                if let SlotPolicy::Compact { ref mut ids } = self.policy {
                    if let Some(slot) = ids.iter().position(Option::is_none) {
                        ids[slot] = Some(id);
                        return Ok(slot as u32);
                    }
                }
                self.grow()?;
            },
        }
    }

    /// The slot currently mapped for an entity, if any. Parked slots
    /// stay mapped until the sweep releases them.
    pub fn slot_of(&self, id: Index) -> Option<u32> {
        match self.policy {
            SlotPolicy::Tag => Some(0),
            SlotPolicy::Sparse { ref acquired } => acquired.contains(id).then_some(id),
            SlotPolicy::Packed { ref index, .. } => {
                let slot = index.get(id as usize);
                (slot != EMPTY).then_some(slot as u32)
            }
            SlotPolicy::Compact { ref ids } => ids
                .iter()
                .position(|&slot| slot == Some(id))
                .map(|slot| slot as u32),
        }
    }

    /// Whether the entity currently holds a slot (tags always report
    /// `false`; their existence is the shape bit).
    pub fn acquired(&self, id: Index) -> bool {
        !self.is_tag() && self.slot_of(id).is_some()
    }

    /// Returns the slot to the free list (packed) or clears its id
    /// (compact). Releasing an unallocated slot is an engine bug.
    pub fn release(&mut self, id: Index) -> Result<(), Error> {
        match self.policy {
            SlotPolicy::Tag => Ok(()),
            SlotPolicy::Sparse { ref mut acquired } => {
                if !acquired.remove(id) {
                    return Err(InternalError::new("release of an unacquired sparse slot").into());
                }
                Ok(())
            }
            SlotPolicy::Packed {
                ref mut index,
                ref mut free,
                ..
            } => {
                let slot = index.get(id as usize);
                if slot == EMPTY {
                    return Err(InternalError::new("release of an unacquired packed slot").into());
                }
                index.set(id as usize, EMPTY);
                free.push(slot);
                Ok(())
            }
            SlotPolicy::Compact { ref mut ids } => {
                match ids.iter().position(|&slot| slot == Some(id)) {
                    Some(slot) => {
                        ids[slot] = None;
                        Ok(())
                    }
                    None => Err(InternalError::new("release of an unacquired compact slot").into()),
                }
            }
        }
    }

    pub fn park(&mut self, id: Index, frame: u64) {
        if !self.is_tag() {
            self.parked.insert(id, frame);
        }
    }

    /// Cancels a pending release, returning the frame it was parked in
    /// if one existed (the resurrection case).
    pub fn unpark(&mut self, id: Index) -> Option<u64> {
        self.parked.remove(&id)
    }

    pub fn is_parked(&self, id: Index) -> bool {
        self.parked.contains_key(&id)
    }

    /// Releases a slot parked in the given frame, unless a later
    /// park superseded the entry or a resurrection cancelled it.
    pub fn sweep_parked(&mut self, id: Index, frame: u64) -> Result<(), Error> {
        if self.parked.get(&id) == Some(&frame) {
            self.parked.remove(&id);
            self.release(id)?;
        }
        Ok(())
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    pub fn read_field(&self, slot: u32, field: usize) -> Value {
        self.columns[field].read(slot as usize)
    }

    /// Raw field write; ref-edge maintenance is the caller's concern.
    pub fn write_field(&mut self, slot: u32, field: usize, value: Value) -> Result<(), ()> {
        self.columns[field].write(slot as usize, value)
    }

    /// The field indices that hold entity references.
    pub fn ref_fields(&self) -> Vec<u8> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_ref())
            .map(|(i, _)| i as u8)
            .collect()
    }

    pub fn get_ref(&self, slot: u32, field: usize) -> Option<Entity> {
        self.columns[field].get_ref(slot as usize)
    }

    pub fn set_ref(&mut self, slot: u32, field: usize, e: Option<Entity>) {
        self.columns[field].set_ref(slot as usize, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FieldType;

    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec {
            name: "value".into(),
            ty: FieldType::Uint8,
            default: Value::Num(0.0),
        }]
    }

    #[test]
    fn packed_reuses_released_slots_lifo() {
        let mut s = ComponentStorage::new(
            "T",
            &fields(),
            StorageKind::Packed,
            Capacity::Initial(4),
            100,
        );
        let a = s.acquire(10).unwrap();
        let b = s.acquire(20).unwrap();
        assert_eq!((a, b), (0, 1));

        s.release(10).unwrap();
        s.release(20).unwrap();
        // LIFO: the most recently released slot comes back first.
        assert_eq!(s.acquire(30).unwrap(), 1);
        assert_eq!(s.acquire(40).unwrap(), 0);
        assert_eq!(s.slot_of(30), Some(1));
        assert_eq!(s.slot_of(10), None);
    }

    #[test]
    fn packed_grows_and_promotes_index_width() {
        let mut s = ComponentStorage::new(
            "T",
            &fields(),
            StorageKind::Packed,
            Capacity::Initial(100),
            1000,
        );
        for id in 0..150 {
            let slot = s.acquire(id).unwrap();
            s.write_field(slot, 0, Value::Num(id as f64)).unwrap();
        }
        assert!(s.capacity() >= 150);
        // Values written before the width promotion survive it.
        let slot = s.slot_of(3).unwrap();
        assert_eq!(s.read_field(slot, 0), Value::Num(3.0));
    }

    #[test]
    fn packed_fixed_capacity_exhausts() {
        let mut s =
            ComponentStorage::new("T", &fields(), StorageKind::Packed, Capacity::Fixed(2), 100);
        s.acquire(0).unwrap();
        s.acquire(1).unwrap();
        assert!(matches!(
            s.acquire(2),
            Err(Error::Check(CheckError::CapacityExhausted { .. }))
        ));
    }

    #[test]
    fn compact_scans_first_empty() {
        let mut s = ComponentStorage::new(
            "T",
            &fields(),
            StorageKind::Compact,
            Capacity::Initial(3),
            100,
        );
        assert_eq!(s.acquire(5).unwrap(), 0);
        assert_eq!(s.acquire(9).unwrap(), 1);
        s.release(5).unwrap();
        assert_eq!(s.acquire(7).unwrap(), 0);
        assert_eq!(s.slot_of(9), Some(1));
    }

    #[test]
    fn sparse_slot_is_the_id() {
        let mut s =
            ComponentStorage::new("T", &fields(), StorageKind::Sparse, Capacity::Auto, 100);
        assert_eq!(s.acquire(42).unwrap(), 42);
        assert!(s.acquired(42));
        s.release(42).unwrap();
        assert!(!s.acquired(42));
        assert!(s.release(42).is_err());
    }

    #[test]
    fn parked_slot_survives_until_its_own_frame_sweeps() {
        let mut s =
            ComponentStorage::new("T", &fields(), StorageKind::Sparse, Capacity::Auto, 100);
        s.acquire(1).unwrap();
        s.park(1, 1);
        // Re-parked in a later frame: the old sweep entry must not free it.
        s.park(1, 2);
        s.sweep_parked(1, 1).unwrap();
        assert!(s.acquired(1));
        s.sweep_parked(1, 2).unwrap();
        assert!(!s.acquired(1));
    }

    #[test]
    fn narrowing_wraps_to_width() {
        let mut col = Column::new(FieldType::Uint8, 1);
        col.write(0, Value::Num(300.0)).unwrap();
        assert_eq!(col.read(0), Value::Num(44.0));
        col.write(0, Value::Num(-1.0)).unwrap();
        assert_eq!(col.read(0), Value::Num(255.0));
        assert!(col.write(0, Value::Bool(true)).is_err());
    }

    #[test]
    fn tag_storage_stores_nothing() {
        let mut s = ComponentStorage::new("T", &[], StorageKind::Packed, Capacity::Auto, 100);
        assert!(s.is_tag());
        assert_eq!(s.acquire(3).unwrap(), 0);
        assert!(!s.acquired(3));
        assert_eq!(s.field_count(), 0);
    }
}
