use std::cell::Cell;
use std::rc::Rc;

use super::*;
use crate::component::{ComponentDef, FieldType, StorageKind};
use crate::error::CheckError;

fn position_def() -> ComponentDef {
    ComponentDef::new("Position")
        .field("x", FieldType::Float64)
        .field("y", FieldType::Float64)
}

#[test]
fn write_then_read_is_exact() {
    let mut builder = World::builder();
    let pos = builder.register_component(position_def()).unwrap();
    let health = builder
        .register_component(
            ComponentDef::new("Health").field_with_default("hp", FieldType::Uint16, 100.0),
        )
        .unwrap();
    let mut world = builder.build().unwrap();

    let e = world
        .create_entity(&[(pos, &[("x", Value::Num(1.5))]), (health, &[])])
        .unwrap();

    assert_eq!(world.entity(e).read(pos).unwrap().num("x").unwrap(), 1.5);
    // Unsupplied fields carry the schema default.
    assert_eq!(world.entity(e).read(pos).unwrap().num("y").unwrap(), 0.0);
    assert_eq!(
        world.entity(e).read(health).unwrap().num("hp").unwrap(),
        100.0
    );

    world.entity(e).write(pos).unwrap().set("y", -3.25).unwrap();
    assert_eq!(world.entity(e).read(pos).unwrap().num("y").unwrap(), -3.25);
}

#[test]
fn add_remove_shape_laws() {
    let mut builder = World::builder();
    let pos = builder.register_component(position_def()).unwrap();
    let mut world = builder.build().unwrap();

    let e = world.create_entity(&[]).unwrap();
    assert!(!world.entity(e).has(pos));

    world.entity(e).add(pos, &[]).unwrap();
    assert!(world.entity(e).has(pos));
    assert!(matches!(
        world.entity(e).add(pos, &[]),
        Err(Error::Check(CheckError::AlreadyPresent { .. }))
    ));

    world.entity(e).remove(pos).unwrap();
    assert!(!world.entity(e).has(pos));
    assert!(matches!(
        world.entity(e).remove(pos),
        Err(Error::Check(CheckError::NotPresent { .. }))
    ));
}

#[test]
fn create_entity_matches_incremental_adds() {
    let mut builder = World::builder();
    let pos = builder.register_component(position_def()).unwrap();
    let tag = builder.register_component(ComponentDef::new("Frozen")).unwrap();
    let mut world = builder.build().unwrap();

    let a = world.create_entity(&[(pos, &[]), (tag, &[])]).unwrap();
    let b = world.create_entity(&[]).unwrap();
    world.entity(b).add(pos, &[]).unwrap();
    world.entity(b).add(tag, &[]).unwrap();

    for e in [a, b] {
        assert!(world.entity(e).has_all_of(&[pos, tag]));
    }
    world.assert_shape_storage_invariant();
}

#[test]
fn validator_rejects_creation() {
    let mut builder = World::builder();
    let b = builder.register_component(ComponentDef::new("B")).unwrap();
    let c = builder.register_component(ComponentDef::new("C")).unwrap();
    let _d = builder.register_component(ComponentDef::new("D")).unwrap();
    let a = builder
        .register_component(ComponentDef::new("A").validator(move |e| {
            if !e.has_any_of(&[b, c]) {
                return Err(Error::custom("A missing B or C"));
            }
            if e.count_has(&[b, c]) == 2 {
                return Err(Error::custom("A has both B and C"));
            }
            Ok(())
        }))
        .unwrap();
    let mut world = builder.build().unwrap();

    let err = world.create_entity(&[(a, &[])]).unwrap_err();
    assert_eq!(err.to_string(), "A missing B or C");
    let err = world
        .create_entity(&[(a, &[]), (b, &[]), (c, &[])])
        .unwrap_err();
    assert_eq!(err.to_string(), "A has both B and C");

    world.create_entity(&[(a, &[]), (b, &[])]).unwrap();
    // Rejected entities never became visible.
    assert_eq!(world.live_entities(), 1);
    world.assert_shape_storage_invariant();
}

#[test]
fn validator_unwinds_one_mutation() {
    let mut builder = World::builder();
    let b = builder.register_component(ComponentDef::new("B")).unwrap();
    let a = builder
        .register_component(ComponentDef::new("A").validator(move |e| {
            if e.has(b) {
                Ok(())
            } else {
                Err(Error::custom("A requires B"))
            }
        }))
        .unwrap();
    let mut world = builder.build().unwrap();

    let e = world.create_entity(&[(a, &[]), (b, &[])]).unwrap();
    // Removing B violates A's rule; the removal unwinds.
    assert!(world.entity(e).remove(b).is_err());
    assert!(world.entity(e).has(b));

    // Adding A to an entity without B unwinds the add.
    let lone = world.create_entity(&[]).unwrap();
    assert!(world.entity(lone).add(a, &[]).is_err());
    assert!(!world.entity(lone).has(a));
    world.assert_shape_storage_invariant();
}

#[test]
fn validator_is_denied_component_data() {
    let mut builder = World::builder();
    let ty = Rc::new(Cell::new(None::<ComponentType>));
    let ty_in = Rc::clone(&ty);
    let e = builder
        .register_component(
            ComponentDef::new("E")
                .field("v", FieldType::Uint8)
                .validator(move |probe| probe.read(ty_in.get().unwrap()).map(|_| ())),
        )
        .unwrap();
    ty.set(Some(e));
    let mut world = builder.build().unwrap();

    assert!(matches!(
        world.create_entity(&[(e, &[])]),
        Err(Error::Check(CheckError::NotEntitled { .. }))
    ));
}

#[test]
fn deleting_a_target_nulls_inbound_refs() {
    let mut builder = World::builder();
    let c = builder
        .register_component(ComponentDef::new("Tether").ref_field("target"))
        .unwrap();
    let mut world = builder.build().unwrap();

    let t = world.create_entity(&[]).unwrap();
    let s = world
        .create_entity(&[(c, &[("target", Value::from(t))])])
        .unwrap();
    assert_eq!(world.entity(t).ref_count(), 1);
    assert_eq!(
        world.entity(s).read(c).unwrap().entity_ref("target").unwrap(),
        Some(t)
    );

    world.entity(t).delete().unwrap();
    world.execute_at(0.0, 0.0).unwrap();

    assert_eq!(
        world.entity(s).read(c).unwrap().entity_ref("target").unwrap(),
        None
    );
    assert!(!world.probe(t).is_alive());
    world.assert_shape_storage_invariant();
}

#[test]
fn removing_a_ref_component_drops_the_edge() {
    let mut builder = World::builder();
    let c = builder
        .register_component(ComponentDef::new("Tether").ref_field("target"))
        .unwrap();
    let mut world = builder.build().unwrap();

    let t = world.create_entity(&[]).unwrap();
    let s = world
        .create_entity(&[(c, &[("target", Value::from(t))])])
        .unwrap();
    assert_eq!(world.entity(t).ref_count(), 1);

    world.entity(s).remove(c).unwrap();
    assert_eq!(world.entity(t).ref_count(), 0);
}

#[test]
fn ref_to_doomed_entity_is_rejected() {
    let mut builder = World::builder();
    let c = builder
        .register_component(ComponentDef::new("Tether").ref_field("target"))
        .unwrap();
    let mut world = builder.build().unwrap();

    let t = world.create_entity(&[]).unwrap();
    let s = world.create_entity(&[(c, &[])]).unwrap();
    world.entity(t).delete().unwrap();
    assert!(matches!(
        world.entity(s).write(c).unwrap().set("target", t),
        Err(Error::Check(CheckError::StaleEntity { .. }))
    ));
}

#[test]
fn entity_pool_is_bounded() {
    let mut builder = World::builder();
    builder.max_entities(2);
    let mut world = builder.build().unwrap();

    world.create_entity(&[]).unwrap();
    world.create_entity(&[]).unwrap();
    assert!(matches!(
        world.create_entity(&[]),
        Err(Error::Check(CheckError::CapacityExhausted { .. }))
    ));
}

#[test]
fn fixed_storage_exhausts() {
    let mut builder = World::builder();
    let solo = builder
        .register_component(
            ComponentDef::new("Solo")
                .field("v", FieldType::Int32)
                .storage(StorageKind::Compact)
                .capacity(1),
        )
        .unwrap();
    let mut world = builder.build().unwrap();

    world.create_entity(&[(solo, &[])]).unwrap();
    let err = world.create_entity(&[(solo, &[])]).unwrap_err();
    assert!(matches!(
        err,
        Error::Check(CheckError::CapacityExhausted { .. })
    ));
    // The rejected entity did not leak.
    assert_eq!(world.live_entities(), 1);
}

#[test]
fn unknown_field_is_an_authoring_error() {
    let mut builder = World::builder();
    let pos = builder.register_component(position_def()).unwrap();
    let mut world = builder.build().unwrap();

    assert!(matches!(
        world.create_entity(&[(pos, &[("z", Value::Num(1.0))])]),
        Err(Error::Check(CheckError::UnknownField { .. }))
    ));
    let e = world.create_entity(&[(pos, &[])]).unwrap();
    assert!(matches!(
        world.entity(e).read(pos).unwrap().get("w"),
        Err(Error::Check(CheckError::UnknownField { .. }))
    ));
}

#[test]
fn duplicate_component_names_are_rejected() {
    let mut builder = World::builder();
    builder.register_component(position_def()).unwrap();
    assert!(matches!(
        builder.register_component(position_def()),
        Err(Error::Check(CheckError::DuplicateComponent { .. }))
    ));
}

#[test]
fn schemas_are_bounded() {
    let mut def = ComponentDef::new("Wide");
    for i in 0..=MAX_NUM_FIELDS {
        def = def.field(format!("f{}", i), FieldType::Uint8);
    }
    let mut builder = World::builder();
    assert!(matches!(
        builder.register_component(def),
        Err(Error::Check(CheckError::TooManyFields { .. }))
    ));
}

#[test]
fn stale_handles_are_refused() {
    let mut builder = World::builder();
    let pos = builder.register_component(position_def()).unwrap();
    let mut world = builder.build().unwrap();

    let e = world.create_entity(&[(pos, &[])]).unwrap();
    world.entity(e).delete().unwrap();
    // Marked for deletion: unreferenceable immediately.
    assert!(matches!(
        world.entity(e).add(pos, &[]),
        Err(Error::Check(CheckError::NotAlive { .. }))
    ));
    assert!(matches!(
        world.entity(e).delete(),
        Err(Error::Check(CheckError::NotAlive { .. }))
    ));

    world.execute_at(0.0, 0.0).unwrap();
    world.execute_at(0.1, 0.1).unwrap();
    // Swept: the generation no longer matches.
    assert!(matches!(
        world.entity(e).remove(pos),
        Err(Error::Check(CheckError::StaleEntity { .. }))
    ));
}

#[test]
fn held_ids_are_not_recycled() {
    let mut builder = World::builder();
    builder.max_entities(2);
    let mut world = builder.build().unwrap();

    let e = world.create_entity(&[]).unwrap();
    world.entity(e).hold().unwrap();
    world.entity(e).delete().unwrap();
    world.execute_at(0.0, 0.0).unwrap();
    world.execute_at(0.1, 0.1).unwrap();

    let next = world.create_entity_inner(None, &[]).unwrap();
    assert_ne!(next.id(), e.id());

    world.entity(e).unhold();
    let reused = world.create_entity_inner(None, &[]).unwrap();
    assert_eq!(reused.id(), e.id());
    assert_ne!(reused.gen(), e.gen());
}

#[test]
fn world_state_machine_is_enforced() {
    let mut builder = World::builder();
    let pos = builder.register_component(position_def()).unwrap();
    let mut world = builder.build().unwrap();

    world.build(|fx| {
        fx.create_entity(&[(pos, &[])])?;
        Ok(())
    })
    .unwrap();

    world.execute_at(0.0, 0.0).unwrap();
    // Setup-only operations are refused once running.
    assert!(matches!(
        world.create_entity(&[]),
        Err(Error::Check(CheckError::WrongState { .. }))
    ));
    assert!(world.build(|_| Ok(())).is_err());

    world.terminate().unwrap();
    assert!(world.is_done());
    assert!(matches!(
        world.execute_at(0.1, 0.1),
        Err(Error::Check(CheckError::WrongState { .. }))
    ));
    assert!(world.terminate().is_err());
}

#[test]
fn conflicting_props_are_rejected() {
    struct Speedy;
    impl System for Speedy {}

    let mut builder = World::builder();
    builder
        .register_system_with_props(Speedy, Props::new().set("speed", 1.0))
        .unwrap();
    // Same value is tolerated, new keys merge.
    builder
        .register_system_with_props(Speedy, Props::new().set("speed", 1.0).set("limit", 9.0))
        .unwrap();
    assert!(matches!(
        builder.register_system_with_props(Speedy, Props::new().set("speed", 2.0)),
        Err(Error::Check(CheckError::ConflictingProps { .. }))
    ));
}

#[test]
fn tag_components_live_in_the_shape_only() {
    let mut builder = World::builder();
    let frozen = builder
        .register_component(ComponentDef::new("Frozen").storage(StorageKind::Packed))
        .unwrap();
    let mut world = builder.build().unwrap();

    let e = world.create_entity(&[(frozen, &[])]).unwrap();
    assert!(world.entity(e).has(frozen));
    assert!(matches!(
        world.create_entity(&[(frozen, &[("v", Value::Num(1.0))])]),
        Err(Error::Check(CheckError::UnknownField { .. }))
    ));

    world.entity(e).remove(frozen).unwrap();
    assert!(matches!(
        world.entity(e).read(frozen),
        Err(Error::Check(CheckError::NotPresent { .. }))
    ));
}

#[test]
fn shape_predicates_on_the_facade() {
    let mut builder = World::builder();
    let a = builder.register_component(ComponentDef::new("A")).unwrap();
    let b = builder.register_component(ComponentDef::new("B")).unwrap();
    let c = builder.register_component(ComponentDef::new("C")).unwrap();
    let mut world = builder.build().unwrap();

    let e = world.create_entity(&[(a, &[]), (b, &[])]).unwrap();
    let facet = world.entity(e);
    assert!(facet.has_all_of(&[a, b]));
    assert!(facet.has_any_of(&[b, c]));
    assert!(!facet.has_any_of(&[c]));
    assert_eq!(facet.count_has(&[a, b, c]), 2);
    assert!(facet.has_any_other_than(&[a]));
    assert!(!facet.has_any_other_than(&[a, b]));
}
