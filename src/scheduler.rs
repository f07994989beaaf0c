//! System declaration and the execution plan.
//!
//! Systems declare read/write entitlements through their queries and
//! explicit `before`/`after` constraints against sibling systems. The
//! plan for a group is a deterministic topological order over the
//! resulting graph: every writer of a component type runs before any
//! reader of it; write-write pairs are ordered only by explicit
//! constraints.

use std::any::TypeId;

use ahash::{AHashMap, AHashSet};
use log::debug;

use crate::component::{ComponentType, Value};
use crate::error::{CheckError, Error};
use crate::world::Frame;

/// A user-defined unit of logic with declared queries, entitlements and
/// scheduling constraints.
///
/// `configure` runs once at world build; the phase hooks default to
/// no-ops so a system implements only what it needs.
pub trait System: 'static {
    /// Declares queries, entitlements, schedule constraints and reads
    /// props. Runs once, before the plan is resolved.
    fn configure(&mut self, cfg: &mut SystemConfig) {
        let _ = cfg;
    }

    /// Runs once, in plan order, before the first frame.
    fn initialize(&mut self, fx: &mut Frame) -> Result<(), Error> {
        let _ = fx;
        Ok(())
    }

    /// Runs once per frame, in plan order.
    fn execute(&mut self, fx: &mut Frame) -> Result<(), Error> {
        let _ = fx;
        Ok(())
    }

    /// Runs once, in plan order, when the world terminates.
    fn finalize(&mut self, fx: &mut Frame) -> Result<(), Error> {
        let _ = fx;
        Ok(())
    }
}

/// A declared access right of a system over a component type. Feeds
/// both the runtime entitlement check and the scheduler's edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Access {
    /// No declared access.
    #[default]
    None,
    /// Read-only access.
    Read,
    /// Read and write access.
    Write,
}

/// Static properties bound to a system at registration, replacing
/// per-instance configuration records.
#[derive(Clone, Debug, Default)]
pub struct Props {
    map: AHashMap<&'static str, Value>,
}

impl Props {
    /// An empty prop set.
    pub fn new() -> Self {
        Props::default()
    }

    /// Adds one key, builder style.
    pub fn set<V: Into<Value>>(mut self, key: &'static str, value: V) -> Self {
        self.map.insert(key, value.into());
        self
    }

    /// Looks a key up.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).copied()
    }

    /// Looks a numeric key up.
    pub fn num(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_num())
    }

    /// Merges another prop set in. Same key with a different value is a
    /// conflict.
    pub(crate) fn merge(&mut self, other: &Props, system: &str) -> Result<(), CheckError> {
        for (&key, &value) in &other.map {
            match self.map.get(&key) {
                Some(&existing) if existing != value => {
                    return Err(CheckError::ConflictingProps {
                        system: system.into(),
                        key,
                    });
                }
                _ => {
                    self.map.insert(key, value);
                }
            }
        }
        Ok(())
    }
}

/// Identifies one of a system's declared queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryHandle(pub(crate) usize);

/// A query declaration collected during `configure`.
#[derive(Clone, Debug, Default)]
pub(crate) struct QuerySpec {
    pub with: Vec<ComponentType>,
    pub without: Vec<ComponentType>,
    pub reads: Vec<ComponentType>,
    pub writes: Vec<ComponentType>,
    pub track_added: bool,
    pub track_removed: bool,
    pub recently_deleted: bool,
}

/// The declaration surface handed to `System::configure`.
pub struct SystemConfig {
    pub(crate) queries: Vec<QuerySpec>,
    pub(crate) before: Vec<(TypeId, &'static str)>,
    pub(crate) after: Vec<(TypeId, &'static str)>,
    pub(crate) props: Props,
}

impl SystemConfig {
    pub(crate) fn new(props: Props) -> Self {
        SystemConfig {
            queries: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            props,
        }
    }

    /// Starts a query declaration.
    pub fn query(&mut self) -> QueryBuilder<'_> {
        QueryBuilder {
            cfg: self,
            spec: QuerySpec::default(),
        }
    }

    /// Constrains this system to run before `S` within its group.
    pub fn before<S: System>(&mut self) {
        self.before
            .push((TypeId::of::<S>(), std::any::type_name::<S>()));
    }

    /// Constrains this system to run after `S` within its group.
    pub fn after<S: System>(&mut self) {
        self.after
            .push((TypeId::of::<S>(), std::any::type_name::<S>()));
    }

    /// The props bound at registration.
    pub fn props(&self) -> &Props {
        &self.props
    }
}

/// Builder for one query declaration.
pub struct QueryBuilder<'a> {
    cfg: &'a mut SystemConfig,
    spec: QuerySpec,
}

impl<'a> QueryBuilder<'a> {
    /// Requires matched entities to have the component.
    pub fn with(mut self, t: ComponentType) -> Self {
        self.spec.with.push(t);
        self
    }

    /// Requires matched entities to lack the component.
    pub fn without(mut self, t: ComponentType) -> Self {
        self.spec.without.push(t);
        self
    }

    /// Declares a read entitlement (it may exceed the predicate).
    pub fn read(mut self, t: ComponentType) -> Self {
        self.spec.reads.push(t);
        self
    }

    /// Declares a write entitlement (it may exceed the predicate).
    pub fn write(mut self, t: ComponentType) -> Self {
        self.spec.writes.push(t);
        self
    }

    /// Tracks entities that started matching since the last run.
    pub fn track_added(mut self) -> Self {
        self.spec.track_added = true;
        self
    }

    /// Tracks entities that stopped matching since the last run.
    pub fn track_removed(mut self) -> Self {
        self.spec.track_removed = true;
        self
    }

    /// Permits reading components whose removal has not yet been swept.
    pub fn access_recently_deleted_data(mut self) -> Self {
        self.spec.recently_deleted = true;
        self
    }

    /// Finishes the declaration and returns its handle.
    pub fn build(self) -> QueryHandle {
        let handle = QueryHandle(self.cfg.queries.len());
        self.cfg.queries.push(self.spec);
        handle
    }
}

/// Everything the plan builder needs to know about one system.
pub(crate) struct PlanInput<'a> {
    /// The system's world-level index.
    pub index: usize,
    pub type_id: TypeId,
    pub name: &'a str,
    pub reads: &'a [u16],
    pub writes: &'a [u16],
    pub before: &'a [(TypeId, &'static str)],
    pub after: &'a [(TypeId, &'static str)],
}

/// Topologically sorts one group. Ties break by registration order so
/// the plan is deterministic; a cycle is an authoring error.
pub(crate) fn build_plan(
    group_label: usize,
    group: &[PlanInput],
    world_systems: &AHashSet<TypeId>,
) -> Result<Vec<usize>, Error> {
    let n = group.len();
    let local: AHashMap<TypeId, usize> = group
        .iter()
        .enumerate()
        .map(|(i, s)| (s.type_id, i))
        .collect();

    let mut edges: AHashSet<(usize, usize)> = AHashSet::new();
    let mut add_edge = |edges: &mut AHashSet<(usize, usize)>, from: usize, to: usize| {
        if from != to {
            edges.insert((from, to));
        }
    };

    for (i, sys) in group.iter().enumerate() {
        for &(target, name) in sys.before {
            match local.get(&target) {
                Some(&j) => add_edge(&mut edges, i, j),
                // A constraint against a system in another group is
                // already satisfied by group ordering.
                None if world_systems.contains(&target) => {}
                None => {
                    return Err(CheckError::UnknownSystem {
                        system: name.into(),
                    }
                    .into())
                }
            }
        }
        for &(target, name) in sys.after {
            match local.get(&target) {
                Some(&j) => add_edge(&mut edges, j, i),
                None if world_systems.contains(&target) => {}
                None => {
                    return Err(CheckError::UnknownSystem {
                        system: name.into(),
                    }
                    .into())
                }
            }
        }
    }

    // All writers of a component type run before any of its readers.
    let mut writers: AHashMap<u16, Vec<usize>> = AHashMap::new();
    for (i, sys) in group.iter().enumerate() {
        for &c in sys.writes {
            writers.entry(c).or_default().push(i);
        }
    }
    for (i, sys) in group.iter().enumerate() {
        for &c in sys.reads {
            if let Some(ws) = writers.get(&c) {
                for &w in ws {
                    add_edge(&mut edges, w, i);
                }
            }
        }
    }

    let mut indegree = vec![0usize; n];
    for &(_, to) in &edges {
        indegree[to] += 1;
    }

    let mut done = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n).find(|&i| !done[i] && indegree[i] == 0);
        let i = match next {
            Some(i) => i,
            None => {
                let systems = (0..n)
                    .filter(|&i| !done[i])
                    .map(|i| group[i].name.to_owned())
                    .collect();
                return Err(CheckError::CycleDetected { systems }.into());
            }
        };
        done[i] = true;
        order.push(i);
        for &(from, to) in &edges {
            if from == i {
                indegree[to] -= 1;
            }
        }
    }

    let names: Vec<&str> = order.iter().map(|&i| group[i].name).collect();
    debug!("group {} execution order: {:?}", group_label, names);

    Ok(order.into_iter().map(|i| group[i].index).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;
    struct C;
    impl System for A {}
    impl System for B {}
    impl System for C {}

    fn input<'a>(
        index: usize,
        type_id: TypeId,
        name: &'a str,
        reads: &'a [u16],
        writes: &'a [u16],
        after: &'a [(TypeId, &'static str)],
    ) -> PlanInput<'a> {
        PlanInput {
            index,
            type_id,
            name,
            reads,
            writes,
            before: &[],
            after,
        }
    }

    #[test]
    fn writers_run_before_readers() {
        // B and C read what A writes; registration order alone would
        // put B first.
        let group = [
            input(0, TypeId::of::<B>(), "B", &[7], &[], &[]),
            input(1, TypeId::of::<C>(), "C", &[7], &[], &[]),
            input(2, TypeId::of::<A>(), "A", &[], &[7], &[]),
        ];
        let plan = build_plan(0, &group, &AHashSet::new()).unwrap();
        assert_eq!(plan, vec![2, 0, 1]);
    }

    #[test]
    fn explicit_constraints_apply() {
        let after_a: [(TypeId, &'static str); 1] = [(TypeId::of::<A>(), "A")];
        let group = [
            input(0, TypeId::of::<B>(), "B", &[], &[], &after_a),
            input(1, TypeId::of::<A>(), "A", &[], &[], &[]),
        ];
        let plan = build_plan(0, &group, &AHashSet::new()).unwrap();
        assert_eq!(plan, vec![1, 0]);
    }

    #[test]
    fn cycle_is_detected() {
        let after_a: [(TypeId, &'static str); 1] = [(TypeId::of::<A>(), "A")];
        let after_b: [(TypeId, &'static str); 1] = [(TypeId::of::<B>(), "B")];
        let group = [
            input(0, TypeId::of::<A>(), "A", &[], &[], &after_b),
            input(1, TypeId::of::<B>(), "B", &[], &[], &after_a),
        ];
        match build_plan(0, &group, &AHashSet::new()) {
            Err(Error::Check(CheckError::CycleDetected { systems })) => {
                assert_eq!(systems, vec!["A".to_owned(), "B".to_owned()]);
            }
            other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn write_write_pairs_keep_registration_order() {
        let group = [
            input(0, TypeId::of::<A>(), "A", &[], &[3], &[]),
            input(1, TypeId::of::<B>(), "B", &[], &[3], &[]),
        ];
        let plan = build_plan(0, &group, &AHashSet::new()).unwrap();
        assert_eq!(plan, vec![0, 1]);
    }

    #[test]
    fn constraint_against_unknown_system_fails() {
        let after_c: [(TypeId, &'static str); 1] = [(TypeId::of::<C>(), "C")];
        let group = [input(0, TypeId::of::<A>(), "A", &[], &[], &after_c)];
        assert!(matches!(
            build_plan(0, &group, &AHashSet::new()),
            Err(Error::Check(CheckError::UnknownSystem { .. }))
        ));
    }

    #[test]
    fn props_merge_conflicts() {
        let mut a = Props::new().set("speed", 1.0);
        let b = Props::new().set("speed", 1.0).set("limit", 4.0);
        a.merge(&b, "Sys").unwrap();
        assert_eq!(a.num("limit"), Some(4.0));

        let c = Props::new().set("speed", 2.0);
        assert!(matches!(
            a.merge(&c, "Sys"),
            Err(CheckError::ConflictingProps { key: "speed", .. })
        ));
    }
}
