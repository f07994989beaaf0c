//! The world: registration, the frame loop, the flush, and the entity
//! facade.
//!
//! A single `World` is the unit of isolation: all entities, components
//! and systems live inside it. Worlds are assembled by a
//! [`WorldBuilder`], run frames through [`World::execute`], and end
//! with [`World::terminate`].

use std::any::TypeId;
use std::collections::VecDeque;
use std::time::Instant;

use ahash::AHashSet;
use log::{trace, warn};
use shrev::EventChannel;

use crate::component::{ComponentDef, ComponentType, Schema, Validator, Value, MAX_NUM_FIELDS};
use crate::coroutine::{
    Coroutine, CoroutineEngine, CoroutineHandle, CoroutineStarter, Step, Wait, Waypoint,
};
use crate::entity::{Allocator, Entity, Index, RefGraph, ShapeTable};
use crate::error::{CheckError, Error, InternalError};
use crate::query::{QueryState, ShapeEvent};
use crate::scheduler::{self, Access, PlanInput, Props, QueryHandle, System, SystemConfig};
use crate::storage::{
    clear_ref_fields, init_instance, CompView, CompViewMut, ComponentStorage,
};

#[cfg(test)]
mod tests;

/// The world's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Setup,
    Initializing,
    Running,
    Executing,
    Finalizing,
    Done,
}

impl State {
    fn describe(self) -> &'static str {
        match self {
            State::Setup => "in setup",
            State::Initializing => "initializing",
            State::Running => "running",
            State::Executing => "executing a frame",
            State::Finalizing => "finalizing",
            State::Done => "done",
        }
    }
}

/// A reserved grouping of systems. Groups execute in creation order;
/// a custom executor can drive them separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemGroup(pub(crate) usize);

/// The default group every plain registration lands in.
pub const DEFAULT_GROUP: SystemGroup = SystemGroup(0);

pub(crate) struct ComponentInfo {
    pub name: String,
    pub schema: Schema,
    pub validator: Option<Validator>,
    pub storage: ComponentStorage,
}

pub(crate) struct SystemSlot {
    pub name: String,
    pub type_id: TypeId,
    pub instance: Option<Box<dyn System>>,
    pub group: usize,
    pub entitlements: Vec<Access>,
    pub recent_ok: bool,
    pub queries: Vec<QueryState>,
    pub props: Props,
    pub stopped: bool,
    pub before: Vec<(TypeId, &'static str)>,
    pub after: Vec<(TypeId, &'static str)>,
}

struct PendingSystem {
    instance: Box<dyn System>,
    type_id: TypeId,
    name: &'static str,
    group: usize,
    props: Props,
}

/// Assembles a [`World`]: components and systems are registered here,
/// then `build` resolves the execution plan and produces the world in
/// its setup state.
pub struct WorldBuilder {
    max_entities: u32,
    default_storage: crate::component::StorageKind,
    defs: Vec<ComponentDef>,
    pending: Vec<PendingSystem>,
    group_count: usize,
}

impl Default for WorldBuilder {
    fn default() -> Self {
        WorldBuilder {
            max_entities: 10_000,
            default_storage: crate::component::StorageKind::Sparse,
            defs: Vec::new(),
            pending: Vec::new(),
            group_count: 1,
        }
    }
}

impl WorldBuilder {
    /// Starts an empty builder.
    pub fn new() -> Self {
        WorldBuilder::default()
    }

    /// The hard upper bound on concurrently allocated entities.
    /// Defaults to 10,000.
    pub fn max_entities(&mut self, n: u32) -> &mut Self {
        self.max_entities = n;
        self
    }

    /// The storage strategy used by component defs that don't pick one.
    pub fn default_component_storage(
        &mut self,
        kind: crate::component::StorageKind,
    ) -> &mut Self {
        self.default_storage = kind;
        self
    }

    /// Registers a component type. The def is consumed, so it cannot be
    /// bound to a second world.
    pub fn register_component(&mut self, def: ComponentDef) -> Result<ComponentType, Error> {
        if self.defs.iter().any(|d| d.name == def.name) {
            return Err(CheckError::DuplicateComponent {
                name: def.name.clone(),
            }
            .into());
        }
        if def.fields.len() > MAX_NUM_FIELDS {
            return Err(CheckError::TooManyFields {
                component: def.name.clone(),
            }
            .into());
        }
        let id = self.defs.len() as u16;
        self.defs.push(def);
        Ok(ComponentType::new(id))
    }

    /// Creates an additional system group, executed after all earlier
    /// ones.
    pub fn group(&mut self) -> SystemGroup {
        let g = SystemGroup(self.group_count);
        self.group_count += 1;
        g
    }

    /// Registers a system in the default group.
    pub fn register_system<S: System>(&mut self, system: S) -> Result<(), Error> {
        self.register_system_full(DEFAULT_GROUP, system, Props::new())
    }

    /// Registers a system with bound props.
    pub fn register_system_with_props<S: System>(
        &mut self,
        system: S,
        props: Props,
    ) -> Result<(), Error> {
        self.register_system_full(DEFAULT_GROUP, system, props)
    }

    /// Registers a system in a specific group.
    pub fn register_system_in<S: System>(
        &mut self,
        group: SystemGroup,
        system: S,
    ) -> Result<(), Error> {
        self.register_system_full(group, system, Props::new())
    }

    /// Registers a system in a group with bound props. Re-registering
    /// the same system type is tolerated: the instances collapse into
    /// one and the props merge, but a conflicting value under the same
    /// key is an authoring error.
    pub fn register_system_full<S: System>(
        &mut self,
        group: SystemGroup,
        system: S,
        props: Props,
    ) -> Result<(), Error> {
        let type_id = TypeId::of::<S>();
        let name = std::any::type_name::<S>();
        if let Some(existing) = self.pending.iter_mut().find(|p| p.type_id == type_id) {
            existing.props.merge(&props, name)?;
            return Ok(());
        }
        self.pending.push(PendingSystem {
            instance: Box::new(system),
            type_id,
            name,
            group: group.0,
            props,
        });
        Ok(())
    }

    /// Resolves the plan and produces the world in its setup state.
    pub fn build(self) -> Result<World, Error> {
        let WorldBuilder {
            max_entities,
            default_storage,
            defs,
            mut pending,
            group_count,
        } = self;

        let component_count = defs.len();
        let mut components = Vec::with_capacity(component_count);
        let mut channels: Vec<EventChannel<ShapeEvent>> = Vec::with_capacity(component_count);
        for def in defs {
            let ComponentDef {
                name,
                fields,
                storage,
                capacity,
                validator,
            } = def;
            let kind = storage.unwrap_or(default_storage);
            let store = ComponentStorage::new(&name, &fields, kind, capacity, max_entities);
            components.push(ComponentInfo {
                name,
                schema: Schema { fields },
                validator,
                storage: store,
            });
            channels.push(EventChannel::new());
        }

        let mut systems = Vec::with_capacity(pending.len());
        for p in &mut pending {
            let mut cfg = SystemConfig::new(p.props.clone());
            p.instance.configure(&mut cfg);
            let mut entitlements = vec![Access::None; component_count];
            let mut recent_ok = false;
            for spec in &cfg.queries {
                for t in spec
                    .with
                    .iter()
                    .chain(spec.without.iter())
                    .chain(spec.reads.iter())
                    .chain(spec.writes.iter())
                {
                    if t.id() as usize >= component_count {
                        return Err(InternalError::new(
                            "query names a component from another world",
                        )
                        .into());
                    }
                }
                for t in &spec.reads {
                    let a = &mut entitlements[t.id() as usize];
                    if *a == Access::None {
                        *a = Access::Read;
                    }
                }
                for t in &spec.writes {
                    entitlements[t.id() as usize] = Access::Write;
                }
                recent_ok |= spec.recently_deleted;
            }
            let queries = cfg
                .queries
                .iter()
                .map(|spec| QueryState::new(spec.clone(), &mut channels))
                .collect();
            systems.push(SystemSlot {
                name: p.name.to_owned(),
                type_id: p.type_id,
                instance: None,
                group: p.group,
                entitlements,
                recent_ok,
                queries,
                props: p.props.clone(),
                stopped: false,
                before: cfg.before,
                after: cfg.after,
            });
        }
        for (slot, p) in systems.iter_mut().zip(pending) {
            slot.instance = Some(p.instance);
        }

        let world_types: AHashSet<TypeId> = systems.iter().map(|s| s.type_id).collect();
        let mut plans = Vec::with_capacity(group_count);
        for g in 0..group_count {
            let reads_writes: Vec<(Vec<u16>, Vec<u16>)> = systems
                .iter()
                .map(|s| {
                    let reads = s
                        .entitlements
                        .iter()
                        .enumerate()
                        .filter(|&(_, a)| *a == Access::Read)
                        .map(|(c, _)| c as u16)
                        .collect();
                    let writes = s
                        .entitlements
                        .iter()
                        .enumerate()
                        .filter(|&(_, a)| *a == Access::Write)
                        .map(|(c, _)| c as u16)
                        .collect();
                    (reads, writes)
                })
                .collect();
            let inputs: Vec<PlanInput> = systems
                .iter()
                .enumerate()
                .filter(|(_, s)| s.group == g)
                .map(|(i, s)| PlanInput {
                    index: i,
                    type_id: s.type_id,
                    name: &s.name,
                    reads: &reads_writes[i].0,
                    writes: &reads_writes[i].1,
                    before: &s.before,
                    after: &s.after,
                })
                .collect();
            plans.push(scheduler::build_plan(g, &inputs, &world_types)?);
        }

        let system_count = systems.len();
        Ok(World {
            state: State::Setup,
            poisoned: false,
            alloc: Allocator::new(max_entities),
            shapes: ShapeTable::new(max_entities, component_count),
            components,
            channels,
            refs: RefGraph::default(),
            systems,
            plans,
            co: CoroutineEngine::new(system_count),
            pending_deletes: VecDeque::new(),
            parked_entries: Vec::new(),
            killed_entries: Vec::new(),
            frame_no: 0,
            time: 0.0,
            delta: 0.0,
            clock: None,
            last_time: 0.0,
        })
    }
}

/// The frame phases a plan can run.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialize,
    Execute,
    Finalize,
}

/// Stop/restart directives applied between frames.
#[derive(Default)]
pub struct Control {
    stop: Vec<(TypeId, &'static str)>,
    restart: Vec<(TypeId, &'static str)>,
}

impl Control {
    /// An empty directive set.
    pub fn new() -> Self {
        Control::default()
    }

    /// Stops a system: it is skipped by the plan and its queries stop
    /// accumulating transitions.
    pub fn stop<S: System>(mut self) -> Self {
        self.stop.push((TypeId::of::<S>(), std::any::type_name::<S>()));
        self
    }

    /// Restarts a stopped system. It does not backfill its reactive
    /// queries.
    pub fn restart<S: System>(mut self) -> Self {
        self.restart
            .push((TypeId::of::<S>(), std::any::type_name::<S>()));
        self
    }
}

/// A synchronous ECS world.
pub struct World {
    state: State,
    poisoned: bool,
    pub(crate) alloc: Allocator,
    pub(crate) shapes: ShapeTable,
    pub(crate) components: Vec<ComponentInfo>,
    pub(crate) channels: Vec<EventChannel<ShapeEvent>>,
    pub(crate) refs: RefGraph,
    pub(crate) systems: Vec<SystemSlot>,
    plans: Vec<Vec<usize>>,
    pub(crate) co: CoroutineEngine,
    pending_deletes: VecDeque<Entity>,
    /// Slot releases waiting for the post-frame sweep: component id,
    /// entity id, frame the removal happened in.
    parked_entries: Vec<(u16, Index, u64)>,
    /// Dead ids waiting to be recycled: entity id, frame it died in.
    killed_entries: Vec<(Index, u64)>,
    frame_no: u64,
    time: f64,
    delta: f64,
    clock: Option<Instant>,
    last_time: f64,
}

impl World {
    /// Starts a [`WorldBuilder`].
    pub fn builder() -> WorldBuilder {
        WorldBuilder::new()
    }

    /// Runs setup-phase code with full access, for creating the
    /// initial entity population. Only legal before the first frame.
    pub fn build<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Frame) -> Result<(), Error>,
    {
        if self.state != State::Setup {
            return Err(CheckError::WrongState {
                op: "build",
                state: self.state.describe(),
            }
            .into());
        }
        let mut frame = Frame {
            world: &mut *self,
            system: None,
        };
        f(&mut frame)?;
        self.flush();
        Ok(())
    }

    /// Creates an entity with the given components during setup.
    pub fn create_entity(
        &mut self,
        comps: &[(ComponentType, &[(&str, Value)])],
    ) -> Result<Entity, Error> {
        if self.state != State::Setup {
            return Err(CheckError::WrongState {
                op: "create an entity",
                state: self.state.describe(),
            }
            .into());
        }
        self.create_entity_inner(None, comps)
    }

    /// An entity facade with full access, for inspection and tests.
    pub fn entity(&mut self, e: Entity) -> EntityFacet<'_> {
        EntityFacet {
            world: self,
            system: None,
            entity: e,
        }
    }

    /// A read-only probe of an entity's shape.
    pub fn probe(&self, e: Entity) -> EntityProbe<'_> {
        EntityProbe {
            world: self,
            entity: e,
        }
    }

    /// Advances one frame on the internal monotonic clock.
    pub fn execute(&mut self) -> Result<(), Error> {
        let (time, delta) = self.sample_clock();
        self.execute_at(time, delta)
    }

    /// Advances one frame with caller-driven virtual time.
    pub fn execute_at(&mut self, time: f64, delta: f64) -> Result<(), Error> {
        self.begin_frame(time, delta)?;
        for g in 0..self.plans.len() {
            self.run_group_idx(g, Phase::Execute)?;
        }
        self.end_frame();
        Ok(())
    }

    /// Applies stop/restart directives. Legal between frames.
    pub fn control(&mut self, ctl: Control) -> Result<(), Error> {
        if self.state != State::Running && self.state != State::Setup {
            return Err(CheckError::WrongState {
                op: "control systems",
                state: self.state.describe(),
            }
            .into());
        }
        for (type_id, name) in ctl.stop {
            let slot = self.system_by_type(type_id, name)?;
            if self.systems[slot].stopped {
                warn!("stopping {}, which is already stopped", name);
            }
            self.systems[slot].stopped = true;
        }
        for (type_id, name) in ctl.restart {
            let slot = self.system_by_type(type_id, name)?;
            if self.systems[slot].stopped {
                self.systems[slot].stopped = false;
                let World {
                    ref mut systems,
                    ref mut channels,
                    ref shapes,
                    ref alloc,
                    ..
                } = *self;
                for q in &mut systems[slot].queries {
                    q.discard_backlog(channels, shapes, alloc.alive_ids().into_iter());
                }
            }
        }
        Ok(())
    }

    /// A frame driver over a subset of groups. Every group still has
    /// to run periodically or the reactive event channels overflow.
    pub fn create_custom_executor(
        &mut self,
        groups: &[SystemGroup],
    ) -> Result<CustomExecutor<'_>, Error> {
        for g in groups {
            if g.0 >= self.plans.len() {
                return Err(InternalError::new("custom executor names an unknown group").into());
            }
        }
        Ok(CustomExecutor {
            world: self,
            groups: groups.to_vec(),
            in_frame: false,
        })
    }

    /// Finalizes every system and retires the world. Legal once from
    /// any non-done state, including after a fatal frame.
    pub fn terminate(&mut self) -> Result<(), Error> {
        if self.state == State::Done {
            return Err(CheckError::WrongState {
                op: "terminate",
                state: self.state.describe(),
            }
            .into());
        }
        self.state = State::Finalizing;
        let mut first_err = None;
        for g in 0..self.plans.len() {
            if let Err(e) = self.run_group_idx(g, Phase::Finalize) {
                first_err.get_or_insert(e);
                break;
            }
        }
        self.state = State::Done;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Requests cancellation of a coroutine; it takes effect at the
    /// coroutine's next advance point.
    pub fn cancel(&mut self, h: CoroutineHandle) {
        self.co.cancel(h);
    }

    /// Whether a coroutine handle still names a live coroutine.
    pub fn coroutine_alive(&self, h: CoroutineHandle) -> bool {
        self.co.is_alive(h)
    }

    /// The number of live entities.
    pub fn live_entities(&self) -> u32 {
        self.alloc.live_count()
    }

    /// The world time of the current or most recent frame, in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Whether the world has terminated.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    // ---- frame machinery ----

    fn sample_clock(&mut self) -> (f64, f64) {
        let origin = *self.clock.get_or_insert_with(Instant::now);
        let now = origin.elapsed().as_secs_f64();
        let delta = now - self.last_time;
        self.last_time = now;
        (now, delta)
    }

    fn begin_frame(&mut self, time: f64, delta: f64) -> Result<(), Error> {
        if self.poisoned {
            return Err(CheckError::WrongState {
                op: "execute",
                state: "poisoned by an earlier failure; terminate it",
            }
            .into());
        }
        match self.state {
            State::Setup => {
                self.frame_no += 1;
                self.time = time;
                self.delta = delta;
                self.initialize_all()?;
            }
            State::Running => {}
            _ => {
                return Err(CheckError::WrongState {
                    op: "execute",
                    state: self.state.describe(),
                }
                .into())
            }
        }
        self.state = State::Executing;
        self.frame_no += 1;
        self.time = time;
        self.delta = delta;
        Ok(())
    }

    fn initialize_all(&mut self) -> Result<(), Error> {
        self.state = State::Initializing;
        for g in 0..self.plans.len() {
            self.run_group_idx(g, Phase::Initialize)?;
        }
        self.state = State::Running;
        Ok(())
    }

    fn end_frame(&mut self) {
        // Covers deletions queued outside any system (setup code, or a
        // world with an empty plan).
        self.flush();
        self.sweep();
        self.state = State::Running;
    }

    /// The post-frame sweep: releases slots whose removal is a full
    /// frame old and recycles ids of entities dead for a full frame.
    fn sweep(&mut self) {
        let frame_no = self.frame_no;
        let entries = std::mem::take(&mut self.parked_entries);
        for (c, id, frame) in entries {
            if frame < frame_no {
                // A mismatched park frame means the slot was re-parked
                // or resurrected since; the newer entry owns it.
                let _ = self.components[c as usize].storage.sweep_parked(id, frame);
            } else {
                self.parked_entries.push((c, id, frame));
            }
        }
        let killed = std::mem::take(&mut self.killed_entries);
        for (id, frame) in killed {
            if frame < frame_no {
                self.alloc.sweep_dead(id);
            } else {
                self.killed_entries.push((id, frame));
            }
        }
        self.co.clear_records();
    }

    fn run_group_idx(&mut self, group: usize, phase: Phase) -> Result<(), Error> {
        let plan = self.plans[group].clone();
        for sys in plan {
            if phase == Phase::Execute {
                if self.systems[sys].stopped {
                    continue;
                }
                self.refresh_queries(sys);
            }
            let mut instance = self.systems[sys]
                .instance
                .take()
                .ok_or_else(|| InternalError::new("system instance missing"))?;
            let result = {
                let mut frame = Frame {
                    world: &mut *self,
                    system: Some(sys),
                };
                match phase {
                    Phase::Initialize => instance.initialize(&mut frame),
                    Phase::Execute => instance.execute(&mut frame),
                    Phase::Finalize => instance.finalize(&mut frame),
                }
            };
            self.systems[sys].instance = Some(instance);
            if let Err(e) = result {
                self.poisoned = true;
                return Err(e);
            }
            if phase != Phase::Finalize {
                if let Err(e) = self.advance_coroutines(sys) {
                    self.poisoned = true;
                    return Err(e);
                }
            }
            self.flush();
        }
        Ok(())
    }

    fn refresh_queries(&mut self, sys: usize) {
        let World {
            ref mut systems,
            ref mut channels,
            ref shapes,
            ..
        } = *self;
        for q in &mut systems[sys].queries {
            q.refresh(channels, shapes);
        }
    }

    /// The between-systems pass: applies deferred entity deletions,
    /// nulls inbound references, cancels scoped coroutines and parks
    /// slot releases for the post-frame sweep.
    fn flush(&mut self) {
        while let Some(e) = self.pending_deletes.pop_front() {
            let id = e.id();
            if !self.alloc.is_valid(e) {
                warn!("flush skipped deletion of stale handle {:?}", e);
                continue;
            }
            let frame_no = self.frame_no;
            for c in self.shapes.components_of(id) {
                let t = ComponentType::new(c);
                {
                    let World {
                        ref mut components,
                        ref mut refs,
                        ..
                    } = *self;
                    let info = &mut components[c as usize];
                    if !info.storage.is_tag() {
                        if let Some(slot) = info.storage.slot_of(id) {
                            clear_ref_fields(&mut info.storage, refs, e, t, slot);
                            info.storage.park(id, frame_no);
                        }
                    }
                }
                if !self.components[c as usize].storage.is_tag() {
                    self.parked_entries.push((c, id, frame_no));
                }
                self.shapes.clear(id, t);
                self.channels[c as usize].single_write(ShapeEvent::Removed(id));
            }
            for src in self.refs.take_inbound(id) {
                let storage = &mut self.components[src.comp as usize].storage;
                if let Some(slot) = storage.slot_of(src.entity) {
                    storage.set_ref(slot, src.field as usize, None);
                }
            }
            self.alloc.bury(id);
            self.killed_entries.push((id, frame_no));
            self.co.cancel_scoped(e);
            trace!("deleted entity {:?}", e);
        }
    }

    // ---- coroutine advancement ----

    fn advance_coroutines(&mut self, sys: usize) -> Result<(), Error> {
        let mut i = 0;
        loop {
            let (slot, gen) = match self.co.order[sys].get(i) {
                Some(&p) => p,
                None => break,
            };
            i += 1;
            if !self.co.valid(slot, gen) {
                continue;
            }

            // A failure injected by a child propagates before anything
            // else happens to this coroutine.
            if let Some(err) = self.co.state_mut(slot).and_then(|s| s.failed.take()) {
                self.co.fail(slot, err)?;
                continue;
            }

            let mut cancel = {
                let state = match self.co.state(slot) {
                    Some(s) => s,
                    None => continue,
                };
                state.canceled
                    || state.scope.map_or(false, |e| !self.alloc.is_alive(e))
                    || match (state.cancel_missing, state.scope) {
                        (Some(t), Some(e)) => {
                            self.alloc.is_alive(e) && !self.shapes.has(e.id(), t)
                        }
                        _ => false,
                    }
                    || self.co.superseded(slot)
            };
            if !cancel {
                if let Some(pred) = self.co.state_mut(slot).and_then(|s| s.cancel_pred.take()) {
                    cancel = pred(self);
                    if let Some(state) = self.co.state_mut(slot) {
                        state.cancel_pred = Some(pred);
                    }
                }
            }
            self.co.mark_seen(slot);
            if cancel {
                trace!("coroutine in system {} canceled", self.systems[sys].name);
                self.co.cancel_now(slot)?;
                continue;
            }

            let now = self.time;
            let mut ready = false;
            let mut check_until = false;
            if let Some(state) = self.co.state_mut(slot) {
                match state.wait {
                    Wait::Ready => ready = true,
                    Wait::Frames(ref mut n) => {
                        if *n <= 1 {
                            ready = true;
                        } else {
                            *n -= 1;
                        }
                    }
                    Wait::Seconds(deadline) => ready = now >= deadline,
                    Wait::Until(_) => check_until = true,
                    // Resumption is driven by the child's completion.
                    Wait::Child(_) => {}
                }
            }
            if check_until {
                let pred = match std::mem::replace(
                    &mut self
                        .co
                        .state_mut(slot)
                        .ok_or_else(|| InternalError::new("coroutine vanished mid-advance"))?
                        .wait,
                    Wait::Ready,
                ) {
                    Wait::Until(f) => f,
                    _ => return Err(InternalError::new("wait kind changed mid-advance").into()),
                };
                ready = pred(self);
                if !ready {
                    if let Some(state) = self.co.state_mut(slot) {
                        state.wait = Wait::Until(pred);
                    }
                }
            }
            if ready {
                self.resume_coroutine(sys, slot)?;
            }
        }
        self.co.compact_order(sys);
        Ok(())
    }

    fn resume_coroutine(&mut self, sys: usize, slot: u32) -> Result<(), Error> {
        let mut body = self
            .co
            .take_body(slot)
            .ok_or_else(|| InternalError::new("resume of a bodiless coroutine"))?;
        let input = self.co.state_mut(slot).and_then(|s| s.child_value.take());
        let result = {
            let mut frame = Frame {
                world: &mut *self,
                system: Some(sys),
            };
            body.resume(&mut frame, input)
        };
        self.co.put_body(slot, body);
        match result {
            Ok(Step::Yield(waypoint)) => {
                let wait = match waypoint {
                    Waypoint::NextFrame => Wait::Frames(1),
                    Waypoint::Frames(n) => Wait::Frames(n.max(1)),
                    Waypoint::Seconds(s) => Wait::Seconds(self.time + s),
                    Waypoint::Until(f) => Wait::Until(f),
                    Waypoint::Child(h) => {
                        if self.co.is_alive(h) {
                            self.co.link(slot, h.slot);
                            Wait::Child(h.slot)
                        } else {
                            // The child already resolved; resume next
                            // pass without a value.
                            Wait::Frames(1)
                        }
                    }
                };
                if let Some(state) = self.co.state_mut(slot) {
                    state.wait = wait;
                }
                Ok(())
            }
            Ok(Step::Return(value)) => {
                self.co.complete(slot, value);
                Ok(())
            }
            Err(e) => self.co.fail(slot, e),
        }
    }

    // ---- entity lifecycle internals ----

    fn system_by_type(&self, type_id: TypeId, name: &'static str) -> Result<usize, Error> {
        self.systems
            .iter()
            .position(|s| s.type_id == type_id)
            .ok_or_else(|| {
                CheckError::UnknownSystem {
                    system: name.into(),
                }
                .into()
            })
    }

    fn check_handle_alive(&self, e: Entity) -> Result<(), Error> {
        if !self.alloc.is_valid(e) {
            return Err(CheckError::StaleEntity { entity: e }.into());
        }
        if !self.alloc.is_alive(e) {
            return Err(CheckError::NotAlive { entity: e }.into());
        }
        Ok(())
    }

    fn check_entitlement(
        &self,
        system: Option<usize>,
        t: ComponentType,
        write: bool,
    ) -> Result<(), Error> {
        let sys = match system {
            Some(s) => s,
            // Setup and inspection run with full access.
            None => return Ok(()),
        };
        let access = self.systems[sys].entitlements[t.id() as usize];
        let ok = if write {
            access == Access::Write
        } else {
            access != Access::None
        };
        if ok {
            Ok(())
        } else {
            Err(CheckError::NotEntitled {
                component: self.components[t.id() as usize].name.clone(),
                access: if write { "write" } else { "read" },
            }
            .into())
        }
    }

    fn run_validators(&mut self, e: Entity) -> Result<(), Error> {
        let id = e.id();
        for c in self.shapes.components_of(id) {
            let validator = self.components[c as usize].validator.take();
            if let Some(v) = validator {
                let result = {
                    let probe = EntityProbe {
                        world: &*self,
                        entity: e,
                    };
                    v(&probe)
                };
                self.components[c as usize].validator = Some(v);
                result?;
            }
        }
        Ok(())
    }

    fn facet_add(
        &mut self,
        system: Option<usize>,
        e: Entity,
        t: ComponentType,
        values: &[(&str, Value)],
    ) -> Result<(), Error> {
        let id = e.id();
        self.check_handle_alive(e)?;
        self.check_entitlement(system, t, true)?;
        let c = t.id() as usize;
        if self.shapes.has(id, t) {
            return Err(CheckError::AlreadyPresent {
                component: self.components[c].name.clone(),
            }
            .into());
        }
        // A slot still parked for this entity is resurrected: the old
        // field values survive and defaults are not re-applied.
        let resurrected = self.components[c].storage.unpark(id);
        let slot = match resurrected {
            Some(_) => self.components[c]
                .storage
                .slot_of(id)
                .ok_or_else(|| InternalError::new("parked slot without a mapping"))?,
            None => self.components[c].storage.acquire(id)?,
        };
        self.shapes.set(id, t);
        let applied = {
            let World {
                ref mut components,
                ref mut refs,
                ref alloc,
                ..
            } = *self;
            let info = &mut components[c];
            init_instance(
                &info.schema,
                &mut info.storage,
                refs,
                alloc,
                e,
                t,
                slot,
                values,
                resurrected.is_none(),
            )
        };
        let outcome = match applied {
            Ok(()) => self.run_validators(e),
            err => err,
        };
        if let Err(err) = outcome {
            {
                let World {
                    ref mut components,
                    ref mut refs,
                    ..
                } = *self;
                let info = &mut components[c];
                clear_ref_fields(&mut info.storage, refs, e, t, slot);
            }
            self.shapes.clear(id, t);
            match resurrected {
                Some(frame) => self.components[c].storage.park(id, frame),
                None => {
                    if !self.components[c].storage.is_tag() {
                        let _ = self.components[c].storage.release(id);
                    }
                }
            }
            return Err(err);
        }
        self.channels[c].single_write(ShapeEvent::Added(id));
        Ok(())
    }

    fn facet_remove(
        &mut self,
        system: Option<usize>,
        e: Entity,
        t: ComponentType,
    ) -> Result<(), Error> {
        let id = e.id();
        self.check_handle_alive(e)?;
        self.check_entitlement(system, t, true)?;
        let c = t.id() as usize;
        if !self.shapes.has(id, t) {
            return Err(CheckError::NotPresent {
                component: self.components[c].name.clone(),
            }
            .into());
        }
        // Validators observe the post-change shape; a throw restores it.
        self.shapes.clear(id, t);
        if let Err(err) = self.run_validators(e) {
            self.shapes.set(id, t);
            return Err(err);
        }
        if !self.components[c].storage.is_tag() {
            let slot = self.components[c]
                .storage
                .slot_of(id)
                .ok_or_else(|| InternalError::new("shape bit without an acquired slot"))?;
            {
                let World {
                    ref mut components,
                    ref mut refs,
                    ..
                } = *self;
                let info = &mut components[c];
                clear_ref_fields(&mut info.storage, refs, e, t, slot);
            }
            let frame_no = self.frame_no;
            self.components[c].storage.park(id, frame_no);
            self.parked_entries.push((t.id(), id, frame_no));
        }
        self.channels[c].single_write(ShapeEvent::Removed(id));
        Ok(())
    }

    fn bind_read(
        &self,
        system: Option<usize>,
        e: Entity,
        t: ComponentType,
    ) -> Result<CompView<'_>, Error> {
        let id = e.id();
        if !self.alloc.is_valid(e) {
            return Err(CheckError::StaleEntity { entity: e }.into());
        }
        self.check_entitlement(system, t, false)?;
        let c = t.id() as usize;
        let info = &self.components[c];
        let present = self.shapes.has(id, t);
        let recently_deleted = !present
            && info.storage.is_parked(id)
            && system.map_or(true, |s| self.systems[s].recent_ok);
        if !present && !recently_deleted {
            return Err(CheckError::NotPresent {
                component: info.name.clone(),
            }
            .into());
        }
        let slot = info
            .storage
            .slot_of(id)
            .ok_or_else(|| InternalError::new("bind of an unacquired entity"))?;
        Ok(CompView {
            schema: &info.schema,
            storage: &info.storage,
            slot,
        })
    }

    fn bind_write(
        &mut self,
        system: Option<usize>,
        e: Entity,
        t: ComponentType,
    ) -> Result<CompViewMut<'_>, Error> {
        let id = e.id();
        self.check_handle_alive(e)?;
        self.check_entitlement(system, t, true)?;
        let c = t.id() as usize;
        if !self.shapes.has(id, t) {
            return Err(CheckError::NotPresent {
                component: self.components[c].name.clone(),
            }
            .into());
        }
        let World {
            ref mut components,
            ref mut refs,
            ref alloc,
            ..
        } = *self;
        let info = &mut components[c];
        let slot = info
            .storage
            .slot_of(id)
            .ok_or_else(|| InternalError::new("bind of an unacquired entity"))?;
        Ok(CompViewMut {
            schema: &info.schema,
            storage: &mut info.storage,
            refs,
            alloc,
            entity: e,
            comp: t,
            slot,
        })
    }

    fn create_entity_inner(
        &mut self,
        system: Option<usize>,
        comps: &[(ComponentType, &[(&str, Value)])],
    ) -> Result<Entity, Error> {
        for &(t, _) in comps {
            self.check_entitlement(system, t, true)?;
        }
        let e = self.alloc.allocate()?;
        let id = e.id();
        let mut attached: Vec<ComponentType> = Vec::new();
        let mut failure: Option<Error> = None;
        for &(t, values) in comps {
            let c = t.id() as usize;
            if self.shapes.has(id, t) {
                failure = Some(
                    CheckError::AlreadyPresent {
                        component: self.components[c].name.clone(),
                    }
                    .into(),
                );
                break;
            }
            let slot = match self.components[c].storage.acquire(id) {
                Ok(s) => s,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            self.shapes.set(id, t);
            attached.push(t);
            let applied = {
                let World {
                    ref mut components,
                    ref mut refs,
                    ref alloc,
                    ..
                } = *self;
                let info = &mut components[c];
                init_instance(
                    &info.schema,
                    &mut info.storage,
                    refs,
                    alloc,
                    e,
                    t,
                    slot,
                    values,
                    true,
                )
            };
            if let Err(err) = applied {
                failure = Some(err);
                break;
            }
        }
        // All-or-nothing: validators run once, after every component is
        // attached; a rejected entity is retired before any event is
        // published, so nothing leaks to queries.
        if failure.is_none() {
            failure = self.run_validators(e).err();
        }
        if let Some(err) = failure {
            for t in attached {
                let c = t.id() as usize;
                if let Some(slot) = self.components[c].storage.slot_of(id) {
                    let World {
                        ref mut components,
                        ref mut refs,
                        ..
                    } = *self;
                    let info = &mut components[c];
                    clear_ref_fields(&mut info.storage, refs, e, t, slot);
                }
                self.shapes.clear(id, t);
                if !self.components[c].storage.is_tag() {
                    let _ = self.components[c].storage.release(id);
                }
            }
            self.alloc.reject(e);
            return Err(err);
        }
        for &(t, _) in comps {
            self.channels[t.id() as usize].single_write(ShapeEvent::Added(id));
        }
        Ok(e)
    }

    /// Test support: after a flush, a set shape bit implies an acquired
    /// slot, and an acquired slot without its shape bit implies a
    /// parked (recently removed) one.
    #[cfg(test)]
    pub(crate) fn assert_shape_storage_invariant(&self) {
        for id in self.alloc.alive_ids() {
            for (c, info) in self.components.iter().enumerate() {
                if info.storage.is_tag() {
                    continue;
                }
                let t = ComponentType::new(c as u16);
                if self.shapes.has(id, t) {
                    assert!(
                        info.storage.acquired(id),
                        "{} shape bit set without storage for entity {}",
                        info.name,
                        id
                    );
                } else if info.storage.acquired(id) {
                    assert!(
                        info.storage.is_parked(id),
                        "{} slot leaked for entity {}",
                        info.name,
                        id
                    );
                }
            }
        }
    }
}

/// The per-phase execution context handed to systems and coroutines.
pub struct Frame<'w> {
    pub(crate) world: &'w mut World,
    pub(crate) system: Option<usize>,
}

impl<'w> Frame<'w> {
    /// The world time of this frame, in seconds.
    pub fn time(&self) -> f64 {
        self.world.time
    }

    /// The time elapsed since the previous frame, in seconds.
    pub fn delta(&self) -> f64 {
        self.world.delta
    }

    /// An entity facade bound to this frame's entitlements.
    pub fn entity(&mut self, e: Entity) -> EntityFacet<'_> {
        EntityFacet {
            world: &mut *self.world,
            system: self.system,
            entity: e,
        }
    }

    /// A read-only probe of an entity's shape.
    pub fn probe(&self, e: Entity) -> EntityProbe<'_> {
        EntityProbe {
            world: &*self.world,
            entity: e,
        }
    }

    /// Creates an entity with the given components. A system needs a
    /// write entitlement on each of them.
    pub fn create_entity(
        &mut self,
        comps: &[(ComponentType, &[(&str, Value)])],
    ) -> Result<Entity, Error> {
        self.world.create_entity_inner(self.system, comps)
    }

    /// The entities currently matching a query.
    pub fn current(&self, q: QueryHandle) -> Vec<Entity> {
        self.query_ids(q, |qs| qs.current_ids())
    }

    /// The entities that started matching since the system last ran.
    pub fn added(&self, q: QueryHandle) -> Vec<Entity> {
        self.query_ids(q, |qs| qs.added_ids())
    }

    /// The entities that stopped matching since the system last ran.
    pub fn removed(&self, q: QueryHandle) -> Vec<Entity> {
        self.query_ids(q, |qs| qs.removed_ids())
    }

    fn query_ids<F>(&self, q: QueryHandle, f: F) -> Vec<Entity>
    where
        F: FnOnce(&QueryState) -> Vec<Index>,
    {
        let sys = match self.system {
            Some(s) => s,
            None => return Vec::new(),
        };
        f(&self.world.systems[sys].queries[q.0])
            .into_iter()
            .map(|id| self.world.alloc.entity(id))
            .collect()
    }

    /// A prop bound to this system at registration.
    pub fn prop(&self, key: &str) -> Option<Value> {
        self.system
            .and_then(|s| self.world.systems[s].props.get(key))
    }

    /// Launches a coroutine owned by this system. It first advances in
    /// this frame's coroutine pass.
    pub fn start<C: Coroutine>(&mut self, co: C) -> Result<CoroutineStarter<'_>, Error> {
        let sys = self.system.ok_or(CheckError::WrongState {
            op: "start a coroutine",
            state: "outside a system",
        })?;
        let (handle, record) = self.world.co.start(sys, Box::new(co));
        Ok(CoroutineStarter {
            engine: &mut self.world.co,
            handle,
            record,
        })
    }

    /// Requests cancellation of a coroutine.
    pub fn cancel(&mut self, h: CoroutineHandle) {
        self.world.co.cancel(h);
    }

    /// Whether a coroutine handle still names a live coroutine.
    pub fn coroutine_alive(&self, h: CoroutineHandle) -> bool {
        self.world.co.is_alive(h)
    }
}

/// The Entity API: lifecycle and component access for one entity,
/// checked against the calling system's entitlements.
pub struct EntityFacet<'a> {
    world: &'a mut World,
    system: Option<usize>,
    entity: Entity,
}

impl<'a> EntityFacet<'a> {
    /// The underlying handle.
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// The entity's pool index.
    pub fn ordinal(&self) -> Index {
        self.entity.id()
    }

    /// Whether the handle is current and the entity not (marked)
    /// deleted.
    pub fn is_alive(&self) -> bool {
        self.world.alloc.is_alive(self.entity)
    }

    /// Shape test for one component.
    pub fn has(&self, t: ComponentType) -> bool {
        self.world.alloc.is_valid(self.entity) && self.world.shapes.has(self.entity.id(), t)
    }

    /// Shape test: all of the given components.
    pub fn has_all_of(&self, ts: &[ComponentType]) -> bool {
        self.world.alloc.is_valid(self.entity)
            && self.world.shapes.has_all_of(self.entity.id(), ts)
    }

    /// Shape test: at least one of the given components.
    pub fn has_any_of(&self, ts: &[ComponentType]) -> bool {
        self.world.alloc.is_valid(self.entity)
            && self.world.shapes.has_any_of(self.entity.id(), ts)
    }

    /// Shape test: any component outside the given list.
    pub fn has_any_other_than(&self, ts: &[ComponentType]) -> bool {
        self.world.alloc.is_valid(self.entity)
            && self.world.shapes.has_any_other_than(self.entity.id(), ts)
    }

    /// How many of the given components the entity has.
    pub fn count_has(&self, ts: &[ComponentType]) -> usize {
        if !self.world.alloc.is_valid(self.entity) {
            return 0;
        }
        self.world.shapes.count_has(self.entity.id(), ts)
    }

    /// The number of live references pointing at this entity.
    pub fn ref_count(&self) -> usize {
        self.world.refs.ref_count(self.entity.id())
    }

    /// Attaches a component, initializing its fields from schema
    /// defaults overlaid with `values`, and runs validators.
    pub fn add(&mut self, t: ComponentType, values: &[(&str, Value)]) -> Result<(), Error> {
        self.world.facet_add(self.system, self.entity, t, values)
    }

    /// Detaches a component. Its reference fields are cleared and the
    /// slot release is deferred to the post-frame sweep.
    pub fn remove(&mut self, t: ComponentType) -> Result<(), Error> {
        self.world.facet_remove(self.system, self.entity, t)
    }

    /// Binds a read-only view of a component instance.
    pub fn read(&self, t: ComponentType) -> Result<CompView<'_>, Error> {
        self.world.bind_read(self.system, self.entity, t)
    }

    /// Binds a writable view of a component instance.
    pub fn write(&mut self, t: ComponentType) -> Result<CompViewMut<'_>, Error> {
        self.world.bind_write(self.system, self.entity, t)
    }

    /// Marks the entity for destruction at the next flush. The handle
    /// becomes unreferenceable immediately.
    pub fn delete(&mut self) -> Result<(), Error> {
        self.world.alloc.doom(self.entity)?;
        self.world.pending_deletes.push_back(self.entity);
        Ok(())
    }

    /// Pins the handle so the pool will not recycle the id while held.
    pub fn hold(&mut self) -> Result<(), Error> {
        if !self.world.alloc.is_valid(self.entity) {
            return Err(CheckError::StaleEntity {
                entity: self.entity,
            }
            .into());
        }
        self.world.alloc.pin(self.entity.id());
        Ok(())
    }

    /// Releases one pin taken with [`Self::hold`].
    pub fn unhold(&mut self) {
        self.world.alloc.unpin(self.entity.id());
    }
}

/// The shape-only view validators run against. Component data access
/// is denied: validators have no entitlements.
pub struct EntityProbe<'a> {
    pub(crate) world: &'a World,
    pub(crate) entity: Entity,
}

impl<'a> EntityProbe<'a> {
    /// The underlying handle.
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Whether the entity is alive.
    pub fn is_alive(&self) -> bool {
        self.world.alloc.is_alive(self.entity)
    }

    /// Shape test for one component.
    pub fn has(&self, t: ComponentType) -> bool {
        self.world.shapes.has(self.entity.id(), t)
    }

    /// Shape test: all of the given components.
    pub fn has_all_of(&self, ts: &[ComponentType]) -> bool {
        self.world.shapes.has_all_of(self.entity.id(), ts)
    }

    /// Shape test: at least one of the given components.
    pub fn has_any_of(&self, ts: &[ComponentType]) -> bool {
        self.world.shapes.has_any_of(self.entity.id(), ts)
    }

    /// Shape test: any component outside the given list.
    pub fn has_any_other_than(&self, ts: &[ComponentType]) -> bool {
        self.world.shapes.has_any_other_than(self.entity.id(), ts)
    }

    /// How many of the given components the entity has.
    pub fn count_has(&self, ts: &[ComponentType]) -> usize {
        self.world.shapes.count_has(self.entity.id(), ts)
    }

    /// The number of live references pointing at this entity.
    pub fn ref_count(&self) -> usize {
        self.world.refs.ref_count(self.entity.id())
    }

    /// Always fails: validators may not read component data.
    pub fn read(&self, t: ComponentType) -> Result<CompView<'a>, Error> {
        Err(CheckError::NotEntitled {
            component: self.world.components[t.id() as usize].name.clone(),
            access: "read",
        }
        .into())
    }

    /// Always fails: validators may not write component data.
    pub fn write(&self, t: ComponentType) -> Result<(), Error> {
        Err(CheckError::NotEntitled {
            component: self.world.components[t.id() as usize].name.clone(),
            access: "write",
        }
        .into())
    }
}

/// A frame driver over explicit group subsets, from
/// [`World::create_custom_executor`].
pub struct CustomExecutor<'w> {
    world: &'w mut World,
    groups: Vec<SystemGroup>,
    in_frame: bool,
}

impl<'w> CustomExecutor<'w> {
    /// Opens a frame on the internal clock.
    pub fn begin(&mut self) -> Result<(), Error> {
        let (time, delta) = self.world.sample_clock();
        self.begin_at(time, delta)
    }

    /// Opens a frame with caller-driven virtual time.
    pub fn begin_at(&mut self, time: f64, delta: f64) -> Result<(), Error> {
        self.world.begin_frame(time, delta)?;
        self.in_frame = true;
        Ok(())
    }

    /// Runs one group's plan within the open frame.
    pub fn execute(&mut self, group: SystemGroup) -> Result<(), Error> {
        if !self.in_frame {
            return Err(CheckError::WrongState {
                op: "execute a group",
                state: "outside an open frame",
            }
            .into());
        }
        if !self.groups.contains(&group) {
            return Err(CheckError::WrongState {
                op: "execute a group",
                state: "not covered by this executor",
            }
            .into());
        }
        self.world.run_group_idx(group.0, Phase::Execute)
    }

    /// Closes the frame, running the post-frame sweep.
    pub fn end(&mut self) -> Result<(), Error> {
        if !self.in_frame {
            return Err(CheckError::WrongState {
                op: "end a frame",
                state: "outside an open frame",
            }
            .into());
        }
        self.world.end_frame();
        self.in_frame = false;
        Ok(())
    }
}
