//! The cooperative coroutine engine.
//!
//! A coroutine is a tagged state machine owned by a system: each
//! `resume` runs until it yields a [`Waypoint`] telling the engine when
//! to resume it, or returns a final [`Value`]. All active coroutines of
//! a system advance after that system's `execute`, in the order they
//! were started. Cancellation is cooperative and multi-source: an
//! external handle, a predicate, a missing component on the scoped
//! entity, deletion of the scoped entity, or supersession by a newer
//! start in the same system.

use crate::component::{ComponentType, Value};
use crate::entity::Entity;
use crate::error::{CanceledError, Error};
use crate::world::{Frame, World};

/// Directs the engine when to resume a suspended coroutine.
pub enum Waypoint {
    /// Resume on the next frame.
    NextFrame,
    /// Resume after this many frame advances.
    Frames(u32),
    /// Resume once this much world time has elapsed.
    Seconds(f64),
    /// Resume on the first frame the predicate returns true.
    Until(Box<dyn Fn(&World) -> bool>),
    /// Resume when the given coroutine completes or is cancelled; its
    /// return value arrives as the resume input.
    Child(CoroutineHandle),
}

/// The outcome of one `resume` call.
pub enum Step {
    /// Suspend until the waypoint is reached.
    Yield(Waypoint),
    /// Complete with a value, delivered to an awaiting parent.
    Return(Value),
}

impl Step {
    /// Shorthand for yielding to the next frame.
    pub fn next_frame() -> Self {
        Step::Yield(Waypoint::NextFrame)
    }

    /// Shorthand for a frame-count wait.
    pub fn frames(n: u32) -> Self {
        Step::Yield(Waypoint::Frames(n))
    }

    /// Shorthand for a wall-clock wait.
    pub fn seconds(s: f64) -> Self {
        Step::Yield(Waypoint::Seconds(s))
    }

    /// Shorthand for a predicate wait.
    pub fn until<F: Fn(&World) -> bool + 'static>(f: F) -> Self {
        Step::Yield(Waypoint::Until(Box::new(f)))
    }

    /// Shorthand for awaiting another coroutine.
    pub fn await_child(h: CoroutineHandle) -> Self {
        Step::Yield(Waypoint::Child(h))
    }

    /// Shorthand for completing without a meaningful value.
    pub fn done() -> Self {
        Step::Return(Value::Bool(true))
    }
}

/// A cooperative task. Implemented for free by any
/// `FnMut(&mut Frame, Option<Value>) -> Result<Step, Error>` closure;
/// the closure's captures are the coroutine's local state and the
/// `Option<Value>` input carries an awaited child's return value.
pub trait Coroutine: 'static {
    /// Runs the next segment, up to the following yield point.
    fn resume(&mut self, fx: &mut Frame, input: Option<Value>) -> Result<Step, Error>;
}

impl<F> Coroutine for F
where
    F: FnMut(&mut Frame, Option<Value>) -> Result<Step, Error> + 'static,
{
    fn resume(&mut self, fx: &mut Frame, input: Option<Value>) -> Result<Step, Error> {
        self(fx, input)
    }
}

/// A handle to a started coroutine. Stale once the coroutine ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoroutineHandle {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

pub(crate) enum Wait {
    /// Resume at the next advance of the owning system.
    Ready,
    Frames(u32),
    /// Absolute world-time deadline.
    Seconds(f64),
    Until(Box<dyn Fn(&World) -> bool>),
    /// Waiting on the child in this slot; resumption is driven by the
    /// child's completion, not by polling.
    Child(u32),
}

pub(crate) struct CoState {
    pub system: usize,
    pub body: Option<Box<dyn Coroutine>>,
    pub wait: Wait,
    pub scope: Option<Entity>,
    pub cancel_missing: Option<ComponentType>,
    pub cancel_pred: Option<Box<dyn Fn(&World) -> bool>>,
    /// `Some(filter)` enables supersession: cancel when a newer
    /// coroutine with a matching tag and equal scope starts.
    pub watch_started: Option<Option<&'static str>>,
    pub tag: Option<&'static str>,
    pub parent: Option<u32>,
    pub child: Option<u32>,
    pub canceled: bool,
    /// A failure injected by a child; consumed at the next advance.
    pub failed: Option<Error>,
    /// An awaited child's return value, delivered at the next resume.
    pub child_value: Option<Value>,
    pub seen_seq: u64,
}

struct CoSlot {
    gen: u32,
    state: Option<CoState>,
}

struct StartRecord {
    seq: u64,
    system: usize,
    slot: u32,
    tag: Option<&'static str>,
    scope: Option<Entity>,
}

/// The per-world coroutine table.
#[derive(Default)]
pub(crate) struct CoroutineEngine {
    slots: Vec<CoSlot>,
    free: Vec<u32>,
    /// Start-order advance lists, one per system.
    pub order: Vec<Vec<(u32, u32)>>,
    records: Vec<StartRecord>,
    seq: u64,
}

impl CoroutineEngine {
    pub fn new(system_count: usize) -> Self {
        CoroutineEngine {
            order: (0..system_count).map(|_| Vec::new()).collect(),
            ..CoroutineEngine::default()
        }
    }

    pub fn start(&mut self, system: usize, body: Box<dyn Coroutine>) -> (CoroutineHandle, usize) {
        self.seq += 1;
        let state = CoState {
            system,
            body: Some(body),
            wait: Wait::Ready,
            scope: None,
            cancel_missing: None,
            cancel_pred: None,
            watch_started: None,
            tag: None,
            parent: None,
            child: None,
            canceled: false,
            failed: None,
            child_value: None,
            seen_seq: self.seq,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].state = Some(state);
                slot
            }
            None => {
                self.slots.push(CoSlot {
                    gen: 1,
                    state: Some(state),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let gen = self.slots[slot as usize].gen;
        self.order[system].push((slot, gen));
        self.records.push(StartRecord {
            seq: self.seq,
            system,
            slot,
            tag: None,
            scope: None,
        });
        (CoroutineHandle { slot, gen }, self.records.len() - 1)
    }

    pub fn is_alive(&self, h: CoroutineHandle) -> bool {
        self.slots
            .get(h.slot as usize)
            .map_or(false, |s| s.gen == h.gen && s.state.is_some())
    }

    pub fn state(&self, slot: u32) -> Option<&CoState> {
        self.slots.get(slot as usize).and_then(|s| s.state.as_ref())
    }

    pub fn state_mut(&mut self, slot: u32) -> Option<&mut CoState> {
        self.slots
            .get_mut(slot as usize)
            .and_then(|s| s.state.as_mut())
    }

    pub fn valid(&self, slot: u32, gen: u32) -> bool {
        self.slots
            .get(slot as usize)
            .map_or(false, |s| s.gen == gen && s.state.is_some())
    }

    /// Requests external cancellation; honored at the next advance.
    pub fn cancel(&mut self, h: CoroutineHandle) {
        if self.is_alive(h) {
            if let Some(state) = self.state_mut(h.slot) {
                state.canceled = true;
            }
        }
    }

    /// Cancels every coroutine scoped to the entity. Called by the
    /// flush when the entity is deleted.
    pub fn cancel_scoped(&mut self, e: Entity) {
        for slot in &mut self.slots {
            if let Some(ref mut state) = slot.state {
                if state.scope == Some(e) {
                    state.canceled = true;
                }
            }
        }
    }

    /// Whether a newer start in the same system supersedes this one.
    pub fn superseded(&self, slot: u32) -> bool {
        let state = match self.state(slot) {
            Some(s) => s,
            None => return false,
        };
        let filter = match state.watch_started {
            Some(f) => f,
            None => return false,
        };
        self.records.iter().any(|r| {
            r.system == state.system
                && r.slot != slot
                && r.seq > state.seen_seq
                && filter.map_or(true, |t| r.tag == Some(t))
                && r.scope == state.scope
        })
    }

    pub fn mark_seen(&mut self, slot: u32) {
        let seq = self.seq;
        if let Some(state) = self.state_mut(slot) {
            state.seen_seq = seq;
        }
    }

    fn release(&mut self, slot: u32) {
        let s = &mut self.slots[slot as usize];
        if s.state.take().is_some() {
            s.gen += 1;
            self.free.push(slot);
        }
    }

    /// Drops a coroutine and its whole descendant chain without
    /// notifying anyone. Used below the point a failure enters.
    pub fn kill_subtree(&mut self, slot: u32) {
        let mut next = Some(slot);
        while let Some(s) = next {
            next = self.state(s).and_then(|st| st.child);
            self.release(s);
        }
    }

    /// Completes a coroutine, delivering its value to an awaiting
    /// parent.
    pub fn complete(&mut self, slot: u32, value: Value) {
        let parent = self.state(slot).and_then(|s| s.parent);
        self.release(slot);
        if let Some(p) = parent {
            if let Some(pstate) = self.state_mut(p) {
                pstate.child = None;
                pstate.child_value = Some(value);
                pstate.wait = Wait::Ready;
            }
        }
    }

    /// Fails a coroutine: descendants drop, the awaiting parent (if
    /// any) inherits the error. Returns the error when it reaches the
    /// top of a chain and is not a plain cancellation.
    pub fn fail(&mut self, slot: u32, err: Error) -> Result<(), Error> {
        let (parent, child) = match self.state(slot) {
            Some(s) => (s.parent, s.child),
            None => return Ok(()),
        };
        if let Some(c) = child {
            self.kill_subtree(c);
        }
        self.release(slot);
        match parent {
            Some(p) => {
                if let Some(pstate) = self.state_mut(p) {
                    pstate.child = None;
                    pstate.failed = Some(err);
                }
                Ok(())
            }
            None if err.is_canceled() => Ok(()),
            None => Err(err),
        }
    }

    /// Convenience for the cancellation paths.
    pub fn cancel_now(&mut self, slot: u32) -> Result<(), Error> {
        self.fail(slot, CanceledError.into())
    }

    /// Links a parent awaiting a child.
    pub fn link(&mut self, parent: u32, child: u32) {
        if let Some(c) = self.state_mut(child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.state_mut(parent) {
            p.child = Some(child);
            p.wait = Wait::Child(child);
        }
    }

    pub fn take_body(&mut self, slot: u32) -> Option<Box<dyn Coroutine>> {
        self.state_mut(slot).and_then(|s| s.body.take())
    }

    pub fn put_body(&mut self, slot: u32, body: Box<dyn Coroutine>) {
        if let Some(s) = self.state_mut(slot) {
            s.body = Some(body);
        }
    }

    /// Drops the frame's start records; supersession only looks at
    /// starts since each coroutine's previous check.
    pub fn clear_records(&mut self) {
        self.records.clear();
    }

    pub fn update_record(
        &mut self,
        rec: usize,
        tag: Option<&'static str>,
        scope: Option<Entity>,
    ) {
        if let Some(r) = self.records.get_mut(rec) {
            if tag.is_some() {
                r.tag = tag;
            }
            if scope.is_some() {
                r.scope = scope;
            }
        }
    }

    /// Compacts a system's advance list, dropping entries whose
    /// coroutine has ended.
    pub fn compact_order(&mut self, system: usize) {
        let slots = &self.slots;
        self.order[system]
            .retain(|&(slot, gen)| slots[slot as usize].gen == gen && slots[slot as usize].state.is_some());
    }
}

/// Builder-style modifiers for a freshly started coroutine, returned
/// by `Frame::start`.
pub struct CoroutineStarter<'a> {
    pub(crate) engine: &'a mut CoroutineEngine,
    pub(crate) handle: CoroutineHandle,
    pub(crate) record: usize,
}

impl<'a> CoroutineStarter<'a> {
    /// The handle of the started coroutine.
    pub fn handle(&self) -> CoroutineHandle {
        self.handle
    }

    /// Scopes the coroutine to an entity: deleting the entity cancels
    /// it.
    pub fn scope(self, e: Entity) -> Self {
        if let Some(state) = self.engine.state_mut(self.handle.slot) {
            state.scope = Some(e);
        }
        self.engine.update_record(self.record, None, Some(e));
        self
    }

    /// Cancels the coroutine when the predicate turns true, evaluated
    /// every frame.
    pub fn cancel_if<F: Fn(&World) -> bool + 'static>(self, f: F) -> Self {
        if let Some(state) = self.engine.state_mut(self.handle.slot) {
            state.cancel_pred = Some(Box::new(f));
        }
        self
    }

    /// Cancels the coroutine when the scoped entity no longer has the
    /// component.
    pub fn cancel_if_component_missing(self, t: ComponentType) -> Self {
        if let Some(state) = self.engine.state_mut(self.handle.slot) {
            state.cancel_missing = Some(t);
        }
        self
    }

    /// Cancels the coroutine when any newer coroutine with an equal
    /// scope starts in the same system. A coroutine never cancels
    /// itself through this rule.
    pub fn cancel_if_coroutine_started(self) -> Self {
        if let Some(state) = self.engine.state_mut(self.handle.slot) {
            state.watch_started = Some(None);
        }
        self
    }

    /// Like [`Self::cancel_if_coroutine_started`], but only newer
    /// starts carrying this tag count.
    pub fn cancel_if_coroutine_started_tagged(self, tag: &'static str) -> Self {
        if let Some(state) = self.engine.state_mut(self.handle.slot) {
            state.watch_started = Some(Some(tag));
        }
        self
    }

    /// Tags the coroutine for supersession matching.
    pub fn tag(self, tag: &'static str) -> Self {
        if let Some(state) = self.engine.state_mut(self.handle.slot) {
            state.tag = Some(tag);
        }
        self.engine.update_record(self.record, Some(tag), None);
        self
    }
}
