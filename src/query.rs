//! The reactive query engine.
//!
//! The lifecycle subsystem publishes shape events into one
//! `EventChannel` per component type; each query holds a `ReaderId`
//! per predicate component and, when its system is about to run,
//! drains them and re-evaluates the touched entities against its mask.
//! Membership is kept in three disjoint bitsets: `current`, `added`
//! and `removed` — the net transitions witnessed since the system last
//! ran. Channels are ring buffers, so every group has to run
//! periodically or the backlog overflows.

use hibitset::{BitSet, BitSetLike};
use shrev::{EventChannel, ReaderId};

use crate::entity::{Index, ShapeTable};
use crate::scheduler::QuerySpec;

/// A shape transition of one entity for one component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShapeEvent {
    Added(Index),
    Removed(Index),
}

impl ShapeEvent {
    fn entity(&self) -> Index {
        match *self {
            ShapeEvent::Added(id) | ShapeEvent::Removed(id) => id,
        }
    }
}

/// The runtime state of one declared query.
pub(crate) struct QueryState {
    pub spec: QuerySpec,
    readers: Vec<(u16, ReaderId<ShapeEvent>)>,
    pub current: BitSet,
    pub added: BitSet,
    pub removed: BitSet,
}

impl QueryState {
    pub fn new(spec: QuerySpec, channels: &mut [EventChannel<ShapeEvent>]) -> Self {
        let mut tracked: Vec<u16> = spec
            .with
            .iter()
            .chain(spec.without.iter())
            .map(|t| t.id())
            .collect();
        tracked.sort_unstable();
        tracked.dedup();
        let readers = tracked
            .into_iter()
            .map(|c| (c, channels[c as usize].register_reader()))
            .collect();
        QueryState {
            spec,
            readers,
            current: BitSet::new(),
            added: BitSet::new(),
            removed: BitSet::new(),
        }
    }

    /// Whether an entity's present shape satisfies the mask.
    pub fn matches(&self, shapes: &ShapeTable, id: Index) -> bool {
        self.spec.with.iter().all(|&c| shapes.has(id, c))
            && !self.spec.without.iter().any(|&c| shapes.has(id, c))
    }

    /// Consumes the event backlog and recomputes membership. Called
    /// right before the owning system runs; `added`/`removed` from the
    /// previous run are consumed here.
    pub fn refresh(&mut self, channels: &mut [EventChannel<ShapeEvent>], shapes: &ShapeTable) {
        self.added.clear();
        self.removed.clear();
        let mut touched = Vec::new();
        for (comp, reader) in &mut self.readers {
            for event in channels[*comp as usize].read(reader) {
                touched.push(event.entity());
            }
        }
        for id in touched {
            let matches = self.matches(shapes, id);
            let held = self.current.contains(id);
            if matches && !held {
                self.current.add(id);
                if self.removed.contains(id) {
                    // Left and returned between runs: nets out.
                    self.removed.remove(id);
                } else {
                    self.added.add(id);
                }
            } else if !matches && held {
                self.current.remove(id);
                if self.added.contains(id) {
                    self.added.remove(id);
                } else {
                    self.removed.add(id);
                }
            }
        }
    }

    /// Restart path: the backlog is dropped without producing
    /// transitions and `current` is rebuilt from the live shapes.
    pub fn discard_backlog(
        &mut self,
        channels: &mut [EventChannel<ShapeEvent>],
        shapes: &ShapeTable,
        alive: impl Iterator<Item = Index>,
    ) {
        for (comp, reader) in &mut self.readers {
            for _ in channels[*comp as usize].read(reader) {}
        }
        self.added.clear();
        self.removed.clear();
        self.current.clear();
        for id in alive {
            if self.matches(shapes, id) {
                self.current.add(id);
            }
        }
    }

    pub fn current_ids(&self) -> Vec<Index> {
        (&self.current).iter().collect()
    }

    pub fn added_ids(&self) -> Vec<Index> {
        (&self.added).iter().collect()
    }

    pub fn removed_ids(&self) -> Vec<Index> {
        (&self.removed).iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentType;

    fn setup(n_comps: usize) -> (Vec<EventChannel<ShapeEvent>>, ShapeTable) {
        let channels = (0..n_comps).map(|_| EventChannel::new()).collect();
        (channels, ShapeTable::new(64, n_comps))
    }

    fn spec(with: &[ComponentType], without: &[ComponentType]) -> QuerySpec {
        QuerySpec {
            with: with.to_vec(),
            without: without.to_vec(),
            ..QuerySpec::default()
        }
    }

    #[test]
    fn transitions_are_disjoint() {
        let a = ComponentType::new(0);
        let (mut channels, mut shapes) = setup(1);
        let mut q = QueryState::new(spec(&[a], &[]), &mut channels);

        shapes.set(3, a);
        channels[0].single_write(ShapeEvent::Added(3));
        q.refresh(&mut channels, &shapes);
        assert_eq!(q.added_ids(), vec![3]);
        assert_eq!(q.current_ids(), vec![3]);
        assert!(q.removed_ids().is_empty());

        // Leaves and returns between runs: no transition survives.
        shapes.clear(3, a);
        channels[0].single_write(ShapeEvent::Removed(3));
        shapes.set(3, a);
        channels[0].single_write(ShapeEvent::Added(3));
        q.refresh(&mut channels, &shapes);
        assert!(q.added_ids().is_empty());
        assert!(q.removed_ids().is_empty());
        assert_eq!(q.current_ids(), vec![3]);

        shapes.clear(3, a);
        channels[0].single_write(ShapeEvent::Removed(3));
        q.refresh(&mut channels, &shapes);
        assert_eq!(q.removed_ids(), vec![3]);
        assert!(q.current_ids().is_empty());
    }

    #[test]
    fn without_excludes() {
        let a = ComponentType::new(0);
        let b = ComponentType::new(1);
        let (mut channels, mut shapes) = setup(2);
        let mut q = QueryState::new(spec(&[a], &[b]), &mut channels);

        shapes.set(1, a);
        channels[0].single_write(ShapeEvent::Added(1));
        shapes.set(2, a);
        shapes.set(2, b);
        channels[0].single_write(ShapeEvent::Added(2));
        channels[1].single_write(ShapeEvent::Added(2));
        q.refresh(&mut channels, &shapes);
        assert_eq!(q.current_ids(), vec![1]);

        // Removing the excluded component makes entity 2 match.
        shapes.clear(2, b);
        channels[1].single_write(ShapeEvent::Removed(2));
        q.refresh(&mut channels, &shapes);
        assert_eq!(q.current_ids(), vec![1, 2]);
        assert_eq!(q.added_ids(), vec![2]);
    }

    #[test]
    fn restart_discards_backlog() {
        let a = ComponentType::new(0);
        let (mut channels, mut shapes) = setup(1);
        let mut q = QueryState::new(spec(&[a], &[]), &mut channels);

        shapes.set(5, a);
        channels[0].single_write(ShapeEvent::Added(5));
        q.discard_backlog(&mut channels, &shapes, [5u32].into_iter());
        assert!(q.added_ids().is_empty());
        assert_eq!(q.current_ids(), vec![5]);

        // Nothing pending afterwards either.
        q.refresh(&mut channels, &shapes);
        assert!(q.added_ids().is_empty());
        assert_eq!(q.current_ids(), vec![5]);
    }
}
