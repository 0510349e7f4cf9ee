//! Navigation over a journey's ordered step list.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::types::{JourneyStep, StepType};

/// Borrowed view of a step list, ordered by `order_no`.
pub struct StepGraph<'a> {
    steps: &'a [JourneyStep],
    index: HashMap<Uuid, usize>,
}

impl<'a> StepGraph<'a> {
    /// `steps` must already be sorted by `order_no`.
    pub fn new(steps: &'a [JourneyStep]) -> Self {
        let index = steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        Self { steps, index }
    }

    pub fn first(&self) -> Option<&'a JourneyStep> {
        self.steps.first()
    }

    pub fn get(&self, id: Uuid) -> Option<&'a JourneyStep> {
        self.index.get(&id).map(|i| &self.steps[*i])
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Successor of a non-branching step: its explicit `next_step`, or the
    /// step that follows it in order. `None` means the journey ends there.
    pub fn successor(&self, step: &JourneyStep) -> Option<&'a JourneyStep> {
        if step.step_type() == StepType::End {
            return None;
        }
        match step.next_step {
            Some(target) => self.get(target),
            None => self
                .index
                .get(&step.id)
                .and_then(|i| self.steps.get(i + 1)),
        }
    }

    /// All outgoing edges of a step, including dangling ones.
    pub fn edges(&self, step: &JourneyStep) -> Vec<Uuid> {
        match step.step_type() {
            StepType::End => Vec::new(),
            StepType::Condition => step.on_true.into_iter().chain(step.on_false).collect(),
            _ => match step.next_step {
                Some(target) => vec![target],
                None => self
                    .index
                    .get(&step.id)
                    .and_then(|i| self.steps.get(i + 1))
                    .map(|s| vec![s.id])
                    .unwrap_or_default(),
            },
        }
    }

    /// Ids of every step reachable from the first step.
    pub fn reachable(&self) -> HashSet<Uuid> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Uuid> = self.first().map(|s| s.id).into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(step) = self.get(id) {
                queue.extend(self.edges(step).into_iter().filter(|t| self.contains(*t)));
            }
        }
        seen
    }
}
