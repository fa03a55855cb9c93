//! Recorded transitions and trajectories.

use crate::{MbrlError, Result};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// One environment step.
///
/// Fields are only set at construction; consumers receive shared references.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub observation: Array1<f64>,
    pub action: Array1<f64>,
    pub reward: f64,
    pub next_observation: Array1<f64>,
    /// The environment reached a terminal state (not a time-limit cut)
    pub terminal: bool,
    /// Distribution parameters (and hidden state) recorded with the action
    pub agent_info: BTreeMap<String, Array1<f64>>,
}

/// An ordered sequence of transitions from a single rollout.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Path {
    transitions: Vec<Transition>,
}

fn stack<'a>(rows: impl ExactSizeIterator<Item = &'a Array1<f64>>, width: usize) -> Array2<f64> {
    let rows: Vec<_> = rows.collect();
    Array2::from_shape_fn((rows.len(), width), |(i, j)| rows[i][j])
}

impl Path {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition whose widths match the ones already recorded.
    pub fn push(&mut self, transition: Transition) -> Result<()> {
        if let Some(first) = self.transitions.first() {
            let expected = [
                first.observation.len(),
                first.action.len(),
                first.next_observation.len(),
            ];
            let actual = [
                transition.observation.len(),
                transition.action.len(),
                transition.next_observation.len(),
            ];
            if expected != actual {
                return Err(MbrlError::ShapeMismatch {
                    expected: expected.to_vec(),
                    actual: actual.to_vec(),
                });
            }
        }
        self.transitions.push(transition);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn obs_dim(&self) -> usize {
        self.transitions.first().map_or(0, |t| t.observation.len())
    }

    pub fn action_dim(&self) -> usize {
        self.transitions.first().map_or(0, |t| t.action.len())
    }

    pub fn observations(&self) -> Array2<f64> {
        stack(self.transitions.iter().map(|t| &t.observation), self.obs_dim())
    }

    pub fn actions(&self) -> Array2<f64> {
        stack(self.transitions.iter().map(|t| &t.action), self.action_dim())
    }

    pub fn next_observations(&self) -> Array2<f64> {
        stack(
            self.transitions.iter().map(|t| &t.next_observation),
            self.obs_dim(),
        )
    }

    pub fn rewards(&self) -> Array1<f64> {
        self.transitions.iter().map(|t| t.reward).collect()
    }

    pub fn terminals(&self) -> Array1<bool> {
        self.transitions.iter().map(|t| t.terminal).collect()
    }

    /// Stacked agent-info entry, if the first transition has it
    pub fn agent_info(&self, key: &str) -> Option<Array2<f64>> {
        let width = self.transitions.first()?.agent_info.get(key)?.len();
        let rows = self
            .transitions
            .iter()
            .map(|t| t.agent_info.get(key))
            .collect::<Option<Vec<_>>>()?;
        if rows.iter().any(|r| r.len() != width) {
            return None;
        }
        Some(stack(rows.into_iter(), width))
    }

    pub fn undiscounted_return(&self) -> f64 {
        self.transitions.iter().map(|t| t.reward).sum()
    }

    /// Whether the path ended in a terminal state
    pub fn is_terminated(&self) -> bool {
        self.transitions.last().map_or(false, |t| t.terminal)
    }
}

impl FromIterator<Transition> for Path {
    fn from_iter<I: IntoIterator<Item = Transition>>(iter: I) -> Self {
        Self {
            transitions: iter.into_iter().collect(),
        }
    }
}
