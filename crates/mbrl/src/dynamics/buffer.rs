//! Bounded FIFO replay buffer.

use crate::{MbrlError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Row-aligned transition arrays
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionArrays {
    pub observations: Array2<f64>,
    pub actions: Array2<f64>,
    pub next_observations: Array2<f64>,
    pub rewards: Array1<f64>,
}

impl TransitionArrays {
    pub fn empty(obs_dim: usize, act_dim: usize) -> Self {
        Self {
            observations: Array2::zeros((0, obs_dim)),
            actions: Array2::zeros((0, act_dim)),
            next_observations: Array2::zeros((0, obs_dim)),
            rewards: Array1::zeros(0),
        }
    }

    pub fn from_views(
        observations: ArrayView2<f64>,
        actions: ArrayView2<f64>,
        next_observations: ArrayView2<f64>,
        rewards: ArrayView1<f64>,
    ) -> Result<Self> {
        let n = observations.nrows();
        if actions.nrows() != n
            || next_observations.nrows() != n
            || rewards.len() != n
            || next_observations.ncols() != observations.ncols()
        {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![n, observations.ncols()],
                actual: vec![
                    actions.nrows(),
                    next_observations.nrows(),
                    rewards.len(),
                    next_observations.ncols(),
                ],
            });
        }
        Ok(Self {
            observations: observations.to_owned(),
            actions: actions.to_owned(),
            next_observations: next_observations.to_owned(),
            rewards: rewards.to_owned(),
        })
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            observations: self.observations.select(Axis(0), rows),
            actions: self.actions.select(Axis(0), rows),
            next_observations: self.next_observations.select(Axis(0), rows),
            rewards: self.rewards.select(Axis(0), rows),
        }
    }

    /// Rows of `self` followed by rows of `other`
    pub fn concat(&self, other: &Self) -> Result<Self> {
        let stack2 = |a: &Array2<f64>, b: &Array2<f64>| {
            ndarray::concatenate(Axis(0), &[a.view(), b.view()])
                .map_err(|e| MbrlError::NumericalError(e.to_string()))
        };
        Ok(Self {
            observations: stack2(&self.observations, &other.observations)?,
            actions: stack2(&self.actions, &other.actions)?,
            next_observations: stack2(&self.next_observations, &other.next_observations)?,
            rewards: ndarray::concatenate(Axis(0), &[self.rewards.view(), other.rewards.view()])
                .map_err(|e| MbrlError::NumericalError(e.to_string()))?,
        })
    }
}

/// Serializable buffer contents, oldest first
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferRecord {
    pub capacity: usize,
    pub observations: Vec<Vec<f64>>,
    pub actions: Vec<Vec<f64>>,
    pub next_observations: Vec<Vec<f64>>,
    pub rewards: Vec<f64>,
}

/// Transitions of real interaction, evicted oldest-first beyond `capacity`.
#[derive(Clone, Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    obs_dim: usize,
    act_dim: usize,
    observations: VecDeque<Array1<f64>>,
    actions: VecDeque<Array1<f64>>,
    next_observations: VecDeque<Array1<f64>>,
    rewards: VecDeque<f64>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, obs_dim: usize, act_dim: usize) -> Self {
        Self {
            capacity,
            obs_dim,
            act_dim,
            observations: VecDeque::new(),
            actions: VecDeque::new(),
            next_observations: VecDeque::new(),
            rewards: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append rows, evicting the oldest beyond capacity. Returns the number evicted.
    pub fn extend(&mut self, data: &TransitionArrays) -> Result<usize> {
        if data.observations.ncols() != self.obs_dim || data.actions.ncols() != self.act_dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.obs_dim, self.act_dim],
                actual: vec![data.observations.ncols(), data.actions.ncols()],
            });
        }
        for i in 0..data.len() {
            self.observations.push_back(data.observations.row(i).to_owned());
            self.actions.push_back(data.actions.row(i).to_owned());
            self.next_observations
                .push_back(data.next_observations.row(i).to_owned());
            self.rewards.push_back(data.rewards[i]);
        }
        let mut evicted = 0;
        while self.rewards.len() > self.capacity {
            self.observations.pop_front();
            self.actions.pop_front();
            self.next_observations.pop_front();
            self.rewards.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> TransitionArrays {
        let n = self.len();
        let rows = |q: &VecDeque<Array1<f64>>, width: usize| {
            Array2::from_shape_fn((n, width), |(i, j)| q[i][j])
        };
        TransitionArrays {
            observations: rows(&self.observations, self.obs_dim),
            actions: rows(&self.actions, self.act_dim),
            next_observations: rows(&self.next_observations, self.obs_dim),
            rewards: self.rewards.iter().copied().collect(),
        }
    }

    /// `n` observations drawn uniformly with replacement
    pub fn sample_observations<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Option<Array2<f64>> {
        if self.is_empty() {
            return None;
        }
        let picks: Vec<usize> = (0..n).map(|_| rng.gen_range(0..self.len())).collect();
        Some(Array2::from_shape_fn((n, self.obs_dim), |(i, j)| {
            self.observations[picks[i]][j]
        }))
    }

    pub fn record(&self) -> BufferRecord {
        let rows = |q: &VecDeque<Array1<f64>>| q.iter().map(|r| r.to_vec()).collect();
        BufferRecord {
            capacity: self.capacity,
            observations: rows(&self.observations),
            actions: rows(&self.actions),
            next_observations: rows(&self.next_observations),
            rewards: self.rewards.iter().copied().collect(),
        }
    }

    pub fn load_record(&mut self, record: &BufferRecord) -> Result<()> {
        let n = record.rewards.len();
        let consistent = record.observations.len() == n
            && record.actions.len() == n
            && record.next_observations.len() == n
            && record.observations.iter().all(|r| r.len() == self.obs_dim)
            && record.next_observations.iter().all(|r| r.len() == self.obs_dim)
            && record.actions.iter().all(|r| r.len() == self.act_dim);
        if !consistent {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![n, self.obs_dim, self.act_dim],
                actual: vec![record.observations.len(), record.actions.len()],
            });
        }
        let rows = |v: &Vec<Vec<f64>>| v.iter().map(|r| Array1::from(r.clone())).collect();
        self.observations = rows(&record.observations);
        self.actions = rows(&record.actions);
        self.next_observations = rows(&record.next_observations);
        self.rewards = record.rewards.iter().copied().collect();
        while self.rewards.len() > self.capacity {
            self.observations.pop_front();
            self.actions.pop_front();
            self.next_observations.pop_front();
            self.rewards.pop_front();
        }
        Ok(())
    }
}
