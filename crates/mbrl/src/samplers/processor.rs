//! Turning trajectories into optimizer-ready batches.

use super::Path;
use crate::baselines::Baseline;
use crate::utils::{discount_cumsum, explained_variance, mean_std, stack_rows};
use crate::{MbrlError, Result};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Advantage estimation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub discount: f64,
    pub gae_lambda: f64,
    /// Standardize advantages over the batch
    pub normalize_adv: bool,
    /// Shift advantages so the smallest is (just above) zero
    pub positive_adv: bool,
    /// Chunk length for recurrent policies; `None` flattens per step
    pub backprop_steps: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            discount: 0.99,
            gae_lambda: 1.0,
            normalize_adv: true,
            positive_adv: false,
            backprop_steps: None,
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.discount) {
            return Err(MbrlError::ConfigError("discount must be in [0, 1]".to_string()));
        }
        if !(0.0..=1.0).contains(&self.gae_lambda) {
            return Err(MbrlError::ConfigError("gae_lambda must be in [0, 1]".to_string()));
        }
        if self.backprop_steps == Some(0) {
            return Err(MbrlError::ConfigError("backprop_steps must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Row-aligned arrays for one optimization call.
///
/// Row `i` of every array refers to the same transition; paths are laid out
/// back to back in the order they were given.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedBatch {
    pub observations: Array2<f64>,
    pub actions: Array2<f64>,
    pub next_observations: Array2<f64>,
    pub rewards: Array1<f64>,
    pub dones: Array1<bool>,
    pub returns: Array1<f64>,
    pub advantages: Array1<f64>,
    pub baselines: Array1<f64>,
    pub agent_infos: BTreeMap<String, Array2<f64>>,
    pub path_lengths: Vec<usize>,
    /// Row ranges of at most `backprop_steps` rows, never spanning two paths
    pub chunks: Option<Vec<Range<usize>>>,
    pub stats: BTreeMap<String, f64>,
}

impl ProcessedBatch {
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn num_paths(&self) -> usize {
        self.path_lengths.len()
    }

    /// Group several batches into one, in order.
    ///
    /// Chunks are kept only when every batch has them. Statistics are dropped
    /// since they describe the individual batches.
    pub fn concat(batches: &[ProcessedBatch]) -> Result<ProcessedBatch> {
        let first = batches
            .first()
            .ok_or_else(|| MbrlError::ConfigError("no batches to concatenate".to_string()))?;
        let keys: Vec<String> = first.agent_infos.keys().cloned().collect();
        for b in batches {
            let other: Vec<String> = b.agent_infos.keys().cloned().collect();
            if other != keys {
                return Err(MbrlError::InconsistentAgentInfo {
                    expected: keys,
                    actual: other,
                });
            }
        }

        let cat2 = |f: &dyn Fn(&ProcessedBatch) -> &Array2<f64>| -> Result<Array2<f64>> {
            let views: Vec<_> = batches.iter().map(|b| f(b).view()).collect();
            concatenate(Axis(0), &views).map_err(|e| MbrlError::NumericalError(e.to_string()))
        };
        let cat1 = |f: &dyn Fn(&ProcessedBatch) -> &Array1<f64>| -> Array1<f64> {
            batches.iter().flat_map(|b| f(b).iter().copied()).collect()
        };

        let mut agent_infos = BTreeMap::new();
        for key in &keys {
            agent_infos.insert(key.clone(), cat2(&|b| &b.agent_infos[key])?);
        }

        let chunks = if batches.iter().all(|b| b.chunks.is_some()) {
            let mut offset = 0;
            let mut all = Vec::new();
            for b in batches {
                if let Some(chunks) = &b.chunks {
                    all.extend(chunks.iter().map(|r| r.start + offset..r.end + offset));
                }
                offset += b.len();
            }
            Some(all)
        } else {
            None
        };

        Ok(ProcessedBatch {
            observations: cat2(&|b| &b.observations)?,
            actions: cat2(&|b| &b.actions)?,
            next_observations: cat2(&|b| &b.next_observations)?,
            rewards: cat1(&|b| &b.rewards),
            dones: batches.iter().flat_map(|b| b.dones.iter().copied()).collect(),
            returns: cat1(&|b| &b.returns),
            advantages: cat1(&|b| &b.advantages),
            baselines: cat1(&|b| &b.baselines),
            agent_infos,
            path_lengths: batches
                .iter()
                .flat_map(|b| b.path_lengths.iter().copied())
                .collect(),
            chunks,
            stats: BTreeMap::new(),
        })
    }
}

/// Undiscounted and discounted return statistics, keyed with `prefix`.
pub fn return_stats(paths: &[Path], discount: f64, prefix: &str) -> BTreeMap<String, f64> {
    let returns: Array1<f64> = paths.iter().map(Path::undiscounted_return).collect();
    let discounted: Array1<f64> = paths
        .iter()
        .map(|p| {
            discount_cumsum(p.rewards().view(), discount)
                .first()
                .copied()
                .unwrap_or(0.0)
        })
        .collect();
    let (mean, std) = mean_std(returns.view());
    let (discounted_mean, _) = mean_std(discounted.view());

    let mut stats = BTreeMap::new();
    let mut put = |name: &str, value: f64| {
        stats.insert(format!("{}{}", prefix, name), value);
    };
    put("AverageReturn", mean);
    put("StdReturn", std);
    put(
        "MaxReturn",
        returns.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    );
    put(
        "MinReturn",
        returns.iter().copied().fold(f64::INFINITY, f64::min),
    );
    put("AverageDiscountedReturn", discounted_mean);
    put("NumTrajs", paths.len() as f64);
    stats
}

/// Computes returns, baselines and GAE advantages for a set of paths.
///
/// The baseline is refit on every call; apart from it the processor keeps no
/// state, so a deterministic baseline gives identical batches for identical
/// input.
pub struct SampleProcessor<B: Baseline> {
    config: ProcessorConfig,
    baseline: B,
}

impl<B: Baseline> SampleProcessor<B> {
    pub fn new(config: ProcessorConfig, baseline: B) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, baseline })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn baseline(&self) -> &B {
        &self.baseline
    }

    /// Check that every transition carries the same agent-info keys and widths.
    fn check_agent_infos(paths: &[Path]) -> Result<Vec<(String, usize)>> {
        let first = match paths.iter().find_map(|p| p.transitions().first()) {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        let layout: Vec<(String, usize)> = first
            .agent_info
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect();
        let expected: Vec<String> = layout.iter().map(|(k, _)| k.clone()).collect();

        for t in paths.iter().flat_map(|p| p.transitions()) {
            if t.agent_info.len() != layout.len()
                || !layout.iter().all(|(k, _)| t.agent_info.contains_key(k))
            {
                return Err(MbrlError::InconsistentAgentInfo {
                    expected,
                    actual: t.agent_info.keys().cloned().collect(),
                });
            }
            for (key, width) in &layout {
                let actual = t.agent_info[key].len();
                if actual != *width {
                    return Err(MbrlError::ShapeMismatch {
                        expected: vec![*width],
                        actual: vec![actual],
                    });
                }
            }
        }
        Ok(layout)
    }

    fn chunk_ranges(&self, path_lengths: &[usize]) -> Option<Vec<Range<usize>>> {
        let k = self.config.backprop_steps?;
        let mut chunks = Vec::new();
        let mut offset = 0;
        for &len in path_lengths {
            let mut start = offset;
            while start < offset + len {
                let end = (start + k).min(offset + len);
                chunks.push(start..end);
                start = end;
            }
            offset += len;
        }
        Some(chunks)
    }

    /// GAE over one path with `V(s_T) = 0` appended.
    fn path_advantages(&self, rewards: ArrayView1<f64>, values: ArrayView1<f64>) -> Array1<f64> {
        let gamma = self.config.discount;
        let mut extended = Array1::zeros(values.len() + 1);
        extended.slice_mut(s![..values.len()]).assign(&values);
        let deltas = &rewards + &(extended.slice(s![1..]).mapv(|v| gamma * v)) - values;
        discount_cumsum(deltas.view(), gamma * self.config.gae_lambda)
    }

    /// Process `paths` into a batch; statistics are keyed with `prefix`.
    pub fn process(&mut self, paths: &[Path], prefix: &str) -> Result<ProcessedBatch> {
        let paths: Vec<Path> = paths.iter().filter(|p| !p.is_empty()).cloned().collect();
        if paths.is_empty() {
            return Err(MbrlError::ConfigError(
                "cannot process an empty set of paths".to_string(),
            ));
        }
        let layout = Self::check_agent_infos(&paths)?;
        let obs_dim = paths[0].obs_dim();
        let act_dim = paths[0].action_dim();

        let path_returns: Vec<Array1<f64>> = paths
            .iter()
            .map(|p| discount_cumsum(p.rewards().view(), self.config.discount))
            .collect();
        self.baseline.fit(&paths, &path_returns)?;

        let mut baselines = Vec::with_capacity(paths.len());
        let mut advantages = Vec::with_capacity(paths.len());
        for path in &paths {
            let values = self.baseline.predict(path)?;
            if values.len() != path.len() {
                return Err(MbrlError::ShapeMismatch {
                    expected: vec![path.len()],
                    actual: vec![values.len()],
                });
            }
            advantages.push(self.path_advantages(path.rewards().view(), values.view()));
            baselines.push(values);
        }

        let flat = |parts: &[Array1<f64>]| -> Array1<f64> {
            parts.iter().flat_map(|a| a.iter().copied()).collect()
        };
        let returns = flat(&path_returns);
        let baselines = flat(&baselines);
        let mut advantages = flat(&advantages);

        if self.config.normalize_adv {
            let (mean, std) = mean_std(advantages.view());
            advantages.mapv_inplace(|a| (a - mean) / (std + 1e-8));
        }
        if self.config.positive_adv {
            let min = advantages.iter().copied().fold(f64::INFINITY, f64::min);
            advantages.mapv_inplace(|a| a - min + 1e-8);
        }
        if advantages.iter().any(|a| !a.is_finite()) {
            return Err(MbrlError::NumericalError(
                "non-finite advantage in processed batch".to_string(),
            ));
        }

        let transitions = || paths.iter().flat_map(|p| p.transitions());
        let mut agent_infos = BTreeMap::new();
        for (key, width) in &layout {
            agent_infos.insert(
                key.clone(),
                stack_rows(transitions().map(|t| t.agent_info[key].view()), *width)?,
            );
        }

        let path_lengths: Vec<usize> = paths.iter().map(Path::len).collect();
        let mut stats = return_stats(&paths, self.config.discount, prefix);
        stats.insert(
            format!("{}ExplainedVariance", prefix),
            explained_variance(baselines.view(), returns.view()),
        );

        Ok(ProcessedBatch {
            observations: stack_rows(transitions().map(|t| t.observation.view()), obs_dim)?,
            actions: stack_rows(transitions().map(|t| t.action.view()), act_dim)?,
            next_observations: stack_rows(
                transitions().map(|t| t.next_observation.view()),
                obs_dim,
            )?,
            rewards: transitions().map(|t| t.reward).collect(),
            dones: paths
                .iter()
                .flat_map(|p| {
                    let n = p.len();
                    let terminated = p.is_terminated();
                    (0..n).map(move |i| i + 1 == n && terminated)
                })
                .collect(),
            returns,
            advantages,
            baselines,
            agent_infos,
            chunks: self.chunk_ranges(&path_lengths),
            path_lengths,
            stats,
        })
    }
}
