//! Bootstrapped ensemble of dynamics regressors.

use super::buffer::{BufferRecord, ReplayBuffer, TransitionArrays};
use super::DynamicsConfig;
use crate::checkpoint::Checkpointable;
use crate::nn::{device, from_array2, Mlp, MlpConfig, TrainingBackend};
use crate::optim::{adam, ModuleOptimizer};
use crate::{MbrlError, Result};
use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::ElementConversion;
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which member(s) answer a prediction
#[derive(Clone, Debug, PartialEq)]
pub enum MemberSelector {
    /// One member for every row
    Member(usize),
    /// Average of all members
    Mean,
    /// Member index per row
    PerRow(Vec<usize>),
}

/// Predicted transition outcome, row-aligned with the query
#[derive(Clone, Debug)]
pub struct Prediction {
    pub next_observations: Array2<f64>,
    pub rewards: Array1<f64>,
}

/// Split of one epoch's minibatches between resident and new data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinibatchPlan {
    pub old: usize,
    pub new: usize,
}

/// Outcome of one `fit` call
#[derive(Clone, Debug, Default)]
pub struct FitReport {
    /// Epochs actually run
    pub epochs: usize,
    /// Epochs each member trained before it stopped
    pub member_epochs: Vec<usize>,
    /// Mean training loss per epoch
    pub train_losses: Vec<f64>,
    /// Mean validation loss per epoch (empty without validation data)
    pub valid_losses: Vec<f64>,
    /// Minibatches per epoch drawn from resident data
    pub old_minibatches: usize,
    /// Minibatches per epoch drawn from the new data
    pub new_minibatches: usize,
    pub stopped_early: bool,
    /// Training buffer length after commit
    pub buffer_len: usize,
}

impl FitReport {
    pub fn final_train_loss(&self) -> f64 {
        self.train_losses.last().copied().unwrap_or(f64::NAN)
    }

    pub fn final_valid_loss(&self) -> f64 {
        self.valid_losses.last().copied().unwrap_or(f64::NAN)
    }
}

/// Decide how many minibatches per epoch come from resident and from new data.
///
/// With no resident data every minibatch is new. Otherwise the usable rows are
/// the resident rows (when `persistency > 0`) plus the new rows (when
/// `persistency < 1`), and `round(persistency * total)` of the minibatches are
/// resident. `persistency = 1` therefore never touches the new rows and
/// `persistency = 0` never touches the resident ones.
pub fn plan_minibatches(
    old_len: usize,
    new_len: usize,
    batch_size: usize,
    persistency: f64,
) -> Result<MinibatchPlan> {
    if batch_size == 0 {
        return Err(MbrlError::ConfigError("batch_size must be > 0".to_string()));
    }
    let too_few = |usable: usize| {
        MbrlError::ConfigError(format!(
            "{} trainable transitions is less than one minibatch of {}",
            usable, batch_size
        ))
    };

    if old_len == 0 {
        if new_len < batch_size {
            return Err(too_few(new_len));
        }
        return Ok(MinibatchPlan {
            old: 0,
            new: new_len / batch_size,
        });
    }

    let use_old = persistency > 0.0;
    let use_new = persistency < 1.0 && new_len > 0;
    let usable = if use_old { old_len } else { 0 } + if use_new { new_len } else { 0 };
    if usable < batch_size {
        return Err(too_few(usable));
    }
    let total = usable / batch_size;
    let old = match (use_old, use_new) {
        (true, false) => total,
        (false, _) => 0,
        (true, true) => ((persistency * total as f64).round() as usize).min(total),
    };
    Ok(MinibatchPlan {
        old,
        new: total - old,
    })
}

/// Stops a member once its smoothed validation loss rises.
///
/// The smoothed loss is an exponential moving average,
/// `s = persistency * s + (1 - persistency) * loss`, seeded with the first loss.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EarlyStopping {
    persistency: f64,
    smoothed: Option<f64>,
}

impl EarlyStopping {
    pub fn new(persistency: f64) -> Self {
        Self {
            persistency,
            smoothed: None,
        }
    }

    /// Feed one epoch's validation loss; true when training should stop
    pub fn update(&mut self, loss: f64) -> bool {
        let p = self.persistency;
        let (next, stop) = match self.smoothed {
            None => (loss, false),
            Some(prev) => {
                let next = p * prev + (1.0 - p) * loss;
                (next, next > prev)
            }
        };
        self.smoothed = Some(next);
        stop
    }
}

#[derive(Clone, Debug)]
struct Normalizer {
    input_mean: Array1<f64>,
    input_std: Array1<f64>,
    output_mean: Array1<f64>,
    output_std: Array1<f64>,
}

/// Serializable normalization statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizerRecord {
    pub input_mean: Vec<f64>,
    pub input_std: Vec<f64>,
    pub output_mean: Vec<f64>,
    pub output_std: Vec<f64>,
}

fn column_stats(x: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let mean = x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()));
    let std = x
        .std_axis(Axis(0), 0.0)
        .mapv(|s| if s < 1e-8 { 1.0 } else { s });
    (mean, std)
}

impl Normalizer {
    fn fit(inputs: &Array2<f64>, outputs: &Array2<f64>) -> Self {
        let (input_mean, input_std) = column_stats(inputs);
        let (output_mean, output_std) = column_stats(outputs);
        Self {
            input_mean,
            input_std,
            output_mean,
            output_std,
        }
    }

    fn inputs(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.input_mean) / &self.input_std
    }

    fn outputs(&self, y: &Array2<f64>) -> Array2<f64> {
        (y - &self.output_mean) / &self.output_std
    }

    fn denormalize_outputs(&self, y: &Array2<f64>) -> Array2<f64> {
        y * &self.output_std + &self.output_mean
    }

    fn record(&self) -> NormalizerRecord {
        NormalizerRecord {
            input_mean: self.input_mean.to_vec(),
            input_std: self.input_std.to_vec(),
            output_mean: self.output_mean.to_vec(),
            output_std: self.output_std.to_vec(),
        }
    }

    fn from_record(record: &NormalizerRecord) -> Self {
        Self {
            input_mean: Array1::from(record.input_mean.clone()),
            input_std: Array1::from(record.input_std.clone()),
            output_mean: Array1::from(record.output_mean.clone()),
            output_std: Array1::from(record.output_std.clone()),
        }
    }
}

struct Member {
    net: Mlp<TrainingBackend>,
    optimizer: Box<dyn ModuleOptimizer<Mlp<TrainingBackend>>>,
    rng: ChaCha8Rng,
    /// Standard deviation of raw prediction residuals per output
    residual_std: Array1<f64>,
}

/// Serializable state of one member.
///
/// Optimizer moments are not kept; a restored member continues with fresh Adam state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub params: Vec<f64>,
    pub residual_std: Vec<f64>,
    pub rng_stream: u64,
    /// Word position of the member's random stream, split into high and low halves
    pub rng_word_pos: (u64, u64),
}

/// Serializable ensemble state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    pub obs_dim: usize,
    pub act_dim: usize,
    pub seed: u64,
    pub members: Vec<MemberRecord>,
    pub normalizer: Option<NormalizerRecord>,
    #[serde(default)]
    pub buffer: Option<BufferRecord>,
    #[serde(default)]
    pub valid_buffer: Option<BufferRecord>,
}

/// Ensemble of independently trained transition models.
///
/// Each member regresses normalized `[Δobservation, reward]` on normalized
/// `[observation, action]`. All members start from the same parameters; with
/// `bootstrap` each trains on its own resample and shuffle of the data, without
/// it every member sees identical minibatches in identical order.
///
/// Members are an arena indexed `0..num_models`, created lazily by
/// `initialize_missing` so that members restored from a record are kept.
pub struct DynamicsEnsemble {
    config: DynamicsConfig,
    obs_dim: usize,
    act_dim: usize,
    seed: u64,
    template: Mlp<TrainingBackend>,
    members: Vec<Member>,
    normalizer: Option<Normalizer>,
    buffer: ReplayBuffer,
    valid_buffer: ReplayBuffer,
    rng: ChaCha8Rng,
}

impl DynamicsEnsemble {
    pub fn new(config: DynamicsConfig, obs_dim: usize, act_dim: usize, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let template = MlpConfig::new(obs_dim + act_dim, &config.hidden_sizes, obs_dim + 1)
            .init(&mut rng, &device());
        Ok(Self {
            buffer: ReplayBuffer::new(config.buffer_size, obs_dim, act_dim),
            valid_buffer: ReplayBuffer::new(config.valid_buffer_size(), obs_dim, act_dim),
            config,
            obs_dim,
            act_dim,
            seed,
            template,
            members: Vec::new(),
            normalizer: None,
            rng,
        })
    }

    pub fn config(&self) -> &DynamicsConfig {
        &self.config
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn act_dim(&self) -> usize {
        self.act_dim
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Whether `fit` has run (or fitted state was restored)
    pub fn is_fitted(&self) -> bool {
        self.normalizer.is_some() && !self.members.is_empty()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn valid_buffer_len(&self) -> usize {
        self.valid_buffer.len()
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn member_params(&self, member: usize) -> Option<Array1<f64>> {
        self.members.get(member).map(|m| Array1::from(m.net.flat_params()))
    }

    /// Residual standard deviation of a member's next-observation prediction
    pub fn residual_std(&self, member: usize) -> Option<ArrayView1<'_, f64>> {
        self.members
            .get(member)
            .map(|m| m.residual_std.slice(s![..self.obs_dim]))
    }

    /// Residual standard deviation averaged over members
    pub fn mean_residual_std(&self) -> Array1<f64> {
        let mut acc = Array1::zeros(self.obs_dim);
        for m in &self.members {
            acc += &m.residual_std.slice(s![..self.obs_dim]);
        }
        acc / self.members.len().max(1) as f64
    }

    /// Create members that do not exist yet. Returns how many were created.
    pub fn initialize_missing(&mut self) -> usize {
        let mut created = 0;
        while self.members.len() < self.config.num_models {
            let index = self.members.len();
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            rng.set_stream(index as u64 + 1);
            self.members.push(Member {
                net: self.template.clone(),
                optimizer: adam(None),
                rng,
                residual_std: Array1::zeros(self.obs_dim + 1),
            });
            created += 1;
        }
        created
    }

    /// Start observations for imagined rollouts, drawn from the training buffer
    pub fn sample_observations<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Option<Array2<f64>> {
        self.buffer.sample_observations(n, rng)
    }

    fn model_io(&self, data: &TransitionArrays) -> Result<(Array2<f64>, Array2<f64>)> {
        let inputs = concatenate(Axis(1), &[data.observations.view(), data.actions.view()])
            .map_err(|e| MbrlError::NumericalError(e.to_string()))?;
        let deltas = &data.next_observations - &data.observations;
        let rewards = data.rewards.view().insert_axis(Axis(1));
        let outputs = concatenate(Axis(1), &[deltas.view(), rewards])
            .map_err(|e| MbrlError::NumericalError(e.to_string()))?;
        Ok((inputs, outputs))
    }

    /// Fit every member on the new transitions mixed with the resident buffer.
    ///
    /// The new rows are split into training and validation parts, trained on
    /// for `epochs` epochs according to `plan_minibatches`, then committed to
    /// the buffers (evicting the oldest rows beyond capacity). Validation, and
    /// with it early stopping, only looks at the sources that contribute
    /// minibatches.
    pub fn fit(
        &mut self,
        observations: ArrayView2<f64>,
        actions: ArrayView2<f64>,
        next_observations: ArrayView2<f64>,
        rewards: ArrayView1<f64>,
        epochs: usize,
    ) -> Result<FitReport> {
        if observations.ncols() != self.obs_dim || actions.ncols() != self.act_dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.obs_dim, self.act_dim],
                actual: vec![observations.ncols(), actions.ncols()],
            });
        }
        let new = TransitionArrays::from_views(observations, actions, next_observations, rewards)?;
        self.initialize_missing();

        // split new data
        let n = new.len();
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(&mut self.rng);
        let n_valid = ((n as f64 * self.config.valid_split_ratio).floor() as usize)
            .min(n.saturating_sub(1));
        let (valid_idx, train_idx) = perm.split_at(n_valid);
        let new_train = new.select(train_idx);
        let new_valid = new.select(valid_idx);

        // snapshot resident data
        let old_train = self.buffer.snapshot();
        let old_valid = self.valid_buffer.snapshot();

        let plan = plan_minibatches(
            old_train.len(),
            new_train.len(),
            self.config.batch_size,
            self.config.rolling_average_persistency,
        )?;

        let trained_on = match (plan.old > 0, plan.new > 0) {
            (true, true) => old_train.concat(&new_train)?,
            (true, false) => old_train.clone(),
            _ => new_train.clone(),
        };
        let (fit_in, fit_out) = self.model_io(&trained_on)?;
        let normalizer = Normalizer::fit(&fit_in, &fit_out);

        let normalize = |data: &TransitionArrays| -> Result<(Array2<f64>, Array2<f64>)> {
            let (x, y) = self.model_io(data)?;
            Ok((normalizer.inputs(&x), normalizer.outputs(&y)))
        };
        let (x_old, y_old) = normalize(&old_train)?;
        let (x_new, y_new) = normalize(&new_train)?;
        let valid_all = match (plan.old > 0, plan.new > 0) {
            (true, true) => old_valid.concat(&new_valid)?,
            (true, false) => old_valid,
            _ => new_valid.clone(),
        };
        let (x_valid, y_valid) = normalize(&valid_all)?;

        let bootstrap = self.config.bootstrap;
        let batch_size = self.config.batch_size;
        let learning_rate = self.config.learning_rate;
        let activation = self.config.hidden_activation;
        let device = device();
        let n_old = x_old.nrows();
        let n_new = x_new.nrows();

        // per-member views of the data: resamples with replacement, or identity
        let mut views: Vec<(Vec<usize>, Vec<usize>)> = self
            .members
            .iter_mut()
            .map(|m| {
                if bootstrap {
                    (
                        (0..n_old).map(|_| m.rng.gen_range(0..n_old)).collect(),
                        (0..n_new).map(|_| m.rng.gen_range(0..n_new)).collect(),
                    )
                } else {
                    ((0..n_old).collect(), (0..n_new).collect())
                }
            })
            .collect();

        let mut report = FitReport {
            old_minibatches: plan.old,
            new_minibatches: plan.new,
            member_epochs: vec![0; self.members.len()],
            ..Default::default()
        };
        let mut stopping =
            vec![EarlyStopping::new(self.config.valid_loss_persistency); self.members.len()];
        let mut stopped = vec![false; self.members.len()];

        for epoch in 0..epochs {
            let mut sources: Vec<bool> = std::iter::repeat(true)
                .take(plan.old)
                .chain(std::iter::repeat(false).take(plan.new))
                .collect();

            // shared ordering when members must see identical data
            let shared = if bootstrap {
                None
            } else {
                let (mut old_order, mut new_order) = views[0].clone();
                old_order.shuffle(&mut self.rng);
                new_order.shuffle(&mut self.rng);
                sources.shuffle(&mut self.rng);
                Some((old_order, new_order, sources.clone()))
            };

            let mut loss_sum = 0.0;
            let mut loss_count = 0usize;
            for (m, member) in self.members.iter_mut().enumerate() {
                if stopped[m] {
                    continue;
                }
                let (old_order, new_order, order) = match &shared {
                    Some((o, nw, src)) => (o.clone(), nw.clone(), src.clone()),
                    None => {
                        let (o, nw) = &mut views[m];
                        o.shuffle(&mut member.rng);
                        nw.shuffle(&mut member.rng);
                        let mut src = sources.clone();
                        src.shuffle(&mut member.rng);
                        (o.clone(), nw.clone(), src)
                    }
                };

                let (mut old_cursor, mut new_cursor) = (0usize, 0usize);
                for from_old in order {
                    let (indices, cursor, x, y) = if from_old {
                        (&old_order, &mut old_cursor, &x_old, &y_old)
                    } else {
                        (&new_order, &mut new_cursor, &x_new, &y_new)
                    };
                    let rows: Vec<usize> = (0..batch_size)
                        .map(|k| indices[(*cursor + k) % indices.len()])
                        .collect();
                    *cursor += batch_size;

                    let xb = from_array2(x.select(Axis(0), &rows).view(), &device);
                    let yb = from_array2(y.select(Axis(0), &rows).view(), &device);
                    let loss = (member.net.forward(xb, activation) - yb)
                        .powf_scalar(2.0)
                        .mean();
                    let value: f64 = loss.clone().into_scalar().elem();
                    if !value.is_finite() {
                        return Err(MbrlError::NumericalError(format!(
                            "dynamics member {} loss is {} at epoch {}",
                            m, value, epoch
                        )));
                    }
                    let grads = GradientsParams::from_grads(loss.backward(), &member.net);
                    member.net = member
                        .optimizer
                        .step(learning_rate, member.net.clone(), grads);

                    loss_sum += value;
                    loss_count += 1;
                }
                report.member_epochs[m] = epoch + 1;
            }
            report.train_losses.push(loss_sum / loss_count.max(1) as f64);
            report.epochs = epoch + 1;

            if x_valid.nrows() > 0 {
                let mut valid_sum = 0.0;
                for (m, member) in self.members.iter().enumerate() {
                    let pred = member.net.valid().predict(x_valid.view(), activation)?;
                    let loss = (pred - &y_valid).mapv(|d| d * d).mean().unwrap_or(0.0);
                    valid_sum += loss;

                    if self.config.early_stopping && !stopped[m] && stopping[m].update(loss) {
                        tracing::debug!(member = m, epoch, "Dynamics member stopped early");
                        stopped[m] = true;
                    }
                }
                report
                    .valid_losses
                    .push(valid_sum / self.members.len().max(1) as f64);
            }

            if stopped.iter().all(|s| *s) {
                report.stopped_early = true;
                break;
            }
        }

        // residual spread in raw units, on held-out data when available
        let (x_eval, y_eval) = if x_valid.nrows() > 0 {
            (x_valid, y_valid)
        } else {
            let (x, y) = self.model_io(&trained_on)?;
            (normalizer.inputs(&x), normalizer.outputs(&y))
        };
        let y_raw = normalizer.denormalize_outputs(&y_eval);
        for member in &mut self.members {
            let pred = member.net.valid().predict(x_eval.view(), activation)?;
            let pred = normalizer.denormalize_outputs(&pred);
            member.residual_std = (pred - &y_raw).std_axis(Axis(0), 0.0);
        }

        self.normalizer = Some(normalizer);
        self.buffer.extend(&new_train)?;
        self.valid_buffer.extend(&new_valid)?;
        report.buffer_len = self.buffer.len();

        tracing::info!(
            epochs = report.epochs,
            old_minibatches = plan.old,
            new_minibatches = plan.new,
            train_loss = report.final_train_loss(),
            valid_loss = report.final_valid_loss(),
            buffer_len = report.buffer_len,
            "Fitted dynamics ensemble"
        );
        Ok(report)
    }

    fn normalized_inputs(
        &self,
        observations: &ArrayView2<f64>,
        actions: &ArrayView2<f64>,
    ) -> Result<(&Normalizer, Array2<f64>)> {
        let normalizer = match &self.normalizer {
            Some(n) if !self.members.is_empty() => n,
            _ => {
                return Err(MbrlError::ConfigError(
                    "dynamics ensemble queried before it was fit".to_string(),
                ))
            }
        };
        if observations.ncols() != self.obs_dim
            || actions.ncols() != self.act_dim
            || observations.nrows() != actions.nrows()
        {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![observations.nrows(), self.obs_dim, self.act_dim],
                actual: vec![actions.nrows(), observations.ncols(), actions.ncols()],
            });
        }
        let x = concatenate(Axis(1), &[observations.view(), actions.view()])
            .map_err(|e| MbrlError::NumericalError(e.to_string()))?;
        Ok((normalizer, normalizer.inputs(&x)))
    }

    fn member_outputs(&self, normalizer: &Normalizer, member: usize, x: &Array2<f64>) -> Result<Array2<f64>> {
        let m = self.members.get(member).ok_or_else(|| {
            MbrlError::ConfigError(format!(
                "member {} out of range for ensemble of {}",
                member,
                self.members.len()
            ))
        })?;
        let out = m.net.valid().predict(x.view(), self.config.hidden_activation)?;
        Ok(normalizer.denormalize_outputs(&out))
    }

    /// Predict next observations and rewards.
    pub fn predict(
        &self,
        observations: ArrayView2<f64>,
        actions: ArrayView2<f64>,
        selector: &MemberSelector,
    ) -> Result<Prediction> {
        let (normalizer, x) = self.normalized_inputs(&observations, &actions)?;
        let outputs = match selector {
            MemberSelector::Member(i) => self.member_outputs(normalizer, *i, &x)?,
            MemberSelector::Mean => {
                let mut acc = Array2::zeros((x.nrows(), self.obs_dim + 1));
                for i in 0..self.members.len() {
                    acc += &self.member_outputs(normalizer, i, &x)?;
                }
                acc / self.members.len() as f64
            }
            MemberSelector::PerRow(assignment) => {
                if assignment.len() != x.nrows() {
                    return Err(MbrlError::ShapeMismatch {
                        expected: vec![x.nrows()],
                        actual: vec![assignment.len()],
                    });
                }
                let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for (row, &member) in assignment.iter().enumerate() {
                    groups.entry(member).or_default().push(row);
                }
                let mut out = Array2::zeros((x.nrows(), self.obs_dim + 1));
                for (member, rows) in groups {
                    let part = self.member_outputs(normalizer, member, &x.select(Axis(0), &rows))?;
                    for (k, &row) in rows.iter().enumerate() {
                        out.row_mut(row).assign(&part.row(k));
                    }
                }
                out
            }
        };

        let next_observations = &observations + &outputs.slice(s![.., ..self.obs_dim]);
        let rewards = outputs.column(self.obs_dim).to_owned();
        Ok(Prediction {
            next_observations,
            rewards,
        })
    }

    /// Variance of next-observation predictions across members, averaged over dimensions.
    pub fn disagreement(
        &self,
        observations: ArrayView2<f64>,
        actions: ArrayView2<f64>,
    ) -> Result<Array1<f64>> {
        let (normalizer, x) = self.normalized_inputs(&observations, &actions)?;
        let n = x.nrows();
        let k = self.members.len() as f64;
        let mut sum = Array2::<f64>::zeros((n, self.obs_dim));
        let mut sum_sq = Array2::<f64>::zeros((n, self.obs_dim));
        for i in 0..self.members.len() {
            let out = self.member_outputs(normalizer, i, &x)?;
            let delta = out.slice(s![.., ..self.obs_dim]);
            sum += &delta;
            sum_sq += &delta.mapv(|v| v * v);
        }
        let mean = &sum / k;
        let var = (sum_sq / k - mean.mapv(|v| v * v)).mapv(|v| v.max(0.0));
        Ok(var
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(n)))
    }

    /// Record including the replay buffers
    pub fn record_with_buffer(&self) -> EnsembleRecord {
        let mut record = self.record();
        record.buffer = Some(self.buffer.record());
        record.valid_buffer = Some(self.valid_buffer.record());
        record
    }
}

impl Checkpointable for DynamicsEnsemble {
    type Record = EnsembleRecord;

    fn record(&self) -> EnsembleRecord {
        EnsembleRecord {
            obs_dim: self.obs_dim,
            act_dim: self.act_dim,
            seed: self.seed,
            members: self
                .members
                .iter()
                .map(|m| {
                    let pos = m.rng.get_word_pos();
                    MemberRecord {
                        params: m.net.flat_params(),
                        residual_std: m.residual_std.to_vec(),
                        rng_stream: m.rng.get_stream(),
                        rng_word_pos: ((pos >> 64) as u64, pos as u64),
                    }
                })
                .collect(),
            normalizer: self.normalizer.as_ref().map(Normalizer::record),
            buffer: None,
            valid_buffer: None,
        }
    }

    fn load_record(&mut self, record: &EnsembleRecord) -> Result<()> {
        if record.obs_dim != self.obs_dim || record.act_dim != self.act_dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.obs_dim, self.act_dim],
                actual: vec![record.obs_dim, record.act_dim],
            });
        }
        if record.members.len() > self.config.num_models {
            return Err(MbrlError::ConfigError(format!(
                "record has {} members, ensemble allows {}",
                record.members.len(),
                self.config.num_models
            )));
        }

        let mut members = Vec::with_capacity(record.members.len());
        for r in &record.members {
            let net = self.template.clone().load_flat(&r.params)?;
            let mut rng = ChaCha8Rng::seed_from_u64(record.seed);
            rng.set_stream(r.rng_stream);
            rng.set_word_pos(((r.rng_word_pos.0 as u128) << 64) | r.rng_word_pos.1 as u128);
            if r.residual_std.len() != self.obs_dim + 1 {
                return Err(MbrlError::ShapeMismatch {
                    expected: vec![self.obs_dim + 1],
                    actual: vec![r.residual_std.len()],
                });
            }
            members.push(Member {
                net,
                optimizer: adam(None),
                rng,
                residual_std: Array1::from(r.residual_std.clone()),
            });
        }

        if let Some(buffer) = &record.buffer {
            self.buffer.load_record(buffer)?;
        }
        if let Some(buffer) = &record.valid_buffer {
            self.valid_buffer.load_record(buffer)?;
        }
        self.members = members;
        self.normalizer = record.normalizer.as_ref().map(Normalizer::from_record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> DynamicsConfig {
        DynamicsConfig {
            num_models: 3,
            hidden_sizes: vec![16],
            batch_size: 8,
            buffer_size: 200,
            max_epochs: 5,
            ..Default::default()
        }
    }

    /// Linear system x' = x + 0.1 a, reward = -x^2
    fn data(n: usize, offset: f64) -> TransitionArrays {
        let obs = Array2::from_shape_fn((n, 2), |(i, j)| ((i + j) as f64 * 0.37 + offset).sin());
        let act = Array2::from_shape_fn((n, 1), |(i, _)| ((i as f64) * 0.91).cos());
        let next = Array2::from_shape_fn((n, 2), |(i, j)| obs[[i, j]] + 0.1 * act[[i, 0]]);
        let rew = Array1::from_shape_fn(n, |i| -obs[[i, 0]].powi(2));
        TransitionArrays {
            observations: obs,
            actions: act,
            next_observations: next,
            rewards: rew,
        }
    }

    fn fit(ens: &mut DynamicsEnsemble, d: &TransitionArrays, epochs: usize) -> Result<FitReport> {
        ens.fit(
            d.observations.view(),
            d.actions.view(),
            d.next_observations.view(),
            d.rewards.view(),
            epochs,
        )
    }

    #[test]
    fn test_plan_minibatches() {
        assert_eq!(
            plan_minibatches(0, 64, 16, 0.4).unwrap(),
            MinibatchPlan { old: 0, new: 4 }
        );
        assert_eq!(
            plan_minibatches(100, 60, 16, 1.0).unwrap(),
            MinibatchPlan { old: 6, new: 0 }
        );
        assert_eq!(
            plan_minibatches(100, 60, 16, 0.0).unwrap(),
            MinibatchPlan { old: 0, new: 3 }
        );
        assert_eq!(
            plan_minibatches(100, 60, 16, 0.4).unwrap(),
            MinibatchPlan { old: 4, new: 6 }
        );
        assert!(matches!(
            plan_minibatches(0, 10, 16, 0.4),
            Err(MbrlError::ConfigError(_))
        ));
        assert!(plan_minibatches(100, 5, 16, 0.0).is_err());
    }

    #[test]
    fn test_predict_before_fit_is_error() {
        let ens = DynamicsEnsemble::new(small_config(), 2, 1, 0).unwrap();
        let obs = Array2::zeros((1, 2));
        let act = Array2::zeros((1, 1));
        assert!(matches!(
            ens.predict(obs.view(), act.view(), &MemberSelector::Mean),
            Err(MbrlError::ConfigError(_))
        ));
    }

    #[test]
    fn test_fit_reduces_loss_and_predicts() {
        let config = DynamicsConfig {
            max_epochs: 60,
            ..small_config()
        };
        let mut ens = DynamicsEnsemble::new(config, 2, 1, 3).unwrap();
        let d = data(120, 0.0);
        let report = fit(&mut ens, &d, 60).unwrap();
        assert_eq!(report.epochs, 60);
        assert!(report.final_train_loss() < report.train_losses[0]);
        assert_eq!(report.valid_losses.len(), 60);

        let pred = ens
            .predict(
                d.observations.view(),
                d.actions.view(),
                &MemberSelector::PerRow((0..120).map(|i| i % 3).collect()),
            )
            .unwrap();
        assert_eq!(pred.next_observations.dim(), (120, 2));
        assert_eq!(pred.rewards.len(), 120);
        let dis = ens.disagreement(d.observations.view(), d.actions.view()).unwrap();
        assert!(dis.iter().all(|v| *v >= 0.0));
        assert!(ens.residual_std(0).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_too_few_transitions_is_config_error() {
        let mut ens = DynamicsEnsemble::new(small_config(), 2, 1, 0).unwrap();
        let err = fit(&mut ens, &data(5, 0.0), 1).unwrap_err();
        assert!(matches!(err, MbrlError::ConfigError(_)));
        assert_eq!(ens.buffer_len(), 0);
    }

    #[test]
    fn test_initialize_missing_keeps_restored_members() {
        let mut ens = DynamicsEnsemble::new(small_config(), 2, 1, 0).unwrap();
        assert_eq!(ens.initialize_missing(), 3);
        fit(&mut ens, &data(40, 0.0), 2).unwrap();

        let mut record = ens.record();
        record.members.truncate(2);
        let mut restored = DynamicsEnsemble::new(small_config(), 2, 1, 0).unwrap();
        restored.load_record(&record).unwrap();
        assert_eq!(restored.num_members(), 2);
        assert_eq!(restored.initialize_missing(), 1);
        assert_eq!(restored.member_params(0), ens.member_params(0));
        assert_ne!(restored.member_params(2), ens.member_params(2));
        assert_eq!(restored.initialize_missing(), 0);
    }

    #[test]
    fn test_buffer_stays_bounded_over_fits() {
        let config = DynamicsConfig {
            buffer_size: 50,
            ..small_config()
        };
        let mut ens = DynamicsEnsemble::new(config, 2, 1, 1).unwrap();
        for k in 0..4 {
            let report = fit(&mut ens, &data(40, k as f64), 1).unwrap();
            assert!(report.buffer_len <= 50);
        }
        assert_eq!(ens.buffer_len(), 50);
        assert!(ens.valid_buffer_len() <= ens.config().valid_buffer_size());
    }

    #[test]
    fn test_full_persistency_ignores_new_data() {
        let config = DynamicsConfig {
            rolling_average_persistency: 1.0,
            ..small_config()
        };
        let mut a = DynamicsEnsemble::new(config.clone(), 2, 1, 5).unwrap();
        let mut b = DynamicsEnsemble::new(config, 2, 1, 5).unwrap();
        fit(&mut a, &data(40, 0.0), 2).unwrap();
        fit(&mut b, &data(40, 0.0), 2).unwrap();

        let ra = fit(&mut a, &data(40, 1.0), 2).unwrap();
        let rb = fit(&mut b, &data(40, 2.5), 2).unwrap();
        assert_eq!(ra.new_minibatches, 0);
        assert_eq!(rb.new_minibatches, 0);
        for m in 0..3 {
            assert_eq!(a.member_params(m), b.member_params(m));
        }
    }

    #[test]
    fn test_zero_persistency_uses_only_new_data() {
        let config = DynamicsConfig {
            rolling_average_persistency: 0.0,
            ..small_config()
        };
        let mut ens = DynamicsEnsemble::new(config, 2, 1, 5).unwrap();
        fit(&mut ens, &data(40, 0.0), 1).unwrap();
        let report = fit(&mut ens, &data(40, 1.0), 1).unwrap();
        assert_eq!(report.old_minibatches, 0);
        assert_eq!(report.new_minibatches, 4);
    }

    #[test]
    fn test_early_stopping_tracks_smoothed_loss() {
        let mut stop = EarlyStopping::new(0.5);
        assert!(!stop.update(1.0));
        // 0.5 * 1.0 + 0.5 * 0.5 = 0.75
        assert!(!stop.update(0.5));
        // 0.5 * 0.75 + 0.5 * 2.0 = 1.375
        assert!(stop.update(2.0));

        let mut patient = EarlyStopping::new(1.0);
        assert!(!patient.update(1.0));
        assert!(!patient.update(100.0));
    }

    #[test]
    fn test_early_stopping_halts_members() {
        let config = DynamicsConfig {
            early_stopping: true,
            valid_loss_persistency: 0.0,
            learning_rate: 0.5,
            max_epochs: 60,
            ..small_config()
        };
        let mut ens = DynamicsEnsemble::new(config, 2, 1, 4).unwrap();
        let report = fit(&mut ens, &data(120, 0.0), 60).unwrap();
        assert_eq!(report.member_epochs.len(), 3);
        assert!(report.member_epochs.iter().all(|e| *e >= 1 && *e <= report.epochs));
        assert!(report.member_epochs.iter().any(|e| *e < 60));
        if report.stopped_early {
            assert!(report.epochs < 60);
            assert!(report.member_epochs.iter().all(|e| *e < 60));
        }
    }

    #[test]
    fn test_member_epochs_without_early_stopping() {
        let mut ens = DynamicsEnsemble::new(small_config(), 2, 1, 4).unwrap();
        let report = fit(&mut ens, &data(40, 0.0), 3).unwrap();
        assert_eq!(report.member_epochs, vec![3, 3, 3]);
        assert!(!report.stopped_early);
    }

    #[test]
    fn test_full_persistency_with_early_stopping_ignores_new_data() {
        let config = DynamicsConfig {
            rolling_average_persistency: 1.0,
            early_stopping: true,
            valid_loss_persistency: 0.0,
            learning_rate: 0.5,
            max_epochs: 60,
            ..small_config()
        };
        let mut a = DynamicsEnsemble::new(config.clone(), 2, 1, 5).unwrap();
        let mut b = DynamicsEnsemble::new(config, 2, 1, 5).unwrap();
        fit(&mut a, &data(40, 0.0), 60).unwrap();
        fit(&mut b, &data(40, 0.0), 60).unwrap();

        let ra = fit(&mut a, &data(40, 1.0), 60).unwrap();
        let rb = fit(&mut b, &data(40, 40.0), 60).unwrap();
        assert_eq!(ra.new_minibatches, 0);
        assert_eq!(ra.member_epochs, rb.member_epochs);
        assert_eq!(ra.valid_losses, rb.valid_losses);
        for m in 0..3 {
            assert_eq!(a.member_params(m), b.member_params(m));
        }
    }

    #[test]
    fn test_members_identical_without_bootstrap() {
        let config = DynamicsConfig {
            bootstrap: false,
            ..small_config()
        };
        let mut ens = DynamicsEnsemble::new(config, 2, 1, 9).unwrap();
        fit(&mut ens, &data(60, 0.0), 3).unwrap();
        fit(&mut ens, &data(60, 0.5), 3).unwrap();
        let first = ens.member_params(0);
        assert_eq!(ens.member_params(1), first);
        assert_eq!(ens.member_params(2), first);
    }

    #[test]
    fn test_record_with_buffer_restores_buffer() {
        let mut ens = DynamicsEnsemble::new(small_config(), 2, 1, 0).unwrap();
        fit(&mut ens, &data(40, 0.0), 1).unwrap();
        let mut restored = DynamicsEnsemble::new(small_config(), 2, 1, 0).unwrap();
        restored.load_record(&ens.record_with_buffer()).unwrap();
        assert_eq!(restored.buffer_len(), ens.buffer_len());
        assert!(restored.is_fitted());
    }
}
