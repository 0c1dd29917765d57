//! Noise schedulers
//!
//! A [`SchedulerConfig`] describes the training noise schedule in the
//! `scheduler_config.json` format of diffusers model directories. Any
//! registered [`SamplerKind`] can be instantiated from it, which is how the
//! installed scheduler is swapped per request without touching the weights.
//!
//! The sigma-space samplers (Euler, Euler ancestral, Heun, LMS, DPM2 and
//! DPM2 ancestral) share [`SigmaScheduler`]; DDIM works in alpha space.
//! Second-order samplers evaluate the model twice per step, so
//! [`Scheduler::timesteps`] lists every model evaluation point rather than
//! every step.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::FRAC_PI_2;
use std::fmt;
use tracing::warn;

use crate::error::{Error, Result};
use crate::pipeline::sampling::NoiseSource;

/// Shape of the beta schedule over training timesteps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear in beta
    Linear,
    /// Linear in sqrt(beta)
    ScaledLinear,
    /// Cosine schedule
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// What the denoising network predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The added noise
    Epsilon,
    /// Velocity (`v`)
    VPrediction,
}

/// How inference timesteps are spread over the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    /// Evenly spaced from the last training timestep down to 0
    Linspace,
    /// Multiples of `train / steps`, plus `steps_offset`
    Leading,
    /// Evenly spaced, counted down from the last training timestep
    Trailing,
}

/// Training noise schedule, as stored in `scheduler/scheduler_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler class the model was saved with
    #[serde(rename = "_class_name", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Number of diffusion steps used in training
    pub num_train_timesteps: usize,
    /// First beta
    pub beta_start: f64,
    /// Last beta
    pub beta_end: f64,
    /// Beta schedule shape
    pub beta_schedule: BetaSchedule,
    /// Network parameterization
    pub prediction_type: PredictionType,
    /// Offset added to `leading` timesteps
    pub steps_offset: usize,
    /// DDIM: use alpha 1 for the final step instead of the first training alpha
    pub set_alpha_to_one: bool,
    /// Timestep spacing; each sampler has its own default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestep_spacing: Option<TimestepSpacing>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            class_name: None,
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            steps_offset: 1,
            set_alpha_to_one: false,
            timestep_spacing: None,
        }
    }
}

impl SchedulerConfig {
    /// Validate the schedule parameters
    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps < 2 {
            return Err(Error::config("num_train_timesteps must be at least 2"));
        }
        if !(self.beta_start > 0.0 && self.beta_start < self.beta_end && self.beta_end < 1.0) {
            return Err(Error::config(format!(
                "invalid beta range [{}, {}]",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }

    /// Cumulative products of `1 - beta` over training timesteps
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let betas: Vec<f64> = match self.beta_schedule {
            BetaSchedule::Linear => linspace(self.beta_start, self.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(self.beta_start.sqrt(), self.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => {
                let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * FRAC_PI_2).cos().powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        };

        betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect()
    }

    fn spaced_timesteps(&self, steps: usize, default: TimestepSpacing) -> Vec<f64> {
        let train = self.num_train_timesteps;
        match self.timestep_spacing.unwrap_or(default) {
            TimestepSpacing::Linspace => {
                let mut ts = linspace(0.0, (train - 1) as f64, steps);
                ts.reverse();
                ts
            }
            TimestepSpacing::Leading => {
                let ratio = (train / steps).max(1);
                (0..steps)
                    .rev()
                    .map(|i| ((i * ratio + self.steps_offset).min(train - 1)) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => {
                let ratio = train as f64 / steps as f64;
                (0..steps)
                    .map(|i| (train as f64 - i as f64 * ratio).round() - 1.0)
                    .map(|t| t.max(0.0))
                    .collect()
            }
        }
    }
}

/// Registered sampling algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SamplerKind {
    /// Euler ancestral
    #[default]
    #[serde(rename = "euler_a")]
    EulerAncestral,
    /// Euler
    #[serde(rename = "eular", alias = "euler")]
    Euler,
    /// Heun (second order)
    #[serde(rename = "heun")]
    Heun,
    /// Linear multistep
    #[serde(rename = "lms")]
    Lms,
    /// DPM2 (second order)
    #[serde(rename = "dpm2")]
    Dpm2,
    /// DPM2 ancestral
    #[serde(rename = "dpm2_a")]
    Dpm2Ancestral,
    /// DDIM
    #[serde(rename = "ddim")]
    Ddim,
}

const REGISTRY: &[(&str, SamplerKind)] = &[
    ("euler_a", SamplerKind::EulerAncestral),
    ("eular", SamplerKind::Euler),
    ("euler", SamplerKind::Euler),
    ("heun", SamplerKind::Heun),
    ("lms", SamplerKind::Lms),
    ("dpm2", SamplerKind::Dpm2),
    ("dpm2_a", SamplerKind::Dpm2Ancestral),
    ("ddim", SamplerKind::Ddim),
];

impl SamplerKind {
    /// Look a sampler up by its request name
    pub fn from_name(name: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, kind)| *kind)
    }

    /// Every accepted request name
    pub fn names() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(key, _)| *key)
    }

    /// Request name of this sampler
    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::EulerAncestral => "euler_a",
            SamplerKind::Euler => "eular",
            SamplerKind::Heun => "heun",
            SamplerKind::Lms => "lms",
            SamplerKind::Dpm2 => "dpm2",
            SamplerKind::Dpm2Ancestral => "dpm2_a",
            SamplerKind::Ddim => "ddim",
        }
    }

    /// Model evaluations per step
    pub fn order(&self) -> usize {
        match self {
            SamplerKind::Heun | SamplerKind::Dpm2 | SamplerKind::Dpm2Ancestral => 2,
            _ => 1,
        }
    }

    /// Whether steps inject fresh noise
    pub fn is_ancestral(&self) -> bool {
        matches!(self, SamplerKind::EulerAncestral | SamplerKind::Dpm2Ancestral)
    }

    /// Instantiate this sampler from a schedule configuration
    pub fn build(self, config: &SchedulerConfig) -> Box<dyn Scheduler> {
        match self {
            SamplerKind::Ddim => Box::new(DdimScheduler::new(config.clone())),
            kind => Box::new(SigmaScheduler::new(kind, config.clone())),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An iterative denoising rule
pub trait Scheduler: Send {
    /// Algorithm implemented by this scheduler
    fn kind(&self) -> SamplerKind;

    /// Schedule configuration the scheduler was built from
    fn config(&self) -> &SchedulerConfig;

    /// Prepare for `steps` inference steps and rewind to the first one
    fn set_timesteps(&mut self, steps: usize) -> Result<()>;

    /// Training timestep of every model evaluation, in order
    fn timesteps(&self) -> &[f64];

    /// Index of the next model evaluation
    fn step_index(&self) -> usize;

    /// Skip ahead to inference step `step`; used by image-to-image
    fn set_begin_step(&mut self, step: usize) -> Result<()>;

    /// Standard deviation of the initial latent noise
    fn init_noise_sigma(&self) -> f64;

    /// Scale the model input for the current evaluation
    fn scale_model_input(&self, sample: &Tensor) -> Result<Tensor>;

    /// Advance one model evaluation, returning the next sample
    fn step(&mut self, model_output: &Tensor, sample: &Tensor, noise: &mut NoiseSource)
        -> Result<Tensor>;

    /// Noise `original` to the level of inference step `step`
    fn add_noise(&self, original: &Tensor, noise: &Tensor, step: usize) -> Result<Tensor>;

    /// Whether every evaluation has been consumed
    fn is_finished(&self) -> bool {
        self.step_index() >= self.timesteps().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// A complete first-order step
    Single,
    /// First evaluation of a second-order step
    Predictor,
    /// Second evaluation of a second-order step
    Corrector,
}

#[derive(Debug, Clone, Copy)]
struct EvalPoint {
    timestep: f64,
    sigma: f64,
    step: usize,
    stage: Stage,
}

#[derive(Debug)]
struct Pending {
    sample: Tensor,
    derivative: Tensor,
    dt: f64,
    sigma_up: f64,
}

/// Karras-style samplers working on `sigma = sqrt((1 - ᾱ) / ᾱ)`
#[derive(Debug)]
pub struct SigmaScheduler {
    kind: SamplerKind,
    config: SchedulerConfig,
    log_train_sigmas: Vec<f64>,
    sigmas: Vec<f64>,
    points: Vec<EvalPoint>,
    timesteps: Vec<f64>,
    step_index: usize,
    pending: Option<Pending>,
    derivatives: VecDeque<Tensor>,
}

const LMS_ORDER: usize = 4;

impl SigmaScheduler {
    /// Create an unprepared scheduler; call [`Scheduler::set_timesteps`] first
    pub fn new(kind: SamplerKind, config: SchedulerConfig) -> Self {
        let log_train_sigmas = config
            .alphas_cumprod()
            .iter()
            .map(|ac| ((1.0 - ac) / ac).sqrt().ln())
            .collect();

        Self {
            kind,
            config,
            log_train_sigmas,
            sigmas: Vec::new(),
            points: Vec::new(),
            timesteps: Vec::new(),
            step_index: 0,
            pending: None,
            derivatives: VecDeque::new(),
        }
    }

    /// Noise level at every step boundary, ending with 0
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn sigma_at(&self, timestep: f64) -> f64 {
        let last = self.log_train_sigmas.len() - 1;
        let t = timestep.clamp(0.0, last as f64);
        let lo = t.floor() as usize;
        let hi = (lo + 1).min(last);
        let w = t - lo as f64;
        ((1.0 - w) * self.log_train_sigmas[lo] + w * self.log_train_sigmas[hi]).exp()
    }

    fn timestep_at(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.ln();
        let ls = &self.log_train_sigmas;
        let hi = ls
            .partition_point(|&l| l <= log_sigma)
            .clamp(1, ls.len() - 1);
        let lo = hi - 1;
        let w = ((ls[lo] - log_sigma) / (ls[lo] - ls[hi])).clamp(0.0, 1.0);
        (1.0 - w) * lo as f64 + w * hi as f64
    }

    fn eval_points(&self, timesteps: &[f64]) -> Vec<EvalPoint> {
        let sigmas = &self.sigmas;
        let mut points = Vec::with_capacity(timesteps.len() * self.kind.order());

        for (step, &timestep) in timesteps.iter().enumerate() {
            let (sigma, next) = (sigmas[step], sigmas[step + 1]);
            let single = EvalPoint {
                timestep,
                sigma,
                step,
                stage: Stage::Single,
            };

            let corrector_sigma = match self.kind {
                SamplerKind::Heun if next > 0.0 => Some(next),
                SamplerKind::Dpm2 if next > 0.0 => Some(((sigma.ln() + next.ln()) / 2.0).exp()),
                SamplerKind::Dpm2Ancestral => {
                    let (_, down) = ancestral_sigmas(sigma, next);
                    (down > 0.0).then(|| ((sigma.ln() + down.ln()) / 2.0).exp())
                }
                _ => None,
            };

            match corrector_sigma {
                Some(corrector) => {
                    let corrector_t = match self.kind {
                        SamplerKind::Heun => timesteps.get(step + 1).copied().unwrap_or(0.0),
                        _ => self.timestep_at(corrector),
                    };
                    points.push(EvalPoint {
                        stage: Stage::Predictor,
                        ..single
                    });
                    points.push(EvalPoint {
                        timestep: corrector_t,
                        sigma: corrector,
                        step,
                        stage: Stage::Corrector,
                    });
                }
                None => points.push(single),
            }
        }

        points
    }

    fn current(&self) -> Result<EvalPoint> {
        self.points.get(self.step_index).copied().ok_or_else(|| {
            Error::generation(format!(
                "{} scheduler has no evaluation {} (prepared {})",
                self.kind,
                self.step_index,
                self.points.len()
            ))
        })
    }

    fn denoised(&self, model_output: &Tensor, sample: &Tensor, sigma: f64) -> Result<Tensor> {
        Ok(match self.config.prediction_type {
            PredictionType::Epsilon => sample.sub(&model_output.affine(sigma, 0.0)?)?,
            PredictionType::VPrediction => {
                let denom = sigma * sigma + 1.0;
                let from_output = model_output.affine(-sigma / denom.sqrt(), 0.0)?;
                from_output.add(&sample.affine(1.0 / denom, 0.0)?)?
            }
        })
    }

    fn lms_step(&mut self, derivative: Tensor, sample: &Tensor, step: usize) -> Result<Tensor> {
        self.derivatives.push_front(derivative);
        let order = (step + 1).min(LMS_ORDER);
        self.derivatives.truncate(order);

        let mut next = sample.clone();
        for (j, d) in self.derivatives.iter().enumerate() {
            let coeff = lms_coefficient(&self.sigmas, self.derivatives.len(), step, j);
            next = next.add(&d.affine(coeff, 0.0)?)?;
        }
        Ok(next)
    }
}

impl Scheduler for SigmaScheduler {
    fn kind(&self) -> SamplerKind {
        self.kind
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn set_timesteps(&mut self, steps: usize) -> Result<()> {
        if steps == 0 {
            return Err(Error::invalid_input("at least one inference step is required"));
        }

        let timesteps = self
            .config
            .spaced_timesteps(steps, TimestepSpacing::Linspace);
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| self.sigma_at(t)).collect();
        sigmas.push(0.0);
        self.sigmas = sigmas;

        self.points = self.eval_points(&timesteps);
        self.timesteps = self.points.iter().map(|p| p.timestep).collect();
        self.step_index = 0;
        self.pending = None;
        self.derivatives.clear();
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step_index(&self) -> usize {
        self.step_index
    }

    fn set_begin_step(&mut self, step: usize) -> Result<()> {
        self.step_index = self
            .points
            .iter()
            .position(|p| p.step == step)
            .ok_or_else(|| Error::invalid_input(format!("no inference step {}", step)))?;
        self.pending = None;
        self.derivatives.clear();
        Ok(())
    }

    fn init_noise_sigma(&self) -> f64 {
        let max = self.sigmas.first().copied().unwrap_or(1.0);
        (max * max + 1.0).sqrt()
    }

    fn scale_model_input(&self, sample: &Tensor) -> Result<Tensor> {
        let sigma = self.current()?.sigma;
        Ok(sample.affine(1.0 / (sigma * sigma + 1.0).sqrt(), 0.0)?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let point = self.current()?;
        let sigma = point.sigma;
        let sigma_next = self.sigmas[point.step + 1];
        let denoised = self.denoised(model_output, sample, sigma)?;
        let derivative = sample.sub(&denoised)?.affine(1.0 / sigma, 0.0)?;

        let next = match (self.kind, point.stage) {
            (SamplerKind::Lms, _) => self.lms_step(derivative, sample, point.step)?,
            (SamplerKind::EulerAncestral, _) | (SamplerKind::Dpm2Ancestral, Stage::Single) => {
                let (up, down) = ancestral_sigmas(sigma, sigma_next);
                let next = sample.add(&derivative.affine(down - sigma, 0.0)?)?;
                add_scaled_noise(next, up, noise)?
            }
            (_, Stage::Single) => sample.add(&derivative.affine(sigma_next - sigma, 0.0)?)?,
            (SamplerKind::Heun, Stage::Predictor) => {
                let dt = sigma_next - sigma;
                let next = sample.add(&derivative.affine(dt, 0.0)?)?;
                self.pending = Some(Pending {
                    sample: sample.clone(),
                    derivative,
                    dt,
                    sigma_up: 0.0,
                });
                next
            }
            (_, Stage::Predictor) => {
                let corrector = self.points[self.step_index + 1].sigma;
                let (sigma_up, target) = if self.kind == SamplerKind::Dpm2Ancestral {
                    ancestral_sigmas(sigma, sigma_next)
                } else {
                    (0.0, sigma_next)
                };
                let next = sample.add(&derivative.affine(corrector - sigma, 0.0)?)?;
                self.pending = Some(Pending {
                    sample: sample.clone(),
                    derivative,
                    dt: target - sigma,
                    sigma_up,
                });
                next
            }
            (kind, Stage::Corrector) => {
                let pending = self.pending.take().ok_or_else(|| {
                    Error::generation(format!("{} corrector without a predictor", kind))
                })?;
                let slope = if kind == SamplerKind::Heun {
                    pending.derivative.add(&derivative)?.affine(0.5, 0.0)?
                } else {
                    derivative
                };
                let next = pending.sample.add(&slope.affine(pending.dt, 0.0)?)?;
                add_scaled_noise(next, pending.sigma_up, noise)?
            }
        };

        self.step_index += 1;
        Ok(next)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step: usize) -> Result<Tensor> {
        let sigma = self
            .sigmas
            .get(step)
            .copied()
            .ok_or_else(|| Error::invalid_input(format!("no inference step {}", step)))?;
        Ok(original.add(&noise.affine(sigma, 0.0)?)?)
    }
}

/// Denoising diffusion implicit models, deterministic (`eta = 0`)
#[derive(Debug)]
pub struct DdimScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<f64>,
    step_ratio: usize,
    step_index: usize,
}

impl DdimScheduler {
    /// Create an unprepared scheduler; call [`Scheduler::set_timesteps`] first
    pub fn new(config: SchedulerConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod.first().copied().unwrap_or(1.0)
        };

        Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps: Vec::new(),
            step_ratio: 1,
            step_index: 0,
        }
    }

    fn alpha_at(&self, timestep: i64) -> f64 {
        if timestep < 0 {
            self.final_alpha_cumprod
        } else {
            let last = self.alphas_cumprod.len() - 1;
            self.alphas_cumprod[(timestep as usize).min(last)]
        }
    }
}

impl Scheduler for DdimScheduler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Ddim
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn set_timesteps(&mut self, steps: usize) -> Result<()> {
        if steps == 0 {
            return Err(Error::invalid_input("at least one inference step is required"));
        }
        self.step_ratio = (self.config.num_train_timesteps / steps).max(1);
        self.timesteps = self
            .config
            .spaced_timesteps(steps, TimestepSpacing::Leading)
            .into_iter()
            .map(f64::round)
            .collect();
        self.step_index = 0;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step_index(&self) -> usize {
        self.step_index
    }

    fn set_begin_step(&mut self, step: usize) -> Result<()> {
        if step >= self.timesteps.len() {
            return Err(Error::invalid_input(format!("no inference step {}", step)));
        }
        self.step_index = step;
        Ok(())
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: &Tensor) -> Result<Tensor> {
        Ok(sample.clone())
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        _noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let timestep = *self.timesteps.get(self.step_index).ok_or_else(|| {
            Error::generation(format!("ddim scheduler has no step {}", self.step_index))
        })? as i64;
        let alpha = self.alpha_at(timestep);
        let alpha_prev = self.alpha_at(timestep - self.step_ratio as i64);
        let (sqrt_a, sqrt_1ma) = (alpha.sqrt(), (1.0 - alpha).sqrt());

        let (pred_original, pred_epsilon) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let x0 = sample
                    .sub(&model_output.affine(sqrt_1ma, 0.0)?)?
                    .affine(1.0 / sqrt_a, 0.0)?;
                (x0, model_output.clone())
            }
            PredictionType::VPrediction => {
                let x0 = sample
                    .affine(sqrt_a, 0.0)?
                    .sub(&model_output.affine(sqrt_1ma, 0.0)?)?;
                let eps = model_output
                    .affine(sqrt_a, 0.0)?
                    .add(&sample.affine(sqrt_1ma, 0.0)?)?;
                (x0, eps)
            }
        };

        let next = pred_original
            .affine(alpha_prev.sqrt(), 0.0)?
            .add(&pred_epsilon.affine((1.0 - alpha_prev).sqrt(), 0.0)?)?;
        self.step_index += 1;
        Ok(next)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step: usize) -> Result<Tensor> {
        let timestep = *self
            .timesteps
            .get(step)
            .ok_or_else(|| Error::invalid_input(format!("no inference step {}", step)))?;
        let alpha = self.alpha_at(timestep as i64);
        Ok(original
            .affine(alpha.sqrt(), 0.0)?
            .add(&noise.affine((1.0 - alpha).sqrt(), 0.0)?)?)
    }
}

/// Resolve a request sampler name, falling back to the default
pub fn sampler_or_default(name: Option<&str>) -> SamplerKind {
    match name {
        None => SamplerKind::default(),
        Some(name) => SamplerKind::from_name(name).unwrap_or_else(|| {
            warn!(
                "Unknown sampler {:?}, falling back to {}",
                name,
                SamplerKind::default()
            );
            SamplerKind::default()
        }),
    }
}

fn add_scaled_noise(sample: Tensor, scale: f64, noise: &mut NoiseSource) -> Result<Tensor> {
    if scale <= 0.0 {
        return Ok(sample);
    }
    let fresh = noise.randn_like(&sample)?;
    Ok(sample.add(&fresh.affine(scale, 0.0)?)?)
}

/// `(sigma_up, sigma_down)` splitting a step into deterministic and noise parts
fn ancestral_sigmas(from: f64, to: f64) -> (f64, f64) {
    if from <= 0.0 {
        return (0.0, to);
    }
    let up = (to * to * (from * from - to * to) / (from * from))
        .max(0.0)
        .sqrt()
        .min(to);
    let down = (to * to - up * up).max(0.0).sqrt();
    (up, down)
}

/// Integral of the `j`-th Lagrange basis polynomial over one sigma interval
fn lms_coefficient(sigmas: &[f64], order: usize, step: usize, j: usize) -> f64 {
    let basis = |tau: f64| {
        (0..order)
            .filter(|&k| k != j)
            .map(|k| (tau - sigmas[step - k]) / (sigmas[step - j] - sigmas[step - k]))
            .product::<f64>()
    };
    simpson(basis, sigmas[step], sigmas[step + 1], 64)
}

fn simpson(f: impl Fn(f64) -> f64, a: f64, b: f64, intervals: usize) -> f64 {
    let n = intervals + intervals % 2;
    let h = (b - a) / n as f64;
    let inner: f64 = (1..n)
        .map(|i| {
            let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
            weight * f(a + i as f64 * h)
        })
        .sum();
    (f(a) + inner + f(b)) * h / 3.0
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}
