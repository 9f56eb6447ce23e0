//! A scripted model collaborator for testing and development.
//!
//! [`MockModel`] implements [`Model`] without any numeric computation: loss
//! terms shrink as the relevant role receives optimizer steps, evaluation
//! top-1 follows a script, and module state is a small textual counter.

use std::collections::BTreeMap;

use crate::config::OptimizerSettings;
use crate::data::LabeledBatch;
use crate::error::TrainError;
use crate::model::{
    ForwardPass, LossComposition, LossKind, LossValues, Mode, Model, Optimizer, Representations,
    Role, RoleSet, STAGE3_FEATURES,
};
use crate::training::accuracy::ScoreMatrix;
use crate::training::checkpoint::ModuleState;

/// A batch carrying only labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBatch {
    labels: Vec<usize>,
}

impl MockBatch {
    pub fn new(labels: Vec<usize>) -> Self {
        Self { labels }
    }
}

impl LabeledBatch for MockBatch {
    fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Optimizer handle returned by [`MockModel::build_optimizer`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockOptimizer {
    roles: RoleSet,
    settings: OptimizerSettings,
}

impl MockOptimizer {
    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }
}

impl Optimizer for MockOptimizer {
    fn learning_rate(&self) -> f64 {
        self.settings.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.settings.learning_rate = lr;
    }
}

pub struct MockModel {
    num_classes: usize,
    roles: RoleSet,
    modes: BTreeMap<Role, Mode>,
    updates: BTreeMap<Role, usize>,
    steps: usize,
    eval_top1: Vec<f64>,
    eval_passes: usize,
    diverge_at: Option<usize>,
    nan_features_at: Option<usize>,
    joint_forwards: usize,
    last_mode: Option<Mode>,
    learning_rates: Vec<f64>,
    optimizers_built: Vec<RoleSet>,
    imported: Vec<Role>,
}

impl MockModel {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            roles: Role::ALL.into_iter().collect(),
            modes: BTreeMap::new(),
            updates: Role::ALL.iter().map(|r| (*r, 0)).collect(),
            steps: 0,
            eval_top1: Vec::new(),
            eval_passes: 0,
            diverge_at: None,
            nan_features_at: None,
            joint_forwards: 0,
            last_mode: None,
            learning_rates: Vec::new(),
            optimizers_built: Vec::new(),
            imported: Vec::new(),
        }
    }

    /// Top-1 accuracy of successive eval-mode classification batches. The
    /// last value repeats once the script runs out; unscripted batches
    /// score 100%.
    pub fn with_eval_top1(mut self, script: Vec<f64>) -> Self {
        self.eval_top1 = script;
        self
    }

    /// Report a NaN factor-transfer loss on the `call`-th training forward
    /// that classifies (1-indexed, counted across epochs).
    pub fn with_divergence_at(mut self, call: usize) -> Self {
        self.diverge_at = Some(call);
        self
    }

    /// Report NaN student features, with finite losses, on the `call`-th
    /// training forward that classifies.
    pub fn with_feature_divergence_at(mut self, call: usize) -> Self {
        self.nan_features_at = Some(call);
        self
    }

    /// Provide modules for `roles` only, e.g. a single baseline network.
    pub fn with_roles(mut self, roles: RoleSet) -> Self {
        self.roles = roles;
        self
    }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Optimizer steps that touched `role`.
    pub fn updates(&self, role: Role) -> usize {
        self.updates.get(&role).copied().unwrap_or(0)
    }

    pub fn mode(&self, role: Role) -> Option<Mode> {
        self.modes.get(&role).copied()
    }

    /// Learning rate in effect at each optimizer step.
    pub fn learning_rates(&self) -> &[f64] {
        &self.learning_rates
    }

    /// Trainable role sets passed to `build_optimizer`, in call order.
    pub fn optimizers_built(&self) -> &[RoleSet] {
        &self.optimizers_built
    }

    /// Roles whose state was imported, in call order.
    pub fn imported(&self) -> &[Role] {
        &self.imported
    }

    fn decay(&self, role: Role) -> f64 {
        1.0 / (1.0 + self.updates(role) as f64)
    }

    fn features(&self, role: Role) -> Vec<f32> {
        vec![self.decay(role) as f32; 4]
    }

    fn scores(&mut self, labels: &[usize], mode: Mode) -> Result<ScoreMatrix, TrainError> {
        let top1 = if mode == Mode::Eval {
            let pick = self
                .eval_top1
                .get(self.eval_passes)
                .or(self.eval_top1.last())
                .copied()
                .unwrap_or(100.0);
            self.eval_passes += 1;
            pick
        } else {
            100.0
        };
        let correct = (top1 / 100.0 * labels.len() as f64).round() as usize;

        let c = self.num_classes;
        let mut data = vec![0.0f32; labels.len() * c];
        for (i, &label) in labels.iter().enumerate() {
            let row = &mut data[i * c..(i + 1) * c];
            if i < correct {
                row[label] = 1.0;
            } else {
                // Second place: a top-1 miss that top-5 still counts.
                row[(label + 1) % c] = 1.0;
                row[label] = 0.5;
            }
        }
        ScoreMatrix::new(labels.len(), c, data)
    }
}

impl Model for MockModel {
    type Batch = MockBatch;
    type Optimizer = MockOptimizer;

    fn roles(&self) -> RoleSet {
        self.roles.clone()
    }

    fn set_mode(&mut self, role: Role, mode: Mode) {
        self.modes.insert(role, mode);
    }

    fn forward(
        &mut self,
        batch: &MockBatch,
        terms: &[LossKind],
        mode: Mode,
    ) -> Result<ForwardPass, TrainError> {
        let teacher = self.features(Role::Teacher);
        let mut student = self.features(Role::Student);
        let classifies = terms.contains(&LossKind::Classification);
        if classifies && mode == Mode::Train {
            self.joint_forwards += 1;
            if self.nan_features_at == Some(self.joint_forwards) {
                student[0] = f32::NAN;
            }
        }

        let mut losses = LossValues::new();
        for term in terms {
            let value = match term {
                LossKind::Reconstruction => f64::from(teacher[0]) * self.decay(Role::Paraphraser),
                LossKind::Classification => 2.0 * self.decay(Role::Student),
                LossKind::FactorTransfer => {
                    if mode == Mode::Train && self.diverge_at == Some(self.joint_forwards) {
                        f64::NAN
                    } else {
                        0.01 * self.decay(Role::Student) * self.decay(Role::Translator)
                    }
                }
            };
            losses.insert(*term, value);
        }

        let scores = if classifies {
            Some(self.scores(batch.labels(), mode)?)
        } else {
            None
        };
        let exposed = if classifies { student } else { teacher };
        self.last_mode = Some(mode);
        Ok(ForwardPass {
            losses,
            scores,
            representations: Representations::new().with(STAGE3_FEATURES, exposed),
        })
    }

    fn backward(&mut self, _composition: &LossComposition) -> Result<(), TrainError> {
        match self.last_mode {
            Some(Mode::Train) => Ok(()),
            _ => Err(TrainError::model("backward without a training forward pass")),
        }
    }

    fn build_optimizer(
        &mut self,
        trainable: &RoleSet,
        settings: &OptimizerSettings,
    ) -> Result<MockOptimizer, TrainError> {
        if trainable.contains(&Role::Teacher) {
            return Err(TrainError::model("the teacher has no trainable parameters"));
        }
        self.optimizers_built.push(trainable.clone());
        Ok(MockOptimizer {
            roles: trainable.clone(),
            settings: settings.clone(),
        })
    }

    fn step(&mut self, optimizer: &mut MockOptimizer) -> Result<(), TrainError> {
        self.steps += 1;
        self.learning_rates.push(optimizer.learning_rate());
        for role in optimizer.roles() {
            *self.updates.entry(*role).or_insert(0) += 1;
        }
        self.last_mode = None;
        Ok(())
    }

    fn export_state(&self, role: Role) -> Result<ModuleState, TrainError> {
        Ok(ModuleState::new(
            format!("{role}:{}", self.updates(role)).into_bytes(),
        ))
    }

    fn import_state(&mut self, role: Role, state: &ModuleState) -> Result<(), TrainError> {
        let text = std::str::from_utf8(state.as_bytes())
            .map_err(|e| TrainError::model(format!("state for '{role}' is not text: {e}")))?;
        let updates = text
            .strip_prefix(role.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| {
                TrainError::model(format!("state '{text}' does not belong to '{role}'"))
            })?;
        self.updates.insert(role, updates);
        self.imported.push(role);
        Ok(())
    }
}
