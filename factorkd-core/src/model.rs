//! Model collaborator boundary.
//!
//! The forward/backward computation of the teacher, student, paraphraser and
//! translator networks lives outside this crate. The training loop only sees
//! the [`Model`] trait: per-role mode toggles, a forward pass that reports loss
//! term values, class scores and named features, backward of a weighted loss composition, and
//! optimizer construction from an explicit set of trainable roles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::OptimizerSettings;
use crate::data::LabeledBatch;
use crate::error::TrainError;
use crate::training::accuracy::ScoreMatrix;
use crate::training::checkpoint::ModuleState;

/// The part a network plays in factor-transfer distillation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
    Paraphraser,
    Translator,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Teacher,
        Role::Student,
        Role::Paraphraser,
        Role::Translator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Paraphraser => "paraphraser",
            Role::Translator => "translator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type RoleSet = BTreeSet<Role>;

/// Whether a module runs with training behaviour (dropout, batch-norm
/// statistics updates, gradient tracking) or inference behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Eval,
}

/// Role → trainable flag for the modules of one run.
///
/// The flag is orchestration state only: it decides which roles are handed to
/// optimizer construction for a stage and is never written into a module or
/// a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSet {
    trainable: BTreeMap<Role, bool>,
}

impl ModuleSet {
    /// A module set where every listed role starts trainable.
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            trainable: roles.into_iter().map(|r| (r, true)).collect(),
        }
    }

    /// The four-role distillation set. The teacher is frozen from the start.
    pub fn distillation() -> Self {
        let mut set = Self::new(Role::ALL);
        set.trainable.insert(Role::Teacher, false);
        set
    }

    pub fn roles(&self) -> RoleSet {
        self.trainable.keys().copied().collect()
    }

    pub fn contains(&self, role: Role) -> bool {
        self.trainable.contains_key(&role)
    }

    pub fn is_trainable(&self, role: Role) -> bool {
        self.trainable.get(&role).copied().unwrap_or(false)
    }

    pub fn set_trainable(&mut self, role: Role, trainable: bool) -> Result<(), TrainError> {
        match self.trainable.get_mut(&role) {
            Some(flag) => {
                *flag = trainable;
                Ok(())
            }
            None => Err(TrainError::config(format!(
                "role '{role}' is not part of this module set"
            ))),
        }
    }

    /// Roles currently marked trainable.
    pub fn trainable(&self) -> RoleSet {
        self.trainable
            .iter()
            .filter(|(_, t)| **t)
            .map(|(r, _)| *r)
            .collect()
    }

    /// Validate that every role a stage wants to optimize exists and is
    /// still trainable, returning the set to hand to optimizer construction.
    pub fn stage_roles(&self, requested: &RoleSet) -> Result<RoleSet, TrainError> {
        for role in requested {
            if !self.contains(*role) {
                return Err(TrainError::config(format!(
                    "stage requires role '{role}' which the module set does not have"
                )));
            }
            if !self.is_trainable(*role) {
                return Err(TrainError::config(format!(
                    "stage requires role '{role}' but it is frozen"
                )));
            }
        }
        Ok(requested.clone())
    }

    /// Put the roles in `trainable` into train mode and everything else
    /// into eval mode.
    pub fn apply_modes<M: Model>(&self, model: &mut M, trainable: &RoleSet) {
        for role in self.trainable.keys() {
            let mode = if trainable.contains(role) {
                Mode::Train
            } else {
                Mode::Eval
            };
            model.set_mode(*role, mode);
        }
    }
}

/// A differentiable loss term the model collaborator knows how to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Paraphraser output vs. the teacher features it reconstructs.
    Reconstruction,
    /// Student prediction vs. class labels.
    Classification,
    /// Translated student factors vs. paraphrased teacher factors.
    FactorTransfer,
}

impl LossKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::Reconstruction => "reconstruction",
            LossKind::Classification => "classification",
            LossKind::FactorTransfer => "factor_transfer",
        }
    }

    /// Short label used in progress lines.
    pub fn short(&self) -> &'static str {
        match self {
            LossKind::Reconstruction => "Para",
            LossKind::Classification => "Cls",
            LossKind::FactorTransfer => "FT",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw loss term values reported by one forward pass.
pub type LossValues = BTreeMap<LossKind, f64>;

/// Ordered `(loss kind, weight)` pairs whose weighted sum a stage optimizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossComposition {
    terms: Vec<(LossKind, f64)>,
}

impl LossComposition {
    pub fn new(terms: Vec<(LossKind, f64)>) -> Result<Self, TrainError> {
        if terms.is_empty() {
            return Err(TrainError::config(
                "loss composition needs at least one term",
            ));
        }
        let mut seen = BTreeSet::new();
        for (kind, weight) in &terms {
            if !seen.insert(*kind) {
                return Err(TrainError::config(format!(
                    "loss term '{kind}' appears twice in the composition"
                )));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(TrainError::config(format!(
                    "loss term '{kind}' has invalid weight {weight}"
                )));
            }
        }
        Ok(Self { terms })
    }

    /// Paraphraser pretraining: reconstruction only.
    pub fn reconstruction() -> Self {
        Self {
            terms: vec![(LossKind::Reconstruction, 1.0)],
        }
    }

    /// Baseline training and evaluation: classification only.
    pub fn classification() -> Self {
        Self {
            terms: vec![(LossKind::Classification, 1.0)],
        }
    }

    /// Joint training: classification plus weighted factor transfer.
    pub fn joint(distillation_weight: f64) -> Result<Self, TrainError> {
        Self::new(vec![
            (LossKind::Classification, 1.0),
            (LossKind::FactorTransfer, distillation_weight),
        ])
    }

    pub fn terms(&self) -> &[(LossKind, f64)] {
        &self.terms
    }

    pub fn kinds(&self) -> Vec<LossKind> {
        self.terms.iter().map(|(k, _)| *k).collect()
    }

    pub fn weight(&self, kind: LossKind) -> Option<f64> {
        self.terms.iter().find(|(k, _)| *k == kind).map(|(_, w)| *w)
    }

    /// Weight each reported term, in composition order.
    ///
    /// Fails if the forward pass did not report a term the composition needs.
    pub fn weigh(&self, values: &LossValues) -> Result<Vec<(LossKind, f64)>, TrainError> {
        self.terms
            .iter()
            .map(|(kind, weight)| {
                values
                    .get(kind)
                    .map(|v| (*kind, v * weight))
                    .ok_or_else(|| {
                        TrainError::model(format!("forward pass did not report loss term '{kind}'"))
                    })
            })
            .collect()
    }
}

/// Name of the teacher/student representation the auxiliary modules consume.
pub const STAGE3_FEATURES: &str = "stage3_features";

/// Named intermediate representations produced by a module's forward pass.
///
/// Consumers look representations up by name rather than by position in an
/// output tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Representations<T> {
    named: BTreeMap<String, T>,
}

impl<T> Default for Representations<T> {
    fn default() -> Self {
        Self {
            named: BTreeMap::new(),
        }
    }
}

impl<T> Representations<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: T) -> Self {
        self.named.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        self.named.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<&T, TrainError> {
        self.named
            .get(name)
            .ok_or_else(|| TrainError::model(format!("missing representation '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }
}

impl Representations<Vec<f32>> {
    /// First representation holding a NaN or infinite activation, with that value.
    pub fn first_non_finite(&self) -> Option<(&str, f32)> {
        self.named.iter().find_map(|(name, values)| {
            values
                .iter()
                .find(|v| !v.is_finite())
                .map(|v| (name.as_str(), *v))
        })
    }
}

/// What the model collaborator reports for one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForwardPass {
    pub losses: LossValues,
    /// Student class scores, `[batch, num_classes]`, when the stage classifies.
    pub scores: Option<ScoreMatrix>,
    /// Intermediate features the pass exposes, e.g. [`STAGE3_FEATURES`].
    pub representations: Representations<Vec<f32>>,
}

/// Learning-rate handle of an optimizer built by the model collaborator.
pub trait Optimizer {
    fn learning_rate(&self) -> f64;

    /// Apply `lr` to every parameter group.
    fn set_learning_rate(&mut self, lr: f64);
}

/// The black-box differentiable function the training loop drives.
pub trait Model {
    type Batch: LabeledBatch;
    type Optimizer: Optimizer;

    /// Roles this model provides modules for.
    fn roles(&self) -> RoleSet;

    fn set_mode(&mut self, role: Role, mode: Mode);

    /// Run the modules needed for `terms` on `batch` and report each term.
    ///
    /// With [`Mode::Eval`] no gradient state is retained.
    fn forward(
        &mut self,
        batch: &Self::Batch,
        terms: &[LossKind],
        mode: Mode,
    ) -> Result<ForwardPass, TrainError>;

    /// Backpropagate the weighted sum of the terms from the last forward pass.
    fn backward(&mut self, composition: &LossComposition) -> Result<(), TrainError>;

    /// Build an optimizer over the parameters of exactly `trainable`.
    fn build_optimizer(
        &mut self,
        trainable: &RoleSet,
        settings: &OptimizerSettings,
    ) -> Result<Self::Optimizer, TrainError>;

    /// Apply accumulated gradients and clear them.
    fn step(&mut self, optimizer: &mut Self::Optimizer) -> Result<(), TrainError>;

    fn export_state(&self, role: Role) -> Result<ModuleState, TrainError>;

    fn import_state(&mut self, role: Role, state: &ModuleState) -> Result<(), TrainError>;
}
