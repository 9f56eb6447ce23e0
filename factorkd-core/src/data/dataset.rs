//! Dataset identities and the normalization/augmentation record each one
//! resolves to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TrainError;

/// The image-classification datasets a run can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    #[default]
    #[serde(rename = "CIFAR10", alias = "cifar10")]
    Cifar10,
    #[serde(rename = "CIFAR100", alias = "cifar100")]
    Cifar100,
}

/// Augmentation applied to training images by the data pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationPolicy {
    /// Reflect padding added on every side before the random crop.
    pub reflect_padding: u32,
    pub crop_size: u32,
    pub horizontal_flip: bool,
    /// Maximum absolute rotation in degrees, if rotation is applied.
    pub rotation_degrees: Option<f32>,
}

/// Everything the data pipeline needs to know about a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub dataset: Dataset,
    pub num_classes: usize,
    pub train_samples: usize,
    pub test_samples: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub augmentation: AugmentationPolicy,
    /// Whether the auxiliary modules use batch normalization on this dataset.
    pub auxiliary_batch_norm: bool,
}

impl Dataset {
    pub const ALL: [Dataset; 2] = [Dataset::Cifar10, Dataset::Cifar100];

    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Cifar10 => "CIFAR10",
            Dataset::Cifar100 => "CIFAR100",
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Dataset::Cifar10 => 10,
            Dataset::Cifar100 => 100,
        }
    }

    /// Resolve the normalization constants and augmentation policy.
    pub fn profile(&self) -> DatasetProfile {
        match self {
            Dataset::Cifar10 => DatasetProfile {
                dataset: *self,
                num_classes: 10,
                train_samples: 50_000,
                test_samples: 10_000,
                mean: [0.4914, 0.4822, 0.4465],
                std: [0.2470, 0.2435, 0.2616],
                augmentation: AugmentationPolicy {
                    reflect_padding: 4,
                    crop_size: 32,
                    horizontal_flip: true,
                    rotation_degrees: None,
                },
                auxiliary_batch_norm: true,
            },
            Dataset::Cifar100 => DatasetProfile {
                dataset: *self,
                num_classes: 100,
                train_samples: 50_000,
                test_samples: 10_000,
                mean: [0.5071, 0.4865, 0.4409],
                std: [0.2673, 0.2564, 0.2762],
                augmentation: AugmentationPolicy {
                    reflect_padding: 4,
                    crop_size: 32,
                    horizontal_flip: true,
                    rotation_degrees: Some(15.0),
                },
                auxiliary_batch_norm: false,
            },
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dataset {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dataset::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                TrainError::config(format!(
                    "unknown dataset '{s}' (expected CIFAR10 or CIFAR100)"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let c10 = Dataset::Cifar10.profile();
        assert_eq!(c10.num_classes, 10);
        assert_eq!(c10.mean, [0.4914, 0.4822, 0.4465]);
        assert!(c10.augmentation.rotation_degrees.is_none());

        let c100 = Dataset::Cifar100.profile();
        assert_eq!(c100.num_classes, 100);
        assert_eq!(c100.augmentation.rotation_degrees, Some(15.0));
        assert!(!c100.auxiliary_batch_norm);
    }

    #[test]
    fn test_parse_dataset() {
        assert_eq!("CIFAR10".parse::<Dataset>().unwrap(), Dataset::Cifar10);
        assert_eq!("cifar100".parse::<Dataset>().unwrap(), Dataset::Cifar100);
        assert!(matches!(
            "imagenet".parse::<Dataset>(),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Dataset::Cifar100).unwrap();
        assert_eq!(json, "\"CIFAR100\"");
        let parsed: Dataset = serde_json::from_str("\"cifar10\"").unwrap();
        assert_eq!(parsed, Dataset::Cifar10);
    }
}
