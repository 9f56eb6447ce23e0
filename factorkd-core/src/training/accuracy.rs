//! Top-k classification accuracy.

use crate::error::TrainError;

/// The ranks tracked for every classification pass (`prec@1`, `prec@5`).
pub const TOP_K: [usize; 2] = [1, 5];

/// Row-major `[rows, num_classes]` class scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    rows: usize,
    num_classes: usize,
    data: Vec<f32>,
}

impl ScoreMatrix {
    pub fn new(rows: usize, num_classes: usize, data: Vec<f32>) -> Result<Self, TrainError> {
        if rows * num_classes != data.len() {
            return Err(TrainError::model(format!(
                "score matrix of shape [{rows}, {num_classes}] given {} values",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            num_classes,
            data,
        })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, TrainError> {
        let num_classes = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|r| r.len() != num_classes) {
            return Err(TrainError::model(format!(
                "score row {bad} has {} classes, expected {num_classes}",
                rows[bad].len()
            )));
        }
        Ok(Self {
            rows: rows.len(),
            num_classes,
            data: rows.concat(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.num_classes..(i + 1) * self.num_classes]
    }
}

/// Percentage of rows whose label is among the `k` highest scores, for each
/// requested `k`, in request order.
///
/// Ties rank the lower class index first.
pub fn top_k_accuracy(
    scores: &ScoreMatrix,
    labels: &[usize],
    ks: &[usize],
) -> Result<Vec<f64>, TrainError> {
    let num_classes = scores.num_classes();
    if let Some(&k) = ks.iter().find(|&&k| k == 0 || k > num_classes) {
        return Err(TrainError::InvalidK { k, num_classes });
    }
    if labels.len() != scores.rows() {
        return Err(TrainError::data(format!(
            "{} labels for {} score rows",
            labels.len(),
            scores.rows()
        )));
    }
    if scores.rows() == 0 {
        return Err(TrainError::no_samples("top-k accuracy"));
    }
    if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(TrainError::data(format!(
            "label {label} out of range for {num_classes} classes"
        )));
    }

    let max_k = ks.iter().copied().max().unwrap_or(0);
    let mut hits = vec![0usize; ks.len()];
    let mut ranked: Vec<usize> = Vec::with_capacity(num_classes);

    for (i, &label) in labels.iter().enumerate() {
        let row = scores.row(i);
        ranked.clear();
        ranked.extend(0..num_classes);
        // Stable: equal scores keep ascending class order.
        ranked.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

        if let Some(rank) = ranked[..max_k].iter().position(|&c| c == label) {
            for (hit, &k) in hits.iter_mut().zip(ks) {
                if rank < k {
                    *hit += 1;
                }
            }
        }
    }

    let batch = scores.rows() as f64;
    Ok(hits.into_iter().map(|h| 100.0 * h as f64 / batch).collect())
}
