//! Confusion-matrix segmentation metrics.
//!
//! A [`Metrics`] accumulator is created fresh for each train or validation
//! pass. Accumulation is a commutative monoid over confusion matrices, so the
//! order and grouping in which pixels arrive never changes the result.

use burn::prelude::*;

use crate::error::{RoboSatError, RoboSatResult};

/// Per-pixel predictions for one sample.
#[derive(Debug, Clone)]
pub enum Prediction<B: Backend> {
    /// Class scores or probabilities, `[K, H, W]`.
    Scores(Tensor<B, 3>),
    /// Already decided class ids, `[H, W]`.
    Labels(Tensor<B, 2, Int>),
}

impl<B: Backend> From<Tensor<B, 3>> for Prediction<B> {
    fn from(scores: Tensor<B, 3>) -> Self {
        Self::Scores(scores)
    }
}

impl<B: Backend> From<Tensor<B, 2, Int>> for Prediction<B> {
    fn from(labels: Tensor<B, 2, Int>) -> Self {
        Self::Labels(labels)
    }
}

/// Running `K x K` confusion matrix, rows are ground truth, columns predictions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metrics {
    num_classes: usize,
    confusion: Vec<u64>,
}

impl Metrics {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            confusion: vec![0; num_classes * num_classes],
        }
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// The accumulated matrix, row-major with ground truth as the row.
    pub fn confusion(&self) -> &[u64] {
        &self.confusion
    }

    /// Total number of pixels seen.
    pub fn pixels(&self) -> u64 {
        self.confusion.iter().sum()
    }

    /// Accumulates one sample: `mask` is `[H, W]`, the prediction either
    /// `[K, H, W]` scores or `[H, W]` labels.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the spatial sizes or the class count disagree,
    /// or if a class id falls outside `0..K`.
    pub fn add<B: Backend>(
        &mut self,
        mask: Tensor<B, 2, Int>,
        prediction: impl Into<Prediction<B>>,
    ) -> RoboSatResult<()> {
        let labels = match prediction.into() {
            Prediction::Labels(labels) => labels,
            Prediction::Scores(scores) => {
                let [classes, height, width] = scores.dims();
                if classes != self.num_classes {
                    return Err(RoboSatError::shape(
                        "prediction classes",
                        self.num_classes,
                        classes,
                    ));
                }
                scores.argmax(0).reshape([height, width])
            }
        };

        if mask.dims() != labels.dims() {
            return Err(RoboSatError::shape(
                "mask and prediction",
                mask.dims(),
                labels.dims(),
            ));
        }

        self.add_labels(&host_ids(mask), &host_ids(labels))
    }

    /// Accumulates a whole batch: `masks` is `[N, H, W]`, `outputs` is `[N, K, H, W]`.
    ///
    /// # Errors
    ///
    /// See [`Metrics::add`].
    pub fn add_batch<B: Backend>(
        &mut self,
        masks: Tensor<B, 3, Int>,
        outputs: Tensor<B, 4>,
    ) -> RoboSatResult<()> {
        let [n, classes, height, width] = outputs.dims();
        if classes != self.num_classes {
            return Err(RoboSatError::shape(
                "prediction classes",
                self.num_classes,
                classes,
            ));
        }
        if masks.dims() != [n, height, width] {
            return Err(RoboSatError::shape(
                "masks and outputs",
                [n, height, width],
                masks.dims(),
            ));
        }

        let labels = outputs.argmax(1).reshape([n, height, width]);
        self.add_labels(&host_ids(masks), &host_ids(labels))
    }

    /// Accumulates host-side ground truth and predicted ids of equal length.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` on a length mismatch or an id outside `0..K`.
    pub fn add_labels(&mut self, truth: &[i64], predicted: &[i64]) -> RoboSatResult<()> {
        if truth.len() != predicted.len() {
            return Err(RoboSatError::shape(
                "ground truth and prediction pixels",
                truth.len(),
                predicted.len(),
            ));
        }

        let k = self.num_classes as i64;
        if let Some(&bad) = truth
            .iter()
            .chain(predicted)
            .find(|id| !(0..k).contains(*id))
        {
            return Err(RoboSatError::shape("class id", format!("0..{k}"), bad));
        }

        for (&t, &p) in truth.iter().zip(predicted) {
            self.confusion[(t * k + p) as usize] += 1;
        }
        Ok(())
    }

    /// Adds another accumulator's counts into this one.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the class counts differ.
    pub fn merge(&mut self, other: &Self) -> RoboSatResult<()> {
        if other.num_classes != self.num_classes {
            return Err(RoboSatError::shape(
                "merged metrics classes",
                self.num_classes,
                other.num_classes,
            ));
        }
        for (mine, theirs) in self.confusion.iter_mut().zip(&other.confusion) {
            *mine += theirs;
        }
        Ok(())
    }

    fn at(&self, truth: usize, predicted: usize) -> u64 {
        self.confusion[truth * self.num_classes + predicted]
    }

    fn row_sum(&self, class: usize) -> u64 {
        (0..self.num_classes).map(|p| self.at(class, p)).sum()
    }

    fn column_sum(&self, class: usize) -> u64 {
        (0..self.num_classes).map(|t| self.at(t, class)).sum()
    }

    /// IoU of one class, `None` when the class never occurs in truth or prediction.
    pub fn class_iou(&self, class: usize) -> Option<f64> {
        if class >= self.num_classes {
            return None;
        }
        let tp = self.at(class, class);
        let union = self.row_sum(class) + self.column_sum(class) - tp;
        (union > 0).then(|| tp as f64 / union as f64)
    }

    /// Mean IoU over classes with a non-empty union, `NaN` if there are none.
    pub fn miou(&self) -> f64 {
        let ious: Vec<f64> = (0..self.num_classes)
            .filter_map(|class| self.class_iou(class))
            .collect();
        if ious.is_empty() {
            return f64::NAN;
        }
        ious.iter().sum::<f64>() / ious.len() as f64
    }

    /// IoU of class 1, `NaN` if undefined.
    pub fn fg_iou(&self) -> f64 {
        self.class_iou(1).unwrap_or(f64::NAN)
    }

    /// Matthews correlation coefficient, Gorodkin's K-class form.
    ///
    /// Equals the binary MCC for two classes; 0 when the denominator vanishes.
    pub fn mcc(&self) -> f64 {
        let s = self.pixels() as f64;
        let c: f64 = (0..self.num_classes).map(|k| self.at(k, k) as f64).sum();

        let (mut pt, mut pp, mut tt) = (0.0, 0.0, 0.0);
        for k in 0..self.num_classes {
            let t = self.row_sum(k) as f64;
            let p = self.column_sum(k) as f64;
            pt += p * t;
            pp += p * p;
            tt += t * t;
        }

        let denominator = ((s * s - pp) * (s * s - tt)).sqrt();
        if denominator == 0.0 {
            return 0.0;
        }
        (c * s - pt) / denominator
    }
}

fn host_ids<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}
