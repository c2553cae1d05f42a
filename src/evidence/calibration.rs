// ================================================================================================
// Calibration
// ================================================================================================
//
// Deterministic search over bin counts mapping predictions to empirical probabilities.
// Same `(config, data, seed)` produces identical iterations and an identical
// `result_json`, byte for byte.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::info;

use crate::{
    error::{EvidenceError, WorldlineResult},
    evidence::canonical,
    types::{DatasetId, JobId, LabelId, NodeId, ProjectId, RunId, TenantId},
};

/// Bin counts tried in order, truncated to `max_iterations`.
pub const DEFAULT_BIN_COUNTS: [usize; 6] = [5, 10, 15, 20, 25, 30];
pub const MIN_SAMPLES_PER_BIN: usize = 2;
pub const MIN_TOTAL_SAMPLES: usize = 10;

// ================================================================================================
// Ground Truth
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthDataset {
    pub id: DatasetId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A labeled run outcome. Upserts are idempotent, keyed by `(dataset, run)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthLabel {
    pub id: LabelId,
    pub dataset_id: DatasetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub run_id: RunId,
    pub label: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// In-process ground-truth store.
#[derive(Default)]
pub struct GroundTruthStore {
    datasets: DashMap<DatasetId, GroundTruthDataset>,
    labels: DashMap<(DatasetId, RunId), GroundTruthLabel>,
}

impl GroundTruthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_dataset(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        name: impl Into<String>,
        description: Option<String>,
    ) -> GroundTruthDataset {
        let dataset = GroundTruthDataset {
            id: DatasetId::new(),
            tenant_id,
            project_id,
            name: name.into(),
            description,
            created_at: Utc::now(),
        };
        self.datasets.insert(dataset.id, dataset.clone());
        dataset
    }

    pub fn dataset(&self, id: DatasetId) -> Option<GroundTruthDataset> {
        self.datasets.get(&id).map(|entry| entry.clone())
    }

    /// Idempotent upsert keyed by `(dataset, run)`. Returns true on insert, false on
    /// update.
    pub fn upsert_label(
        &self,
        dataset_id: DatasetId,
        node_id: Option<NodeId>,
        run_id: RunId,
        label: bool,
        notes: Option<String>,
    ) -> bool {
        let key = (dataset_id, run_id);
        match self.labels.get_mut(&key) {
            Some(mut existing) => {
                existing.label = label;
                existing.notes = notes;
                false
            }
            None => {
                self.labels.insert(
                    key,
                    GroundTruthLabel {
                        id: LabelId::new(),
                        dataset_id,
                        node_id,
                        run_id,
                        label,
                        notes,
                        created_at: Utc::now(),
                    },
                );
                true
            }
        }
    }

    pub fn label_for(&self, dataset_id: DatasetId, run_id: RunId) -> Option<GroundTruthLabel> {
        self.labels.get(&(dataset_id, run_id)).map(|entry| entry.clone())
    }

    pub fn labels(&self, dataset_id: DatasetId) -> Vec<GroundTruthLabel> {
        let mut labels: Vec<GroundTruthLabel> = self
            .labels
            .iter()
            .filter(|entry| entry.dataset_id == dataset_id)
            .map(|entry| entry.clone())
            .collect();
        labels.sort_by_key(|l| l.run_id);
        labels
    }

    pub fn label_count(&self, dataset_id: DatasetId) -> usize {
        self.labels
            .iter()
            .filter(|entry| entry.dataset_id == dataset_id)
            .count()
    }
}

// ================================================================================================
// Calibration Config & Samples
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    #[default]
    Uniform,
    RecentDecay,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Gte,
    Gt,
    Lte,
    Lt,
    Eq,
}

impl ComparisonOperator {
    fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gte => value >= threshold,
            Self::Gt => value > threshold,
            Self::Lte => value <= threshold,
            Self::Lt => value < threshold,
            Self::Eq => (value - threshold).abs() < 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub dataset_id: DatasetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub target_accuracy: f64,
    pub max_iterations: usize,
    pub metric_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<ComparisonOperator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window_days: Option<i64>,
    pub weighting: WeightingMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl CalibrationConfig {
    pub fn new(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id,
            node_id: None,
            target_accuracy: 0.85,
            max_iterations: DEFAULT_BIN_COUNTS.len(),
            metric_key: "primary_outcome_probability".to_string(),
            op: None,
            threshold: None,
            time_window_days: None,
            weighting: WeightingMethod::Uniform,
            seed: None,
        }
    }
}

/// One prediction joined to its ground-truth label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub run_id: RunId,
    pub predicted_value: f64,
    pub label: f64,
    pub weight: f64,
}

/// One bin of the calibration mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bin_start: f64,
    pub bin_end: f64,
    pub calibrated_prob: f64,
    pub n_samples: usize,
    pub empirical_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub accuracy: f64,
    pub brier_score: f64,
    pub ece: f64,
    pub n_samples: usize,
}

/// One immutable iteration of the search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationIteration {
    pub iter_index: usize,
    pub bin_count: usize,
    pub metrics: CalibrationMetrics,
    pub mapping: Vec<CalibrationBin>,
}

/// Join-quality audit block stored with every result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationAudit {
    pub total_outcomes: usize,
    pub total_labels: usize,
    pub runs_matched: usize,
    pub runs_missing_labels: usize,
    pub runs_missing_metric: usize,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CalibrationJobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl CalibrationJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub config: CalibrationConfig,
    pub status: CalibrationJobStatus,
    pub progress: usize,
    pub total_iterations: usize,
    pub iterations: Vec<CalibrationIteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ================================================================================================
// Calibration Service
// ================================================================================================

pub struct CalibrationService {
    jobs: DashMap<JobId, CalibrationJob>,
    ground_truth: Arc<GroundTruthStore>,
}

impl CalibrationService {
    pub fn new(ground_truth: Arc<GroundTruthStore>) -> Self {
        Self {
            jobs: DashMap::new(),
            ground_truth,
        }
    }

    pub fn ground_truth(&self) -> &GroundTruthStore {
        &self.ground_truth
    }

    pub fn create_job(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        config: CalibrationConfig,
    ) -> CalibrationJob {
        let total_iterations = bin_schedule(config.max_iterations).len();
        let job = CalibrationJob {
            id: JobId::new(),
            tenant_id,
            project_id,
            config,
            status: CalibrationJobStatus::Queued,
            progress: 0,
            total_iterations,
            iterations: Vec::new(),
            result_json: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    pub fn job(&self, id: JobId) -> Option<CalibrationJob> {
        self.jobs.get(&id).map(|entry| entry.clone())
    }

    pub fn cancel_job(&self, id: JobId) -> WorldlineResult<bool> {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| EvidenceError::RunNotFound(id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = CalibrationJobStatus::Canceled;
        job.finished_at = Some(Utc::now());
        job.error_message = Some("canceled by user".to_string());
        Ok(true)
    }

    /// Join run predictions against the dataset's labels, producing samples sorted by
    /// predicted value plus the audit block. `outcomes` carries
    /// `(run_id, predicted_value, completed_at)` per candidate run.
    pub fn assemble_samples(
        &self,
        dataset_id: DatasetId,
        outcomes: &[(RunId, Option<f64>, DateTime<Utc>)],
        weighting: WeightingMethod,
        now: DateTime<Utc>,
    ) -> (Vec<CalibrationSample>, CalibrationAudit) {
        let mut samples = Vec::new();
        let mut audit = CalibrationAudit {
            total_outcomes: outcomes.len(),
            total_labels: self.ground_truth.label_count(dataset_id),
            ..CalibrationAudit::default()
        };

        for (run_id, predicted, completed_at) in outcomes {
            let Some(label) = self.ground_truth.label_for(dataset_id, *run_id) else {
                audit.runs_missing_labels += 1;
                continue;
            };
            let Some(predicted_value) = predicted else {
                audit.runs_missing_metric += 1;
                continue;
            };
            let weight = match weighting {
                WeightingMethod::Uniform => 1.0,
                WeightingMethod::RecentDecay => {
                    let days_ago = (now - *completed_at).num_days().max(0) as f64;
                    (-0.1 * days_ago).exp()
                }
            };
            samples.push(CalibrationSample {
                run_id: *run_id,
                predicted_value: *predicted_value,
                label: if label.label { 1.0 } else { 0.0 },
                weight,
            });
            audit.runs_matched += 1;
        }

        samples.sort_by_key(|s| (OrderedFloat(s.predicted_value), s.run_id));
        (samples, audit)
    }

    /// Run the calibration search synchronously over pre-assembled samples.
    pub fn run_job(
        &self,
        job_id: JobId,
        samples: &[CalibrationSample],
        audit: CalibrationAudit,
    ) -> WorldlineResult<CalibrationJob> {
        {
            let mut job = self
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| EvidenceError::RunNotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Err(EvidenceError::JobTerminal(job_id.to_string()).into());
            }
            job.status = CalibrationJobStatus::Running;
            job.started_at = Some(Utc::now());
        }

        if samples.len() < MIN_TOTAL_SAMPLES {
            let message = format!(
                "insufficient data: {} samples found, minimum {MIN_TOTAL_SAMPLES} required",
                samples.len()
            );
            let mut job = self.jobs.get_mut(&job_id).expect("job exists");
            job.status = CalibrationJobStatus::Failed;
            job.error_message = Some(message);
            job.result_json = Some(canonical::normalize(&json!({ "audit": audit })));
            job.finished_at = Some(Utc::now());
            return Ok(job.clone());
        }

        let config = self.jobs.get(&job_id).expect("job exists").config.clone();
        let schedule = bin_schedule(config.max_iterations);

        let mut best: Option<(usize, usize, Vec<CalibrationBin>, CalibrationMetrics)> = None;
        let mut iterations = Vec::new();

        for (index, bin_count) in schedule.iter().enumerate() {
            let (mapping, metrics) =
                compute_calibration(samples, *bin_count, config.op, config.threshold);
            iterations.push(CalibrationIteration {
                iter_index: index,
                bin_count: *bin_count,
                metrics: metrics.clone(),
                mapping: mapping.clone(),
            });

            {
                let mut job = self.jobs.get_mut(&job_id).expect("job exists");
                job.progress = index + 1;
                job.iterations = iterations.clone();
            }

            let improved = best
                .as_ref()
                .is_none_or(|(_, _, _, b)| metrics.accuracy > b.accuracy);
            if improved {
                best = Some((index, *bin_count, mapping, metrics.clone()));
            }

            if metrics.accuracy >= config.target_accuracy {
                break;
            }
        }

        let (best_iteration, best_bin_count, best_mapping, best_metrics) =
            best.expect("at least one iteration ran");
        let selected_run_ids: Vec<String> = samples
            .iter()
            .take(50)
            .map(|s| s.run_id.to_string())
            .collect();

        let result_json = canonical::normalize(&json!({
            "best_mapping": best_mapping,
            "best_bin_count": best_bin_count,
            "best_iteration": best_iteration,
            "metrics": best_metrics,
            "n_samples": samples.len(),
            "selected_run_ids": selected_run_ids,
            "audit": audit,
        }));

        let mut job = self.jobs.get_mut(&job_id).expect("job exists");
        job.status = CalibrationJobStatus::Succeeded;
        job.result_json = Some(result_json);
        job.finished_at = Some(Utc::now());
        info!(job_id = %job_id, best_bin_count, accuracy = best_metrics.accuracy, "calibration complete");
        Ok(job.clone())
    }
}

fn bin_schedule(max_iterations: usize) -> Vec<usize> {
    DEFAULT_BIN_COUNTS
        .iter()
        .take(max_iterations.max(1))
        .copied()
        .collect()
}

/// Deterministic binning: equal-width bins over `[min p, max p]`, sparse bins falling
/// back to the overall mean label, weighted empirical rates, and accuracy / Brier /
/// ECE metrics.
pub fn compute_calibration(
    samples: &[CalibrationSample],
    bin_count: usize,
    op: Option<ComparisonOperator>,
    threshold: Option<f64>,
) -> (Vec<CalibrationBin>, CalibrationMetrics) {
    if samples.is_empty() {
        return (
            Vec::new(),
            CalibrationMetrics {
                accuracy: 0.0,
                brier_score: 1.0,
                ece: 1.0,
                n_samples: 0,
            },
        );
    }

    let n = samples.len();
    let overall_rate = samples.iter().map(|s| s.label).sum::<f64>() / n as f64;

    let min_val = samples
        .iter()
        .map(|s| s.predicted_value)
        .fold(f64::INFINITY, f64::min);
    let max_val = samples
        .iter()
        .map(|s| s.predicted_value)
        .fold(f64::NEG_INFINITY, f64::max);

    let (edges, bin_count) = if min_val == max_val {
        (vec![min_val - 0.001, max_val + 0.001], 1)
    } else {
        let span = max_val + 1e-9 - min_val;
        let edges: Vec<f64> = (0..=bin_count)
            .map(|i| min_val + span * i as f64 / bin_count as f64)
            .collect();
        (edges, bin_count)
    };

    let bin_of = |value: f64| -> usize {
        let mut bin = bin_count.saturating_sub(1);
        for b in 0..bin_count {
            if value < edges[b + 1] {
                bin = b;
                break;
            }
        }
        bin
    };

    let mut mapping = Vec::with_capacity(bin_count);
    let mut calibrated = vec![0.0; n];
    for b in 0..bin_count {
        let member_indices: Vec<usize> = (0..n)
            .filter(|&i| bin_of(samples[i].predicted_value) == b)
            .collect();

        let empirical_rate = if member_indices.len() < MIN_SAMPLES_PER_BIN {
            overall_rate
        } else {
            let bin_weight: f64 = member_indices.iter().map(|&i| samples[i].weight).sum();
            member_indices
                .iter()
                .map(|&i| samples[i].weight * samples[i].label)
                .sum::<f64>()
                / bin_weight
        };

        for &i in &member_indices {
            calibrated[i] = empirical_rate;
        }
        mapping.push(CalibrationBin {
            bin_start: edges[b],
            bin_end: edges[b + 1],
            calibrated_prob: empirical_rate,
            n_samples: member_indices.len(),
            empirical_rate,
        });
    }

    // Accuracy: thresholded predictions when an operator is configured, otherwise a
    // 0.5 cut on calibrated probabilities.
    let predictions: Vec<f64> = match (op, threshold) {
        (Some(op), Some(threshold)) => samples
            .iter()
            .map(|s| if op.apply(s.predicted_value, threshold) { 1.0 } else { 0.0 })
            .collect(),
        _ => calibrated
            .iter()
            .map(|&p| if p >= 0.5 { 1.0 } else { 0.0 })
            .collect(),
    };
    let accuracy = predictions
        .iter()
        .zip(samples.iter())
        .filter(|(p, s)| (**p - s.label).abs() < 1e-9)
        .count() as f64
        / n as f64;

    let brier_score = calibrated
        .iter()
        .zip(samples.iter())
        .map(|(p, s)| (p - s.label).powi(2))
        .sum::<f64>()
        / n as f64;

    // ECE = Σ (n_b / N) · |calibrated_b − empirical_b| over non-empty bins, where
    // empirical_b is the unweighted label mean in the bin.
    let mut ece = 0.0;
    for (b, bin) in mapping.iter().enumerate() {
        let member_indices: Vec<usize> = (0..n)
            .filter(|&i| bin_of(samples[i].predicted_value) == b)
            .collect();
        if member_indices.is_empty() {
            continue;
        }
        let bin_empirical = member_indices
            .iter()
            .map(|&i| samples[i].label)
            .sum::<f64>()
            / member_indices.len() as f64;
        ece += (member_indices.len() as f64 / n as f64)
            * (bin.calibrated_prob - bin_empirical).abs();
    }

    (
        mapping,
        CalibrationMetrics {
            accuracy,
            brier_score,
            ece,
            n_samples: n,
        },
    )
}
