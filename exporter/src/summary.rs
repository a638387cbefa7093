//! Summary metric vector
//!
//! The `prometheus` crate ships counters, gauges and histograms but no
//! summaries, so this module provides a labeled summary collector. Each child
//! keeps a lifetime `_sum` and `_count` and computes quantiles over a sliding
//! window of recent observations (bounded by age and by sample count).

use parking_lot::{Mutex, RwLock};
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Quantiles reported by default
pub const DEFAULT_QUANTILES: &[f64] = &[0.5, 0.9, 0.99];
/// Observations older than this drop out of the quantile window
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);
/// Maximum observations kept per label set
pub const DEFAULT_MAX_SAMPLES: usize = 2048;

/// Options for a [`SummaryVec`]
#[derive(Debug, Clone)]
pub struct SummaryOpts {
    pub namespace: String,
    pub name: String,
    pub help: String,
    pub quantiles: Vec<f64>,
    pub max_age: Duration,
    pub max_samples: usize,
}

impl SummaryOpts {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
            help: help.into(),
            quantiles: DEFAULT_QUANTILES.to_vec(),
            max_age: DEFAULT_MAX_AGE,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    fn fq_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Default)]
struct SummaryState {
    count: u64,
    sum: f64,
    window: VecDeque<(Instant, f64)>,
}

impl SummaryState {
    fn observe(&mut self, value: f64, now: Instant, max_samples: usize) {
        self.count += 1;
        self.sum += value;
        self.window.push_back((now, value));
        while self.window.len() > max_samples {
            self.window.pop_front();
        }
    }

    fn prune(&mut self, now: Instant, max_age: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > max_age {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn quantiles(&self, qs: &[f64]) -> Vec<(f64, f64)> {
        let mut sorted: Vec<f64> = self.window.iter().map(|(_, v)| *v).collect();
        sorted.sort_by(f64::total_cmp);
        qs.iter().map(|&q| (q, rank(&sorted, q))).collect()
    }
}

/// Nearest-rank quantile; NaN for an empty window
fn rank(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = ((q * sorted.len() as f64).ceil() as usize).saturating_sub(1);
    sorted[idx.min(sorted.len() - 1)]
}

struct SummaryVecCore {
    desc: Desc,
    opts: SummaryOpts,
    children: RwLock<HashMap<Vec<String>, Arc<Mutex<SummaryState>>>>,
}

/// Labeled summary; cheap to clone, clones share state
#[derive(Clone)]
pub struct SummaryVec {
    core: Arc<SummaryVecCore>,
}

impl SummaryVec {
    /// Create a summary vector partitioned by `label_names`
    pub fn new(opts: SummaryOpts, label_names: &[&str]) -> prometheus::Result<Self> {
        let desc = Desc::new(
            opts.fq_name(),
            opts.help.clone(),
            label_names.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
        )?;

        Ok(Self {
            core: Arc::new(SummaryVecCore {
                desc,
                opts,
                children: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Record an observation for one label set
    ///
    /// # Errors
    /// Fails when the number of values differs from the number of label names.
    pub fn observe(&self, label_values: &[&str], value: f64) -> prometheus::Result<()> {
        let expect = self.core.desc.variable_labels.len();
        if label_values.len() != expect {
            return Err(prometheus::Error::InconsistentCardinality {
                expect,
                got: label_values.len(),
            });
        }

        let child = self.child(label_values);
        child
            .lock()
            .observe(value, Instant::now(), self.core.opts.max_samples);
        Ok(())
    }

    fn child(&self, label_values: &[&str]) -> Arc<Mutex<SummaryState>> {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        if let Some(child) = self.core.children.read().get(&key) {
            return Arc::clone(child);
        }
        Arc::clone(self.core.children.write().entry(key).or_default())
    }

    /// Lifetime observation count for one label set
    pub fn sample_count(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        self.core
            .children
            .read()
            .get(&key)
            .map_or(0, |c| c.lock().count)
    }

    fn metric(&self, values: &[String], state: &mut SummaryState, now: Instant) -> proto::Metric {
        state.prune(now, self.core.opts.max_age);

        let mut labels: Vec<proto::LabelPair> = self
            .core
            .desc
            .variable_labels
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                pair
            })
            .collect();
        labels.sort_by(|a, b| a.get_name().cmp(b.get_name()));

        let quantiles: Vec<proto::Quantile> = state
            .quantiles(&self.core.opts.quantiles)
            .into_iter()
            .map(|(q, v)| {
                let mut quantile = proto::Quantile::default();
                quantile.set_quantile(q);
                quantile.set_value(v);
                quantile
            })
            .collect();

        let mut summary = proto::Summary::default();
        summary.set_sample_count(state.count);
        summary.set_sample_sum(state.sum);
        summary.set_quantile(quantiles.into());

        let mut metric = proto::Metric::default();
        metric.set_label(labels.into());
        metric.set_summary(summary);
        metric
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let now = Instant::now();
        let children = self.core.children.read();

        let mut entries: Vec<(&Vec<String>, &Arc<Mutex<SummaryState>>)> =
            children.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let metrics: Vec<proto::Metric> = entries
            .into_iter()
            .map(|(values, state)| self.metric(values, &mut state.lock(), now))
            .collect();

        let mut family = proto::MetricFamily::default();
        family.set_name(self.core.desc.fq_name.clone());
        family.set_help(self.core.desc.help.clone());
        family.set_field_type(proto::MetricType::SUMMARY);
        family.set_metric(metrics.into());
        vec![family]
    }
}
