//! Series admission
//!
//! [`SeriesAdmission`] is the [`SeriesLifecycleCallback`] a tenant installs
//! on its storage engine. Before a series is created it checks, in order:
//! 1. The process-wide in-memory series limit
//! 2. The tenant's series limit
//! 3. That the series has a metric name
//! 4. The per-metric-name series limit
//!
//! The first failing check rejects the write.

use crate::labels::Labels;
use crate::limits::{InstanceLimitsFn, MetricSeriesCounter, SeriesLimiter};
use crate::storage::SeriesLifecycleCallback;
use crate::{Error, Result};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Quota checks and series accounting for one tenant.
pub struct SeriesAdmission {
    tenant_id: String,
    limiter: Option<Arc<dyn SeriesLimiter>>,
    metric_counter: Option<MetricSeriesCounter>,
    /// Shared by every tenant in the process.
    instance_series: Arc<AtomicI64>,
    tenant_series: AtomicI64,
    instance_limits: Option<InstanceLimitsFn>,
}

impl SeriesAdmission {
    pub fn new(
        tenant_id: impl Into<String>,
        limiter: Option<Arc<dyn SeriesLimiter>>,
        instance_series: Arc<AtomicI64>,
        instance_limits: Option<InstanceLimitsFn>,
    ) -> Self {
        let metric_counter = limiter.clone().map(MetricSeriesCounter::new);
        Self {
            tenant_id: tenant_id.into(),
            limiter,
            metric_counter,
            instance_series,
            tenant_series: AtomicI64::new(0),
            instance_limits,
        }
    }

    pub fn tenant_series(&self) -> u64 {
        self.tenant_series.load(Ordering::Acquire).max(0) as u64
    }

    pub fn instance_series(&self) -> u64 {
        self.instance_series.load(Ordering::Acquire).max(0) as u64
    }

    pub fn series_for_metric(&self, metric: &str) -> u64 {
        self.metric_counter
            .as_ref()
            .map(|c| c.series_for(metric))
            .unwrap_or(0)
    }
}

impl SeriesLifecycleCallback for SeriesAdmission {
    fn pre_creation(&self, metric: &Labels) -> Result<()> {
        if let Some(limits) = self.instance_limits.as_ref().and_then(|f| f()) {
            if limits.max_in_memory_series > 0
                && self.instance_series() >= limits.max_in_memory_series
            {
                return Err(Error::MaxInMemorySeriesReached {
                    limit: limits.max_in_memory_series,
                });
            }
        }

        let (Some(limiter), Some(counter)) = (&self.limiter, &self.metric_counter) else {
            return Ok(());
        };

        limiter.assert_max_series_per_user(&self.tenant_id, self.tenant_series())?;

        let name = metric.metric_name()?;
        counter.can_add_series_for(&self.tenant_id, name)
    }

    fn post_creation(&self, metric: &Labels) {
        self.instance_series.fetch_add(1, Ordering::AcqRel);
        self.tenant_series.fetch_add(1, Ordering::AcqRel);

        // Admission already rejected series without a name.
        if let (Some(counter), Ok(name)) = (&self.metric_counter, metric.metric_name()) {
            counter.increase_series_for(name);
        }
    }

    fn post_deletion(&self, metrics: &[Labels]) {
        let n = metrics.len() as i64;
        self.instance_series.fetch_sub(n, Ordering::AcqRel);
        self.tenant_series.fetch_sub(n, Ordering::AcqRel);

        if let Some(counter) = &self.metric_counter {
            for metric in metrics {
                if let Ok(name) = metric.metric_name() {
                    counter.decrease_series_for(name);
                }
            }
        }
    }
}
