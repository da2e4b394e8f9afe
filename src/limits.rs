//! Series quotas
//!
//! Provides:
//! - Per-tenant series limits with per-tenant overrides
//! - Per-metric-name series counting, checked against the same limiter
//! - Process-wide in-memory series limits

use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Series quota for one tenant. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesQuota {
    /// Maximum in-memory series per tenant
    pub max_series_per_user: u64,
    /// Maximum in-memory series per metric name, per tenant
    pub max_series_per_metric: u64,
}

/// Limits that apply to the whole process rather than a single tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceLimits {
    /// Zero means unlimited
    pub max_in_memory_series: u64,
}

/// Supplies the current instance limits; they may change at runtime.
pub type InstanceLimitsFn = Arc<dyn Fn() -> Option<InstanceLimits> + Send + Sync>;

/// Quota checks consulted before a series is created.
pub trait SeriesLimiter: Send + Sync {
    /// Fails if a tenant holding `series` series may not create another one.
    fn assert_max_series_per_user(&self, tenant_id: &str, series: u64) -> Result<()>;

    /// Fails if `metric` already has `series` series and may not get another one.
    fn assert_max_series_per_metric(&self, tenant_id: &str, metric: &str, series: u64)
        -> Result<()>;
}

/// [`SeriesLimiter`] backed by a default quota and per-tenant overrides.
pub struct Limiter {
    default_quota: SeriesQuota,
    overrides: DashMap<String, SeriesQuota>,
}

impl Limiter {
    pub fn new(default_quota: SeriesQuota) -> Self {
        Self {
            default_quota,
            overrides: DashMap::new(),
        }
    }

    /// Set custom quota for a tenant
    pub fn set_tenant_quota(&self, tenant_id: &str, quota: SeriesQuota) {
        self.overrides.insert(tenant_id.to_string(), quota);
    }

    pub fn quota(&self, tenant_id: &str) -> SeriesQuota {
        self.overrides
            .get(tenant_id)
            .map(|q| q.clone())
            .unwrap_or_else(|| self.default_quota.clone())
    }
}

impl SeriesLimiter for Limiter {
    fn assert_max_series_per_user(&self, tenant_id: &str, series: u64) -> Result<()> {
        let limit = self.quota(tenant_id).max_series_per_user;
        if limit > 0 && series >= limit {
            return Err(Error::MaxSeriesPerUser {
                tenant_id: tenant_id.to_string(),
                limit,
            });
        }
        Ok(())
    }

    fn assert_max_series_per_metric(
        &self,
        tenant_id: &str,
        metric: &str,
        series: u64,
    ) -> Result<()> {
        let limit = self.quota(tenant_id).max_series_per_metric;
        if limit > 0 && series >= limit {
            return Err(Error::MaxSeriesPerMetric {
                tenant_id: tenant_id.to_string(),
                metric: metric.to_string(),
                limit,
            });
        }
        Ok(())
    }
}

/// Number of in-memory series per metric name for one tenant.
pub struct MetricSeriesCounter {
    counts: DashMap<String, u64>,
    limiter: Arc<dyn SeriesLimiter>,
}

impl MetricSeriesCounter {
    pub fn new(limiter: Arc<dyn SeriesLimiter>) -> Self {
        Self {
            counts: DashMap::new(),
            limiter,
        }
    }

    pub fn can_add_series_for(&self, tenant_id: &str, metric: &str) -> Result<()> {
        let current = self.series_for(metric);
        self.limiter
            .assert_max_series_per_metric(tenant_id, metric, current)
    }

    pub fn increase_series_for(&self, metric: &str) {
        *self.counts.entry(metric.to_string()).or_insert(0) += 1;
    }

    pub fn decrease_series_for(&self, metric: &str) {
        // Entries at zero are dropped so churned metric names do not accumulate.
        self.counts.remove_if_mut(metric, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn series_for(&self, metric: &str) -> u64 {
        self.counts.get(metric).map(|c| *c).unwrap_or(0)
    }
}
