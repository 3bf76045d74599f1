//! Driver tunables.
//!
//! Defaults match the kernel module's parameters. [`DriverConfig::from_env`]
//! lets `RKNPU_*` environment variables override them the way module
//! parameters would:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RKNPU_POWER_PUT_DELAY_MS` | [`DriverConfig::power_put_delay`] |
//! | `RKNPU_LOAD_INTERVAL_MS` | [`DriverConfig::load_interval`] |
//! | `RKNPU_BYPASS_IRQ_HANDLER` | [`DriverConfig::bypass_irq_handler`] |
//! | `RKNPU_BYPASS_SOFT_RESET` | [`DriverConfig::bypass_soft_reset`] |
//! | `RKNPU_WAIT_RETRIES` | [`DriverConfig::wait_retries`] |
//! | `RKNPU_GUARD_MAX_PAGES` | [`DriverConfig::guard_max_pages`] |
//! | `RKNPU_GUARD_BELOW_PAGES` | [`DriverConfig::guard_below_pages`] |
//! | `RKNPU_IOMMU` | [`DriverConfig::iommu_enabled`] |

use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for a [`Device`](crate::Device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Grace period before the last released power reference turns the NPU off.
    pub power_put_delay: Duration,
    /// Load-sampling window.
    pub load_interval: Duration,
    /// Ignore hardware interrupts entirely.
    pub bypass_irq_handler: bool,
    /// Skip the soft reset after a timed-out job.
    pub bypass_soft_reset: bool,
    /// Wait iterations before a blocking submit gives up.
    pub wait_retries: u32,
    /// Upper bound on guard pages mapped per submission.
    pub guard_max_pages: usize,
    /// Guard pages mapped directly below the lowest buffer.
    pub guard_below_pages: u64,
    /// Use the IOMMU domain when the platform provides one.
    pub iommu_enabled: bool,
    /// Pause between main runtime suspend and power-domain suspend when the
    /// IOMMU is in use.
    pub iommu_settle: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            power_put_delay: Duration::from_millis(3000),
            load_interval: Duration::from_secs(1),
            bypass_irq_handler: false,
            bypass_soft_reset: false,
            wait_retries: 3,
            guard_max_pages: 2048,
            guard_below_pages: 16,
            iommu_enabled: true,
            iommu_settle: Duration::from_millis(20),
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by `RKNPU_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "RKNPU_POWER_PUT_DELAY_MS") {
            cfg.power_put_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RKNPU_LOAD_INTERVAL_MS") {
            cfg.load_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(v) = parse_flag(&lookup, "RKNPU_BYPASS_IRQ_HANDLER") {
            cfg.bypass_irq_handler = v;
        }
        if let Some(v) = parse_flag(&lookup, "RKNPU_BYPASS_SOFT_RESET") {
            cfg.bypass_soft_reset = v;
        }
        if let Some(n) = parse_var::<u32>(&lookup, "RKNPU_WAIT_RETRIES") {
            cfg.wait_retries = n.max(1);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "RKNPU_GUARD_MAX_PAGES") {
            cfg.guard_max_pages = n;
        }
        if let Some(n) = parse_var::<u64>(&lookup, "RKNPU_GUARD_BELOW_PAGES") {
            cfg.guard_below_pages = n;
        }
        if let Some(v) = parse_flag(&lookup, "RKNPU_IOMMU") {
            cfg.iommu_enabled = v;
        }
        cfg
    }

    /// Set the power-off grace period.
    #[must_use]
    pub fn with_power_put_delay(mut self, delay: Duration) -> Self {
        self.power_put_delay = delay;
        self
    }

    /// Set the load-sampling window.
    #[must_use]
    pub fn with_load_interval(mut self, interval: Duration) -> Self {
        self.load_interval = interval;
        self
    }

    /// Set the IOMMU settle pause.
    #[must_use]
    pub fn with_iommu_settle(mut self, settle: Duration) -> Self {
        self.iommu_settle = settle;
        self
    }

    /// Enable or disable IOMMU use.
    #[must_use]
    pub fn with_iommu(mut self, enabled: bool) -> Self {
        self.iommu_enabled = enabled;
        self
    }

    /// Set the per-submission guard-page cap.
    #[must_use]
    pub fn with_guard_max_pages(mut self, pages: usize) -> Self {
        self.guard_max_pages = pages;
        self
    }

    /// Skip soft resets after timeouts.
    #[must_use]
    pub fn with_bypass_soft_reset(mut self, bypass: bool) -> Self {
        self.bypass_soft_reset = bypass;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("ignoring {key}={raw:?}: expected 0/1");
            None
        }
    }
}
