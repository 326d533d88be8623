//! Coalesced dependency health.
//!
//! Probing the database and the mail relay is not free, and a liveness
//! endpoint gets hammered by load balancers. [`HealthCache`] keeps the last
//! snapshot for a short interval and lets exactly one caller re-probe when it
//! goes stale.

use anyhow::Result;
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};

use super::store::Mailer;

pub const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Down,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Down => "DOWN",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub statuses: BTreeMap<String, HealthStatus>,
    pub cached_at: Instant,
}

impl HealthSnapshot {
    fn is_fresh(&self, interval: Duration) -> bool {
        self.cached_at.elapsed() < interval
    }

    #[must_use]
    pub fn as_strings(&self) -> BTreeMap<String, String> {
        self.statuses
            .iter()
            .map(|(name, status)| (name.clone(), status.as_str().to_string()))
            .collect()
    }
}

/// Mail relay reachability, through the configured [`Mailer`].
pub struct MailerProbe {
    mailer: Arc<dyn Mailer>,
}

impl MailerProbe {
    #[must_use]
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Probe for MailerProbe {
    fn name(&self) -> &str {
        "mail"
    }

    async fn ping(&self) -> Result<()> {
        self.mailer.ping().await
    }
}

pub struct HealthCache {
    probes: Vec<Arc<dyn Probe>>,
    interval: Duration,
    probe_timeout: Duration,
    snapshot: RwLock<Option<HealthSnapshot>>,
}

impl HealthCache {
    #[must_use]
    pub fn new(probes: Vec<Arc<dyn Probe>>) -> Self {
        Self {
            probes,
            interval: DEFAULT_COALESCE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            snapshot: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Dependency name to `"OK"`/`"DOWN"`.
    pub async fn check(&self) -> BTreeMap<String, String> {
        self.snapshot().await.as_strings()
    }

    /// A copy of the current snapshot, re-probing at most once per interval.
    pub async fn snapshot(&self) -> HealthSnapshot {
        {
            let cached = self.snapshot.read().await;
            if let Some(snapshot) = cached.as_ref().filter(|s| s.is_fresh(self.interval)) {
                debug!("returning cached health snapshot");
                return snapshot.clone();
            }
        }

        let mut cached = self.snapshot.write().await;
        // Another caller may have refreshed while we waited for the write lock.
        if let Some(snapshot) = cached.as_ref().filter(|s| s.is_fresh(self.interval)) {
            return snapshot.clone();
        }

        let snapshot = HealthSnapshot {
            statuses: self.probe_all().await,
            cached_at: Instant::now(),
        };
        *cached = Some(snapshot.clone());
        snapshot
    }

    async fn probe_all(&self) -> BTreeMap<String, HealthStatus> {
        let mut statuses = BTreeMap::new();
        for probe in &self.probes {
            let status = match tokio::time::timeout(self.probe_timeout, probe.ping()).await {
                Ok(Ok(())) => HealthStatus::Ok,
                Ok(Err(err)) => {
                    warn!(dependency = probe.name(), error = %err, "health probe failed");
                    HealthStatus::Down
                }
                Err(_) => {
                    warn!(dependency = probe.name(), "health probe timed out");
                    HealthStatus::Down
                }
            };
            statuses.insert(probe.name().to_string(), status);
        }
        statuses
    }
}
