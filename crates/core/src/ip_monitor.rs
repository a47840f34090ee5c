//! Detection of changes in the externally visible address.

use std::{collections::VecDeque, future::Future, net::IpAddr, sync::Arc, time::Duration};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::broadcast,
    time::{interval, MissedTickBehavior},
};

use crate::util::TaskGuard;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Looks up the address this device is seen with from the outside.
pub trait AddressProbe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = anyhow::Result<IpAddr>> + Send;
}

/// Asks a "what is my IP" endpoint answering with the bare address.
#[derive(Debug, Clone)]
pub struct HttpAddressProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpAddressProbe {
    pub const DEFAULT_URL: &'static str = "https://api.ipify.org";

    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AddressProbe for HttpAddressProbe {
    async fn probe(&self) -> anyhow::Result<IpAddr> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim()
            .parse()
            .with_context(|| format!("{} returned an invalid address: {body:?}", self.url))
    }
}

/// Replays a scripted sequence of probe results, then keeps returning the
/// last address. `None` entries simulate lookup failures.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressProbe {
    script: Arc<Mutex<(VecDeque<Option<IpAddr>>, Option<IpAddr>)>>,
}

impl StaticAddressProbe {
    pub fn new(initial: IpAddr) -> Self {
        let probe = Self::default();
        probe.push(initial);
        probe
    }

    pub fn push(&self, addr: IpAddr) {
        self.script.lock().0.push_back(Some(addr));
    }

    pub fn fail_next(&self) {
        self.script.lock().0.push_back(None);
    }
}

impl AddressProbe for StaticAddressProbe {
    async fn probe(&self) -> anyhow::Result<IpAddr> {
        let mut script = self.script.lock();
        match script.0.pop_front() {
            Some(Some(addr)) => {
                script.1 = Some(addr);
                Ok(addr)
            }
            Some(None) => anyhow::bail!("scripted lookup failure"),
            None => script.1.context("no address scripted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpChange {
    pub old: IpAddr,
    pub new: IpAddr,
}

#[derive(Debug, Default)]
struct AddressState {
    current: RwLock<Option<IpAddr>>,
}

impl AddressState {
    /// Folds one probe result in. Failures never overwrite the known address
    /// and the first successful lookup is not a change.
    fn observe(&self, result: anyhow::Result<IpAddr>) -> Option<IpChange> {
        let new = match result {
            Ok(addr) => addr,
            Err(error) => {
                tracing::debug!(%error, "Address lookup failed");
                return None;
            }
        };
        let mut current = self.current.write();
        match current.replace(new) {
            Some(old) if old != new => Some(IpChange { old, new }),
            _ => None,
        }
    }
}

/// Periodically probes the public address and broadcasts changes.
#[derive(Debug)]
pub struct IpChangeMonitor {
    interval: Duration,
    state: Arc<AddressState>,
    events: broadcast::Sender<IpChange>,
    task: Option<TaskGuard>,
}

impl Default for IpChangeMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_INTERVAL)
    }
}

impl IpChangeMonitor {
    pub fn new(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            interval,
            state: Arc::new(AddressState::default()),
            events,
            task: None,
        }
    }

    /// Starts probing with `probe`; restarting replaces the previous probe.
    pub fn start<P: AddressProbe>(&mut self, probe: P) {
        let state = self.state.clone();
        let events = self.events.clone();
        let period = self.interval;
        self.task = Some(TaskGuard::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Some(change) = state.observe(probe.probe().await) {
                    tracing::info!(old = %change.old, new = %change.new, "Public address changed");
                    // no subscribers is fine
                    let _ = events.send(change);
                }
            }
        }));
        tracing::debug!(interval_ms = period.as_millis() as u64, "IP change monitor started");
    }

    pub fn stop(&mut self) {
        if self.task.take().is_some() {
            tracing::debug!("IP change monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpChange> {
        self.events.subscribe()
    }

    pub fn current_address(&self) -> Option<IpAddr> {
        *self.state.current.read()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn change_only_on_real_delta() {
        let state = AddressState::default();
        assert_eq!(state.observe(Ok(ip(1, 2, 3, 4))), None);
        assert_eq!(state.observe(Ok(ip(1, 2, 3, 4))), None);
        assert_eq!(state.observe(Err(anyhow::anyhow!("offline"))), None);
        assert_eq!(*state.current.read(), Some(ip(1, 2, 3, 4)));
        assert_eq!(
            state.observe(Ok(ip(5, 6, 7, 8))),
            Some(IpChange {
                old: ip(1, 2, 3, 4),
                new: ip(5, 6, 7, 8)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fires_within_one_probe_interval() {
        let probe = StaticAddressProbe::new(ip(1, 2, 3, 4));
        let mut monitor = IpChangeMonitor::new(Duration::from_secs(10));
        let mut changes = monitor.subscribe();
        monitor.start(probe.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.current_address(), Some(ip(1, 2, 3, 4)));

        probe.fail_next();
        probe.push(ip(5, 6, 7, 8));
        let started = tokio::time::Instant::now();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.new, ip(5, 6, 7, 8));
        // one failed probe, then the change on the following tick
        assert!(started.elapsed() <= Duration::from_secs(20));
        assert_eq!(monitor.current_address(), Some(ip(5, 6, 7, 8)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_probing() {
        let probe = StaticAddressProbe::new(ip(1, 2, 3, 4));
        let mut monitor = IpChangeMonitor::new(Duration::from_secs(10));
        monitor.start(probe.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(monitor.is_running());
        monitor.stop();
        assert!(!monitor.is_running());

        probe.push(ip(5, 6, 7, 8));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.current_address(), Some(ip(1, 2, 3, 4)));
    }
}
