//! Round/TTL scheduler.
//!
//! One [`Controller`] drives one run: resolve the target, then sweep TTL
//! 1..=max_hops once per round with a single probe in flight, folding every
//! result into the hop registry.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::events::{Event, EventQueue, EventReceiver};
use crate::config::Config;
use crate::error::{MtrError, MtrResult};
use crate::lookup::{GeoResolver, HostnameResolver, NoopResolver, TargetResolver};
use crate::probe::{AnyProber, Prober};
use crate::state::{Hop, ProbeResult, SCHEMA_VERSION, Snapshot, sequence_for};

/// Time allowed for one reverse lookup
pub const HOSTNAME_BUDGET: Duration = Duration::from_millis(500);

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Resolving,
    Probing { round: u64, ttl: u8 },
    /// Waiting after `round` before starting the next one
    RoundInterval { round: u64 },
    Done,
    Error,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Cancelled)
    }
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every configured round finished
    Completed,
    /// The cancellation token fired first
    Cancelled,
}

/// Shared mutable run state, always behind one lock
#[derive(Debug, Default)]
struct Registry {
    hops: BTreeMap<u8, Hop>,
    target_ip: Option<IpAddr>,
}

pub struct Controller<P: Prober = AnyProber> {
    config: Config,
    prober: tokio::sync::Mutex<P>,
    registry: RwLock<Registry>,
    events: EventQueue,
    phase: RwLock<Phase>,
    started: AtomicBool,
    target_resolver: Arc<dyn TargetResolver>,
    hostname_resolver: Option<Arc<dyn HostnameResolver>>,
    geo_resolver: Arc<dyn GeoResolver>,
}

impl<P: Prober> Controller<P> {
    /// Validates `config`; the prober is opened by [`Controller::run`].
    pub fn new(
        config: Config,
        prober: P,
        target_resolver: Arc<dyn TargetResolver>,
    ) -> MtrResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            prober: tokio::sync::Mutex::new(prober),
            registry: RwLock::new(Registry::default()),
            events: EventQueue::new(),
            phase: RwLock::new(Phase::Idle),
            started: AtomicBool::new(false),
            target_resolver,
            hostname_resolver: None,
            geo_resolver: Arc::new(NoopResolver),
        })
    }

    /// Resolve responder hostnames (only when `dns_enabled`)
    pub fn with_hostname_resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.hostname_resolver = Some(resolver);
        self
    }

    pub fn with_geo_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.geo_resolver = resolver;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The event stream. Only the first caller gets it.
    pub fn events(&self) -> Option<EventReceiver> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }

    /// Resolved target, once resolution succeeded
    pub fn target_ip(&self) -> Option<IpAddr> {
        self.registry.read().target_ip
    }

    /// Copy of everything measured so far, hops ordered by TTL
    pub fn snapshot(&self) -> Snapshot {
        let registry = self.registry.read();
        Snapshot {
            schema_version: SCHEMA_VERSION,
            target: self.config.target.clone(),
            target_ip: registry
                .target_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            protocol: self.config.protocol.as_str().to_string(),
            max_hops: self.config.max_hops,
            count: self.config.count,
            hops: registry.hops.values().map(Hop::to_snapshot).collect(),
        }
    }

    /// Run to completion, cancellation, or the first fatal error.
    ///
    /// A controller runs once. If the prober cannot be opened the run fails
    /// before anything is published; every later failure publishes one
    /// `Error` event. The event stream is closed when this returns.
    ///
    /// On cancellation the probe in flight is discarded, not applied: the hop
    /// at that TTL keeps its previous counters and is not marked lost. Every
    /// result applied before it stays in the snapshot.
    pub async fn run(&self, cancel: &CancellationToken) -> MtrResult<RunOutcome> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MtrError::Internal("controller already ran".to_string()));
        }

        let mut prober = self.prober.lock().await;
        if let Err(e) = prober.open() {
            debug!(error = %e, "prober setup failed");
            self.set_phase(Phase::Error);
            self.events.close();
            return Err(e);
        }

        let outcome = self.sweep(&mut *prober, cancel).await;
        if let Err(e) = prober.close() {
            warn!(error = %e, "failed to close prober");
        }

        match &outcome {
            Ok(RunOutcome::Completed) => {
                self.set_phase(Phase::Done);
                self.events.finish(Event::Done);
            }
            Ok(RunOutcome::Cancelled) => {
                self.set_phase(Phase::Cancelled);
                self.events.finish(Event::Error {
                    cause: Arc::new(MtrError::Cancelled),
                });
            }
            Err(e) => {
                self.set_phase(Phase::Error);
                self.events.finish(Event::Error {
                    cause: Arc::new(e.clone()),
                });
            }
        }
        debug!(outcome = ?outcome, dropped_events = self.events.dropped(), "run finished");
        outcome
    }

    async fn sweep(&self, prober: &mut P, cancel: &CancellationToken) -> MtrResult<RunOutcome> {
        self.set_phase(Phase::Resolving);
        let resolving = self.target_resolver.resolve(&self.config.target, self.config.family);
        let target = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
            resolved = resolving => resolved?,
        };
        self.registry.write().target_ip = Some(target);
        prober.set_target(target)?;
        debug!(
            target = %self.config.target,
            %target,
            protocol = %self.config.protocol,
            "target resolved"
        );

        let max_hops = self.config.max_hops;
        let mut round: u64 = 0;
        while self.config.is_unbounded() || round < self.config.count {
            for ttl in 1..=max_hops {
                if cancel.is_cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                self.set_phase(Phase::Probing { round, ttl });

                let seq = sequence_for(round, ttl, max_hops);
                let result = prober.probe(ttl, seq, cancel, None).await?;
                // A probe cut short by cancellation reports a loss that never happened
                if cancel.is_cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }

                let reached = result.kind.reaches_destination();
                self.apply_result(&result);
                self.events.publish(Event::HopUpdated { ttl, round });

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = self.enrich(ttl) => {}
                }

                if reached {
                    trace!(round, ttl, "destination reached");
                    break;
                }
            }

            self.events.publish(Event::RoundCompleted { round });
            debug!(round, "round completed");
            round += 1;

            if self.config.is_unbounded() || round < self.config.count {
                self.set_phase(Phase::RoundInterval { round: round - 1 });
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Fold one probe result into its hop under the writer lock
    fn apply_result(&self, result: &ProbeResult) {
        let mut registry = self.registry.write();
        let hop = registry
            .hops
            .entry(result.ttl)
            .or_insert_with(|| Hop::new(result.ttl));
        if hop.apply(result) {
            debug!(ttl = result.ttl, responder = ?result.responder, "responder changed");
        }
        trace!(
            ttl = result.ttl,
            seq = result.seq,
            kind = ?result.kind,
            sent = hop.stats.sent,
            received = hop.stats.received,
            "result applied"
        );
    }

    /// Resolve hostname and location for the hop's current responder,
    /// once per distinct address. Runs outside the registry lock.
    async fn enrich(&self, ttl: u8) {
        let (hostname_addr, location_addr) = {
            let mut registry = self.registry.write();
            let Some(hop) = registry.hops.get_mut(&ttl) else {
                return;
            };
            let hostname_addr = if self.config.dns_enabled && self.hostname_resolver.is_some() {
                hop.claim_hostname_lookup()
            } else {
                None
            };
            (hostname_addr, hop.claim_location_lookup())
        };

        let hostname = async {
            match (hostname_addr, &self.hostname_resolver) {
                (Some(addr), Some(resolver)) => {
                    Some((addr, resolver.reverse(addr, HOSTNAME_BUDGET).await))
                }
                _ => None,
            }
        };
        let location = async {
            location_addr.map(|addr| (addr, self.geo_resolver.resolve(addr)))
        };
        let (hostname, location) = futures::join!(hostname, location);

        if hostname.is_none() && location.is_none() {
            return;
        }
        let mut registry = self.registry.write();
        let Some(hop) = registry.hops.get_mut(&ttl) else {
            return;
        };
        if let Some((addr, name)) = hostname {
            trace!(ttl, %addr, hostname = ?name, "hostname resolved");
            hop.store_hostname(addr, name);
        }
        if let Some((addr, geo)) = location {
            hop.store_location(addr, geo);
        }
    }
}
