//! Integration tests for the resolve→probe→apply→publish pipeline
//!
//! The controller is driven by a scripted prober, so these tests need
//! neither raw sockets nor network access.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use hopwatch::config::{Config, IpFamily};
use hopwatch::error::{MtrError, MtrResult};
use hopwatch::export::export_json;
use hopwatch::lookup::dns::parse_literal;
use hopwatch::lookup::{GeoResolver, HostnameResolver, TargetResolver};
use hopwatch::probe::Prober;
use hopwatch::state::{GeoLocation, ProbeResult, ResponseKind, Snapshot};
use hopwatch::trace::{Controller, Event, EventReceiver, Phase, RunOutcome};

const TARGET: &str = "192.0.2.99";

fn target_ip() -> IpAddr {
    TARGET.parse().unwrap()
}

fn router(ttl: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, ttl))
}

/// What the scripted prober answers for one (round, ttl)
#[derive(Debug, Clone)]
enum Step {
    /// Time Exceeded from the given router
    Hop(IpAddr),
    /// Echo Reply from the target
    Reached,
    Lost,
    /// Fatal receive failure
    Fail,
    /// Cancel the run while this probe is in flight
    Cancel,
}

type Script = Box<dyn FnMut(u64, u8) -> Step + Send>;

struct ScriptedProber {
    max_hops: u8,
    script: Script,
    calls: Arc<Mutex<Vec<(u64, u8, u64)>>>,
    target: Option<IpAddr>,
    open_error: Option<MtrError>,
    closed: Arc<AtomicBool>,
}

impl ScriptedProber {
    fn new(max_hops: u8, script: impl FnMut(u64, u8) -> Step + Send + 'static) -> Self {
        Self {
            max_hops,
            script: Box::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            target: None,
            open_error: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    fn open(&mut self) -> MtrResult<()> {
        match self.open_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_target(&mut self, addr: IpAddr) -> MtrResult<()> {
        self.target = Some(addr);
        Ok(())
    }

    async fn probe(
        &mut self,
        ttl: u8,
        seq: u64,
        cancel: &CancellationToken,
        _deadline: Option<Instant>,
    ) -> MtrResult<ProbeResult> {
        let target = self.target.ok_or(MtrError::TargetNotSet)?;
        let round = (seq - ttl as u64) / self.max_hops as u64;
        self.calls.lock().push((round, ttl, seq));

        let rtt = Duration::from_millis(ttl as u64 * 10);
        let now = Utc::now();
        match (self.script)(round, ttl) {
            Step::Hop(ip) => Ok(ProbeResult::response(
                ttl,
                seq,
                ip,
                rtt,
                ResponseKind::TimeExceeded,
                now,
            )),
            Step::Reached => Ok(ProbeResult::response(
                ttl,
                seq,
                target,
                rtt,
                ResponseKind::EchoReply,
                now,
            )),
            Step::Lost => Ok(ProbeResult::timeout(ttl, seq, now)),
            Step::Fail => Err(MtrError::Receive(io::Error::other("link down"))),
            Step::Cancel => {
                cancel.cancel();
                Ok(ProbeResult::timeout(ttl, seq, now))
            }
        }
    }

    fn close(&mut self) -> MtrResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Accepts IP literals; anything else fails to resolve
struct LiteralResolver;

#[async_trait]
impl TargetResolver for LiteralResolver {
    async fn resolve(&self, host: &str, family: IpFamily) -> MtrResult<IpAddr> {
        parse_literal(host, family).unwrap_or_else(|| {
            Err(MtrError::Resolve {
                host: host.to_string(),
                reason: "NXDOMAIN".to_string(),
            })
        })
    }
}

/// Knows names only for the addresses it was given; records every query
#[derive(Default)]
struct FakeHostnames {
    names: Vec<(IpAddr, String)>,
    queries: Mutex<Vec<IpAddr>>,
}

#[async_trait]
impl HostnameResolver for FakeHostnames {
    async fn reverse(&self, addr: IpAddr, _budget: Duration) -> Option<String> {
        self.queries.lock().push(addr);
        self.names
            .iter()
            .find(|(ip, _)| *ip == addr)
            .map(|(_, name)| name.clone())
    }
}

/// Puts every address in "Testland", city named after the address
#[derive(Default)]
struct FakeGeo {
    queries: Mutex<Vec<IpAddr>>,
}

impl GeoResolver for FakeGeo {
    fn resolve(&self, addr: IpAddr) -> Option<GeoLocation> {
        self.queries.lock().push(addr);
        Some(GeoLocation {
            country: Some("Testland".to_string()),
            city: Some(addr.to_string()),
            source: Some("fake".to_string()),
            ..Default::default()
        })
    }

    fn source(&self) -> &str {
        "fake"
    }

    fn close(&self) {}
}

fn config(count: u64, max_hops: u8) -> Config {
    Config {
        count,
        max_hops,
        interval: Duration::from_millis(1),
        timeout: Duration::from_millis(10),
        ..Config::new(TARGET).unwrap()
    }
}

fn controller(config: Config, prober: ScriptedProber) -> Controller<ScriptedProber> {
    Controller::new(config, prober, Arc::new(LiteralResolver)).unwrap()
}

/// Routers up to `reach - 1`, target at `reach`
fn ladder(reach: u8) -> impl FnMut(u64, u8) -> Step + Send + 'static {
    move |_, ttl| {
        if ttl >= reach {
            Step::Reached
        } else {
            Step::Hop(router(ttl))
        }
    }
}

async fn drain(mut events: EventReceiver) -> Vec<Event> {
    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    all
}

fn assert_counters_sane(snapshot: &Snapshot) {
    for hop in &snapshot.hops {
        assert!(
            hop.stats.sent >= hop.stats.received,
            "hop {} received more than sent",
            hop.ttl
        );
        assert!((0.0..=100.0).contains(&hop.stats.loss));
    }
}

#[tokio::test]
async fn test_destination_reached_mid_path() {
    let prober = ScriptedProber::new(5, ladder(3));
    let calls = prober.calls.clone();
    let controller = controller(config(3, 5), prober);

    let outcome = controller.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.hops.len(), 3);
    for ttl in [1, 2] {
        let hop = snapshot.hop(ttl).unwrap();
        assert_eq!(hop.stats.received, 3);
        assert_eq!(hop.stats.loss, 0.0);
        assert!(!hop.reached);
    }
    let dest = snapshot.hop(3).unwrap();
    assert_eq!(dest.stats.received, 3);
    assert!(dest.reached);
    assert_eq!(dest.ip.as_deref(), Some(TARGET));
    assert!(snapshot.hop(4).is_none());
    assert!(snapshot.hop(5).is_none());

    assert!(calls.lock().iter().all(|&(_, ttl, _)| ttl <= 3));
    assert_eq!(calls.lock().len(), 9);
}

#[tokio::test]
async fn test_single_timeout_counts_as_loss() {
    let script = |round: u64, ttl: u8| {
        if round == 0 && ttl == 2 {
            Step::Lost
        } else {
            ladder(4)(round, ttl)
        }
    };

    let one_round = controller(config(1, 6), ScriptedProber::new(6, script));
    one_round.run(&CancellationToken::new()).await.unwrap();
    let hop = one_round.snapshot().hop(2).cloned().unwrap();
    assert_eq!(hop.stats.sent, 1);
    assert_eq!(hop.stats.received, 0);
    assert_eq!(hop.stats.loss, 100.0);
    assert!(hop.lost);
    assert!(hop.ip.is_none());

    let two_rounds = controller(config(2, 6), ScriptedProber::new(6, script));
    two_rounds.run(&CancellationToken::new()).await.unwrap();
    let hop = two_rounds.snapshot().hop(2).cloned().unwrap();
    assert_eq!(hop.stats.sent, 2);
    assert_eq!(hop.stats.received, 1);
    assert_eq!(hop.stats.loss, 50.0);
    assert!(!hop.lost);
    assert_eq!(hop.ip, Some(router(2).to_string()));
}

#[tokio::test]
async fn test_address_change_triggers_fresh_enrichment() {
    let first = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
    let second = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2));
    let script = move |round: u64, ttl: u8| match ttl {
        1 => Step::Hop(router(1)),
        2 if round == 0 => Step::Hop(first),
        2 => Step::Hop(second),
        _ => Step::Reached,
    };

    let hostnames = Arc::new(FakeHostnames {
        names: vec![
            (first, "first.example".to_string()),
            (router(1), "gw.example".to_string()),
        ],
        ..Default::default()
    });
    let geo = Arc::new(FakeGeo::default());

    // Long enough that round 0 is observed before round 1 starts
    let cfg = Config {
        interval: Duration::from_millis(100),
        ..config(3, 5)
    };
    let controller = controller(cfg, ScriptedProber::new(5, script))
        .with_hostname_resolver(hostnames.clone())
        .with_geo_resolver(geo.clone());

    let mut events = controller.events().unwrap();
    let cancel = CancellationToken::new();
    let run = controller.run(&cancel);
    let observe = async {
        let mut after_first_round = None;
        while let Some(event) = events.recv().await {
            if let Event::HopUpdated { ttl: 3, round: 0 } = event {
                after_first_round = Some(controller.snapshot());
            }
        }
        after_first_round
    };
    let (outcome, after_first_round) = tokio::join!(run, observe);
    assert_eq!(outcome.unwrap(), RunOutcome::Completed);

    // Round 0: the first responder got its name and location
    let hop = after_first_round.unwrap().hop(2).cloned().unwrap();
    assert_eq!(hop.ip, Some(first.to_string()));
    assert_eq!(hop.hostname.as_deref(), Some("first.example"));
    assert_eq!(hop.location.unwrap().city, Some(first.to_string()));

    // Later rounds: the stale name is gone, location follows the new address
    let hop = controller.snapshot().hop(2).cloned().unwrap();
    assert_eq!(hop.ip, Some(second.to_string()));
    assert_eq!(hop.hostname, None);
    assert_eq!(hop.location.unwrap().city, Some(second.to_string()));

    // One lookup per distinct address per hop
    let queries = hostnames.queries.lock().clone();
    assert_eq!(queries.iter().filter(|&&ip| ip == first).count(), 1);
    assert_eq!(queries.iter().filter(|&&ip| ip == second).count(), 1);
    assert_eq!(queries.iter().filter(|&&ip| ip == router(1)).count(), 1);
    assert_eq!(geo.queries.lock().iter().filter(|&&ip| ip == second).count(), 1);

    let gw = controller.snapshot().hop(1).cloned().unwrap();
    assert_eq!(gw.hostname.as_deref(), Some("gw.example"));
}

#[tokio::test]
async fn test_cancel_mid_round_keeps_partial_results() {
    let script = |round: u64, ttl: u8| {
        if round == 1 && ttl == 3 {
            Step::Cancel
        } else {
            ladder(4)(round, ttl)
        }
    };
    let prober = ScriptedProber::new(5, script);
    let calls = prober.calls.clone();
    let closed = prober.closed.clone();
    let controller = controller(config(3, 5), prober);
    let events = controller.events().unwrap();

    let outcome = controller.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(controller.phase(), Phase::Cancelled);
    assert!(closed.load(Ordering::SeqCst));

    let events = drain(events).await;
    assert!(!events.iter().any(|e| matches!(e, Event::Done)));
    match events.last() {
        Some(Event::Error { cause }) => assert!(cause.is_cancelled()),
        other => panic!("expected cancellation event, got {other:?}"),
    }

    // Round 0 complete, round 1 applied up to TTL 2; the cut-short probe is discarded
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.hop(1).unwrap().stats.sent, 2);
    assert_eq!(snapshot.hop(2).unwrap().stats.sent, 2);
    assert_eq!(snapshot.hop(3).unwrap().stats.sent, 1);
    assert_eq!(snapshot.hop(3).unwrap().stats.loss, 0.0);
    assert_eq!(snapshot.hop(4).unwrap().stats.sent, 1);
    assert_eq!(calls.lock().len(), 7);
}

#[tokio::test]
async fn test_cancel_during_interval_wait() {
    let controller = controller(
        Config {
            count: 0,
            interval: Duration::from_secs(30),
            ..config(0, 4)
        },
        ScriptedProber::new(4, ladder(2)),
    );
    let mut events = controller.events().unwrap();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let observe = async move {
        while let Some(event) = events.recv().await {
            if let Event::RoundCompleted { round: 0 } = event {
                trigger.cancel();
            }
        }
    };

    let run = tokio::time::timeout(Duration::from_secs(5), controller.run(&cancel));
    let (outcome, _) = tokio::join!(run, observe);
    assert_eq!(
        outcome.expect("run did not stop on cancellation").unwrap(),
        RunOutcome::Cancelled
    );
    assert_eq!(controller.snapshot().hop(1).unwrap().stats.sent, 1);
}

#[tokio::test]
async fn test_socket_denied_fails_before_any_event() {
    let mut prober = ScriptedProber::new(5, |_, _| panic!("must not probe"));
    prober.open_error = Some(MtrError::from_socket_creation(io::Error::from(
        io::ErrorKind::PermissionDenied,
    )));
    let controller = controller(config(3, 5), prober);
    let events = controller.events().unwrap();

    let err = controller.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MtrError::InsufficientPermissions { .. }));
    assert!(err.is_setup());
    assert_eq!(controller.phase(), Phase::Error);

    assert!(drain(events).await.is_empty());
    assert!(controller.snapshot().hops.is_empty());
}

#[tokio::test]
async fn test_unresolvable_target_is_fatal() {
    let cfg = Config {
        target: "unresolvable.invalid".to_string(),
        ..config(3, 5)
    };
    let controller = controller(cfg, ScriptedProber::new(5, |_, _| panic!("must not probe")));
    let events = controller.events().unwrap();

    let err = controller.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MtrError::Resolve { .. }));

    let events = drain(events).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        Event::Error { cause } if matches!(**cause, MtrError::Resolve { .. })
    ));
    assert_eq!(controller.snapshot().target_ip, "");
}

#[tokio::test]
async fn test_transport_failure_aborts_run() {
    let script = |_, ttl: u8| {
        if ttl == 2 {
            Step::Fail
        } else {
            Step::Hop(router(ttl))
        }
    };
    let prober = ScriptedProber::new(5, script);
    let closed = prober.closed.clone();
    let controller = controller(config(3, 5), prober);
    let events = controller.events().unwrap();

    let err = controller.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MtrError::Receive(_)));
    assert!(!err.is_setup());
    assert!(closed.load(Ordering::SeqCst));

    let events = drain(events).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Event::HopUpdated { ttl: 1, round: 0 }));
    assert!(matches!(
        &events[1],
        Event::Error { cause } if matches!(**cause, MtrError::Receive(_))
    ));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.hops.len(), 1);
}

#[tokio::test]
async fn test_event_stream_order() {
    let controller = controller(config(2, 5), ScriptedProber::new(5, ladder(3)));
    let events = controller.events().unwrap();
    assert!(controller.events().is_none());

    controller.run(&CancellationToken::new()).await.unwrap();
    let events = drain(events).await;

    let mut expected = Vec::new();
    for round in 0..2 {
        for ttl in 1..=3 {
            expected.push(format!("hop {round}/{ttl}"));
        }
        expected.push(format!("round {round}"));
    }
    expected.push("done".to_string());

    let got: Vec<String> = events
        .iter()
        .map(|e| match e {
            Event::HopUpdated { ttl, round } => format!("hop {round}/{ttl}"),
            Event::RoundCompleted { round } => format!("round {round}"),
            Event::Done => "done".to_string(),
            Event::Error { cause } => format!("error {cause}"),
        })
        .collect();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_sweep_invariants_under_mixed_responses() {
    let max_hops = 8;
    // Deterministic mix of losses, routers and an occasionally closer target
    let script = |round: u64, ttl: u8| {
        let reach = 5 + (round % 3) as u8;
        if (round * 7 + ttl as u64) % 5 == 0 {
            Step::Lost
        } else if ttl >= reach {
            Step::Reached
        } else {
            Step::Hop(router(ttl))
        }
    };
    let prober = ScriptedProber::new(max_hops, script);
    let calls = prober.calls.clone();
    let controller = controller(config(12, max_hops), prober);
    controller.run(&CancellationToken::new()).await.unwrap();

    let snapshot = controller.snapshot();
    assert_counters_sane(&snapshot);

    let calls = calls.lock().clone();
    let seqs: HashSet<u64> = calls.iter().map(|&(_, _, seq)| seq).collect();
    assert_eq!(seqs.len(), calls.len(), "sequence reused");

    for round in 0..12u64 {
        let ttls: Vec<u8> = calls
            .iter()
            .filter(|&&(r, _, _)| r == round)
            .map(|&(_, ttl, _)| ttl)
            .collect();
        let expected: Vec<u8> = (1..=ttls.len() as u8).collect();
        assert_eq!(ttls, expected, "round {round} not swept in TTL order");

        // Nothing probed past the first echo reply
        let last = *ttls.last().unwrap();
        let reach = 5 + (round % 3) as u8;
        let lost_at_reach = (round * 7 + reach as u64) % 5 == 0;
        if !lost_at_reach {
            assert_eq!(last, reach.min(max_hops));
        }
    }

    let ttls: Vec<u8> = snapshot.hops.iter().map(|h| h.ttl).collect();
    let mut sorted = ttls.clone();
    sorted.sort_unstable();
    assert_eq!(ttls, sorted);
}

#[tokio::test]
async fn test_snapshots_consistent_while_running() {
    let controller = Arc::new(controller(config(5, 6), ScriptedProber::new(6, ladder(5))));
    let mut events = controller.events().unwrap();

    let runner = controller.clone();
    let handle = tokio::spawn(async move { runner.run(&CancellationToken::new()).await });

    let mut seen = 0;
    while let Some(event) = events.recv().await {
        if let Event::HopUpdated { ttl, .. } = event {
            let snapshot = controller.snapshot();
            assert!(snapshot.hop(ttl).is_some());
            assert_counters_sane(&snapshot);
            seen += 1;
        }
    }
    assert_eq!(seen, 25);
    assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Completed);
}

#[tokio::test]
async fn test_dns_disabled_skips_hostname_lookups() {
    let hostnames = Arc::new(FakeHostnames::default());
    let controller = controller(
        Config {
            dns_enabled: false,
            ..config(2, 4)
        },
        ScriptedProber::new(4, ladder(3)),
    )
    .with_hostname_resolver(hostnames.clone());

    controller.run(&CancellationToken::new()).await.unwrap();
    assert!(hostnames.queries.lock().is_empty());
    assert!(controller.snapshot().hops.iter().all(|h| h.hostname.is_none()));
}

#[tokio::test]
async fn test_result_document() {
    let controller = controller(config(2, 5), ScriptedProber::new(5, ladder(2)));
    controller.run(&CancellationToken::new()).await.unwrap();

    let mut buf = Vec::new();
    export_json(&controller.snapshot(), &mut buf).unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&buf).unwrap();

    assert_eq!(doc["schema_version"], 1);
    assert_eq!(doc["target"], TARGET);
    assert_eq!(doc["target_ip"], target_ip().to_string());
    assert_eq!(doc["protocol"], "icmp");
    assert_eq!(doc["max_hops"], 5);
    assert_eq!(doc["count"], 2);

    let hops = doc["hops"].as_array().unwrap();
    assert_eq!(hops.len(), 2);
    assert_eq!(hops[0]["ttl"], 1);
    assert_eq!(hops[0]["stats"]["last_ms"], 10);
    assert_eq!(hops[0]["stats"]["last"], "10ms");
    assert_eq!(hops[0]["stats"]["history_ms"], serde_json::json!([10, 10]));
    assert_eq!(hops[1]["ip"], TARGET);
    assert_eq!(hops[1]["stats"]["avg_ms"], 20);
}
