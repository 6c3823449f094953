//! Run with `cargo test`.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use memograph::{
    BuildConfiguration, BuildOptions, CONFIGURATION_COLLECTION, ConfigurationBuilder,
    ConfigurationCollectionResolver, ConfigurationCollectionValue, ConfigurationKey, EvalContext,
    EvalError, Evaluator, ExternalId, FunctionKind, Lookup, MemoTable, NodeKey, NodeValue,
    Package, PackageLabel, PackageProvider,
};
use parking_lot::{Mutex, RwLock};
use quickcheck_macros::quickcheck;

const SQUARE: FunctionKind = FunctionKind::new("square");
const READER: FunctionKind = FunctionKind::new("reader");
const DOUBLED: FunctionKind = FunctionKind::new("doubled");
const CELL: FunctionKind = FunctionKind::new("cell");
const LOOP: FunctionKind = FunctionKind::new("loop");
const PING: FunctionKind = FunctionKind::new("ping");
const PONG: FunctionKind = FunctionKind::new("pong");

/// Build an evaluator whose `square` function counts its invocations.
fn square_evaluator() -> (Evaluator, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut evaluator = Evaluator::new();
    evaluator.register_fn(SQUARE, move |key: &NodeKey, _: &EvalContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        let n: &u64 = key.payload().unwrap();
        Ok(Arc::new(n * n))
    });
    (evaluator, calls)
}

#[test]
fn memoization() {
    let (evaluator, calls) = square_evaluator();
    let key = NodeKey::new(SQUARE, 7u64);

    let first = evaluator.evaluate(&key).unwrap();
    let second = evaluator.evaluate(&key).unwrap();

    assert_eq!(first.result::<u64>(), Some(&49));
    assert!(first.shares_result(&second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(evaluator.stats().misses, 1);
    assert_eq!(evaluator.stats().hits, 1);
}

#[test]
fn distinct_payloads_have_distinct_entries() {
    let (evaluator, calls) = square_evaluator();

    let three = evaluator.evaluate(&NodeKey::new(SQUARE, 3u64)).unwrap();
    let four = evaluator.evaluate(&NodeKey::new(SQUARE, 4u64)).unwrap();

    assert_eq!(three.result::<u64>(), Some(&9));
    assert_eq!(four.result::<u64>(), Some(&16));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn key_equality_ignores_cpu_order() {
    let options = BuildOptions { compilation_mode: "opt".into(), ..BuildOptions::default() };
    let forward = ConfigurationKey::key(options.clone(), ["k8", "arm"]);
    let backward = ConfigurationKey::key(options, ["arm", "k8"]);
    assert_eq!(forward, backward);

    // Equal keys must share one cache entry.
    let (evaluator, _packages, calls) = configuration_evaluator();
    let first = evaluator.evaluate(&forward).unwrap();
    let second = evaluator.evaluate(&backward).unwrap();
    assert!(first.shares_result(&second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[quickcheck]
fn multi_cpu_order_never_matters(mut cpus: Vec<String>) -> bool {
    let forward = ConfigurationKey::key(BuildOptions::default(), cpus.clone());
    cpus.reverse();
    let backward = ConfigurationKey::key(BuildOptions::default(), cpus);
    forward == backward
}

#[test]
fn invalidation_recomputes_exactly_once() {
    let (evaluator, packages, calls) = configuration_evaluator();
    let key = ConfigurationKey::key(BuildOptions::default(), ["k8"]);

    evaluator.evaluate(&key).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // An unrelated change leaves the entry untouched.
    let invalidated = evaluator.on_external_change([ExternalId::from("//unrelated:pkg")]);
    assert!(invalidated.is_empty());
    evaluator.evaluate(&key).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A change to the consulted package forces exactly one recomputation.
    packages.write("//config:defs", &[("stamp", "true")]);
    let invalidated = evaluator.on_external_change([ExternalId::from("//config:defs")]);
    assert_eq!(invalidated, vec![key.clone()]);
    evaluator.evaluate(&key).unwrap();
    evaluator.evaluate(&key).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn transitive_invalidation() {
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let store = Arc::new(RwLock::new(1u64));
    let mut evaluator = Evaluator::new();

    {
        let log = log.clone();
        let store = store.clone();
        evaluator.register_fn(READER, move |_: &NodeKey, ctx: &EvalContext| {
            log.lock().push("reader");
            ctx.record_external_input(ExternalId::from("cell"));
            Ok(Arc::new(*store.read()))
        });
    }
    {
        let log = log.clone();
        evaluator.register_fn(DOUBLED, move |_: &NodeKey, ctx: &EvalContext| {
            log.lock().push("doubled");
            let inner = ctx.request_value(&NodeKey::new(READER, ()))?;
            let n: &u64 = inner.result().unwrap();
            Ok(Arc::new(n * 2))
        });
    }

    let key = NodeKey::new(DOUBLED, ());
    assert_eq!(evaluator.evaluate(&key).unwrap().result::<u64>(), Some(&2));

    // Both the reader and its dependent are invalidated.
    *store.write() = 5;
    let invalidated = evaluator.on_external_change([ExternalId::from("cell")]);
    assert_eq!(invalidated.len(), 2);

    // Re-evaluating the dependent re-evaluates the reader underneath it.
    log.lock().clear();
    assert_eq!(evaluator.evaluate(&key).unwrap().result::<u64>(), Some(&10));
    assert_eq!(*log.lock(), ["doubled", "reader"]);
}

#[test]
fn concurrent_requests_share_one_computation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut evaluator = Evaluator::new();
    evaluator.register_fn(SQUARE, move |key: &NodeKey, _: &EvalContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        let n: &u64 = key.payload().unwrap();
        Ok(Arc::new(n * n))
    });

    let evaluator = Arc::new(evaluator);
    let key = NodeKey::new(SQUARE, 9u64);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let evaluator = evaluator.clone();
            let key = key.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                evaluator.evaluate(&key).unwrap().result::<u64>().copied()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(81));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn direct_cycle_is_detected() {
    let mut evaluator = Evaluator::new();
    evaluator.register_fn(LOOP, |key: &NodeKey, ctx: &EvalContext| {
        ctx.request_value(key)?;
        Ok(Arc::new(()))
    });

    let key = NodeKey::new(LOOP, 1u32);
    let error = evaluator.evaluate(&key).unwrap_err();
    let path = error.cycle().expect("expected a cycle error");
    assert_eq!(path.len(), 2);
    assert_eq!(path.first(), path.last());

    // Nothing was committed for the cycling key.
    assert!(matches!(evaluator.lookup(&key), Lookup::Absent));
}

#[test]
fn indirect_cycle_is_detected() {
    let mut evaluator = Evaluator::new();
    evaluator.register_fn(PING, |_: &NodeKey, ctx: &EvalContext| {
        ctx.request_value(&NodeKey::new(PONG, 0u8))?;
        Ok(Arc::new(()))
    });
    evaluator.register_fn(PONG, |_: &NodeKey, ctx: &EvalContext| {
        ctx.request_value(&NodeKey::new(PING, 0u8))?;
        Ok(Arc::new(()))
    });

    let key = NodeKey::new(PING, 0u8);
    let error = evaluator.evaluate(&key).unwrap_err();
    let path = error.cycle().expect("expected a cycle error");
    assert_eq!(path.len(), 3);
    assert_eq!(path.first(), path.last());

    assert!(matches!(evaluator.lookup(&key), Lookup::Absent));
    assert!(matches!(evaluator.lookup(&NodeKey::new(PONG, 0u8)), Lookup::Absent));
}

#[test]
fn unknown_kind_fails_immediately() {
    let evaluator = Evaluator::new();
    let key = NodeKey::new(FunctionKind::new("unregistered"), 0u8);
    let error = evaluator.evaluate(&key).unwrap_err();
    assert!(matches!(error, EvalError::UnknownKind(_)));
}

#[test]
fn failures_are_shared_but_never_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicBool::new(false));
    let counter = calls.clone();
    let flag = entered.clone();
    let mut evaluator = Evaluator::new();
    evaluator.register_fn(
        SQUARE,
        move |_: &NodeKey, _: &EvalContext| -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
            counter.fetch_add(1, Ordering::SeqCst);
            flag.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            anyhow::bail!("boom")
        },
    );

    let evaluator = Arc::new(evaluator);
    let key = NodeKey::new(SQUARE, 2u64);

    // The leader enters the computation, then three followers join it.
    let leader = {
        let evaluator = evaluator.clone();
        let key = key.clone();
        thread::spawn(move || evaluator.evaluate(&key))
    };
    while !entered.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    let followers: Vec<_> = (0..3)
        .map(|_| {
            let evaluator = evaluator.clone();
            let key = key.clone();
            thread::spawn(move || evaluator.evaluate(&key))
        })
        .collect();

    let outcomes = followers
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .chain([leader.join().unwrap()]);
    for outcome in outcomes {
        let error = outcome.unwrap_err();
        assert!(matches!(error, EvalError::Computation { .. }));
        assert!(error.to_string().contains("boom"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The failure was not cached: a later request retries.
    assert!(matches!(evaluator.lookup(&key), Lookup::Absent));
    assert!(evaluator.evaluate(&key).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invalidation_during_computation_wins() {
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let mut evaluator = Evaluator::new();
    {
        let calls = calls.clone();
        let started = started.clone();
        let release = release.clone();
        evaluator.register_fn(CELL, move |_: &NodeKey, ctx: &EvalContext| {
            let pass = calls.fetch_add(1, Ordering::SeqCst);
            ctx.record_external_input(ExternalId::from("cell"));
            if pass == 1 {
                started.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            }
            Ok(Arc::new(pass))
        });
    }

    let evaluator = Arc::new(evaluator);
    let key = NodeKey::new(CELL, ());

    evaluator.evaluate(&key).unwrap();
    evaluator.on_external_change([ExternalId::from("cell")]);

    // The recomputation starts, and a second invalidation lands while it is
    // still in flight.
    let handle = {
        let evaluator = evaluator.clone();
        let key = key.clone();
        thread::spawn(move || evaluator.evaluate(&key))
    };
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    evaluator.on_external_change([ExternalId::from("cell")]);
    release.store(true, Ordering::SeqCst);

    // The in-flight requester still receives the computed value, but the
    // commit lost to the invalidation: the entry stays dirty and the next
    // request recomputes.
    handle.join().unwrap().unwrap();
    assert!(matches!(evaluator.lookup(&key), Lookup::Dirty));
    evaluator.evaluate(&key).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn memo_commit_after_invalidation_stays_dirty() {
    let memo = MemoTable::new();
    let key = NodeKey::new(SQUARE, 3u64);
    let value = NodeValue::new(Arc::new(9u64), [], []);

    let started = memo.epoch();
    memo.invalidate([&key]);
    assert!(!memo.commit(&key, value.clone(), started));
    assert!(matches!(memo.lookup(&key), Lookup::Dirty));

    // A computation started after the invalidation commits as valid.
    let started = memo.epoch();
    assert!(memo.commit(&key, value, started));
    assert!(matches!(memo.lookup(&key), Lookup::Valid(_)));
}

#[test]
fn reset_clears_all_cached_state() {
    let (evaluator, calls) = square_evaluator();
    let key = NodeKey::new(SQUARE, 5u64);

    evaluator.evaluate(&key).unwrap();
    evaluator.reset();
    assert!(matches!(evaluator.lookup(&key), Lookup::Absent));
    evaluator.evaluate(&key).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn end_to_end_configuration_resolution() {
    let (evaluator, packages, calls) = configuration_evaluator();

    let options = BuildOptions { compilation_mode: "opt".into(), ..BuildOptions::default() };
    let key = ConfigurationKey::key(options.clone(), Vec::<String>::new());

    // First resolution consults //config:defs and caches the collection.
    let v1 = evaluator.evaluate(&key).unwrap();
    let collection = v1.result::<ConfigurationCollectionValue>().unwrap();
    assert_eq!(collection.packages, BTreeSet::from([PackageLabel::from("//config:defs")]));
    assert_eq!(collection.collection.targets.len(), 1);
    assert_eq!(collection.collection.targets[0].cpu, "k8");
    assert_eq!(collection.collection.targets[0].compilation_mode, "opt");
    assert_eq!(collection.collection.targets[0].settings["stamp"], "false");
    assert_eq!(collection.collection.host.cpu, "k8");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The package content changes.
    packages.write("//config:defs", &[("stamp", "true")]);
    let defs = PackageLabel::from("//config:defs");
    assert!(packages.changed_since(&defs, 1));
    let invalidated = evaluator.on_external_change([defs.external_id()]);
    assert_eq!(invalidated, vec![key.clone()]);

    // A multi-CPU key gets its own independent entry.
    let arm = ConfigurationKey::key(options, ["arm64"]);
    let varm = evaluator.evaluate(&arm).unwrap();
    let arm_collection = varm.result::<ConfigurationCollectionValue>().unwrap();
    assert_eq!(arm_collection.collection.targets[0].cpu, "arm64");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The invalidated key is freshly recomputed from the new content.
    let v2 = evaluator.evaluate(&key).unwrap();
    assert!(!v2.shares_result(&v1));
    let recomputed = v2.result::<ConfigurationCollectionValue>().unwrap();
    assert_eq!(recomputed.collection.targets[0].settings["stamp"], "true");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The untouched multi-CPU entry keeps being served from cache.
    assert!(evaluator.evaluate(&arm).unwrap().shares_result(&varm));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// In-memory package storage with monotonic content versions.
#[derive(Default)]
struct TestPackages(RwLock<BTreeMap<String, Arc<Package>>>);

impl TestPackages {
    fn write(&self, label: &str, defs: &[(&str, &str)]) {
        let mut map = self.0.write();
        let version = map.get(label).map_or(1, |package| package.version + 1);
        let defs = defs.iter().map(|&(name, value)| (name.into(), value.into())).collect();
        let package = Package { label: PackageLabel::from(label), version, defs };
        map.insert(label.into(), Arc::new(package));
    }
}

impl PackageProvider for TestPackages {
    fn load(&self, label: &PackageLabel) -> anyhow::Result<Arc<Package>> {
        self.0
            .read()
            .get(label.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such package: {label}"))
    }

    fn changed_since(&self, label: &PackageLabel, version: u64) -> bool {
        self.0.read().get(label.as_str()).map_or(true, |package| package.version > version)
    }
}

/// Merges option flags and package defs into each configuration's settings.
struct DefsBuilder {
    calls: Arc<AtomicUsize>,
}

impl ConfigurationBuilder for DefsBuilder {
    fn required_packages(&self, _options: &BuildOptions) -> Vec<PackageLabel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        vec![PackageLabel::from("//config:defs")]
    }

    fn configure(
        &self,
        options: &BuildOptions,
        cpu: &str,
        packages: &[Arc<Package>],
    ) -> anyhow::Result<BuildConfiguration> {
        let mut settings = options.flags.clone();
        for package in packages {
            settings.extend(package.defs.clone());
        }
        Ok(BuildConfiguration {
            cpu: cpu.into(),
            compilation_mode: options.compilation_mode.clone(),
            settings,
        })
    }
}

/// Build an evaluator with a registered configuration resolver, one seeded
/// package, and a resolution counter.
fn configuration_evaluator() -> (Evaluator, Arc<TestPackages>, Arc<AtomicUsize>) {
    let packages = Arc::new(TestPackages::default());
    packages.write("//config:defs", &[("stamp", "false")]);
    let calls = Arc::new(AtomicUsize::new(0));
    let builder = Arc::new(DefsBuilder { calls: calls.clone() });
    let resolver = ConfigurationCollectionResolver::new(packages.clone(), builder);
    let mut evaluator = Evaluator::new();
    evaluator.register(CONFIGURATION_COLLECTION, resolver);
    (evaluator, packages, calls)
}
