//! This example demonstrates how configuration resolution is cached in the
//! build graph---recomputing a configuration collection only when one of the
//! packages it was resolved from changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use memograph::{
    BuildConfiguration, BuildOptions, CONFIGURATION_COLLECTION, ConfigurationBuilder,
    ConfigurationCollectionResolver, ConfigurationCollectionValue, ConfigurationKey, Evaluator,
    Package, PackageLabel, PackageProvider,
};
use parking_lot::RwLock;

fn main() {
    // Create a package store holding the configuration-defining package.
    let packages = Arc::new(Packages::default());
    packages.write("//config:defs", &[("stamp", "false")]);

    let mut evaluator = Evaluator::new();
    evaluator.register(
        CONFIGURATION_COLLECTION,
        ConfigurationCollectionResolver::new(packages.clone(), Arc::new(Merge)),
    );

    let options = BuildOptions { compilation_mode: "opt".into(), ..BuildOptions::default() };
    let single = ConfigurationKey::key(options.clone(), Vec::<String>::new());
    let multi = ConfigurationKey::key(options, ["arm64", "k8"]);

    // [Miss] The graph is empty, so the collection is resolved.
    describe(&evaluator, &single);

    // [Hit] Nothing changed, the cached collection is served.
    describe(&evaluator, &single);

    // [Miss] A different CPU set addresses its own entry.
    describe(&evaluator, &multi);

    // Modify the defs package and announce the change. Both entries
    // consulted it, so both are now dirty.
    packages.write("//config:defs", &[("stamp", "true")]);
    let invalidated = evaluator.on_external_change([PackageLabel::from("//config:defs").external_id()]);
    println!("invalidated {} entries", invalidated.len());

    // [Miss] The collection is resolved freshly from the new content.
    describe(&evaluator, &single);

    println!("{:?}", evaluator.stats());
}

/// Resolve and print one configuration collection.
fn describe(evaluator: &Evaluator, key: &memograph::NodeKey) {
    let misses = evaluator.stats().misses;
    let value = evaluator.evaluate(key).unwrap();
    let resolved: &ConfigurationCollectionValue = value.result().unwrap();
    let cpus: Vec<_> = resolved.collection.targets.iter().map(|c| c.cpu.as_str()).collect();
    println!(
        "{} cpus={cpus:?} stamp={} (consulted {:?})",
        if evaluator.stats().misses > misses { "[miss]" } else { "[hit] " },
        resolved.collection.targets[0].settings["stamp"],
        resolved.packages,
    );
}

/// In-memory package storage with monotonic content versions.
#[derive(Default)]
struct Packages(RwLock<BTreeMap<String, Arc<Package>>>);

impl Packages {
    fn write(&self, label: &str, defs: &[(&str, &str)]) {
        let mut map = self.0.write();
        let version = map.get(label).map_or(1, |package| package.version + 1);
        let defs = defs.iter().map(|&(name, value)| (name.into(), value.into())).collect();
        let package = Package { label: PackageLabel::from(label), version, defs };
        map.insert(label.into(), Arc::new(package));
    }
}

impl PackageProvider for Packages {
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

/// Merges package defs into each configuration's settings.
struct Merge;

impl ConfigurationBuilder for Merge {
    fn required_packages(&self, _options: &BuildOptions) -> Vec<PackageLabel> {
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
