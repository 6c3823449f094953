use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use anyhow::Context;

use crate::eval::{EvalContext, NodeFunction};
use crate::key::{FunctionKind, NodeKey};
use crate::value::ExternalId;

/// The kind tag for configuration-collection resolution.
pub const CONFIGURATION_COLLECTION: FunctionKind = FunctionKind::new("configuration-collection");

/// The option set a build was requested with.
///
/// Order-independent containers keep equality and hashing structural: two
/// option sets with the same contents address the same work, no matter how
/// they were assembled.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BuildOptions {
    /// The requested compilation mode, e.g. `"fastbuild"` or `"opt"`.
    pub compilation_mode: String,
    /// The target CPU used when no multi-CPU set is requested.
    pub cpu: String,
    /// The CPU the host configuration is built for.
    pub host_cpu: String,
    /// All remaining flags, name to value.
    pub flags: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compilation_mode: "fastbuild".into(),
            cpu: "k8".into(),
            host_cpu: "k8".into(),
            flags: BTreeMap::new(),
        }
    }
}

/// Identifies a configuration-defining package.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PackageLabel(Arc<str>);

impl PackageLabel {
    /// Create a label from its name, e.g. `"//config:defs"`.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self(label.into())
    }

    /// The label's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier under which changes to this package are announced.
    pub fn external_id(&self) -> ExternalId {
        ExternalId::new(self.0.clone())
    }
}

impl From<&str> for PackageLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl Debug for PackageLabel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Display for PackageLabel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// A loaded configuration-defining package.
///
/// Owned by the package-loading subsystem; the resolver only reads it. The
/// `version` is the loader's monotonic content version, letting callers ask
/// the loader whether a recorded package has changed since a value was
/// computed.
#[derive(Clone, Debug)]
pub struct Package {
    pub label: PackageLabel,
    pub version: u64,
    /// Raw setting definitions contributed by this package.
    pub defs: BTreeMap<String, String>,
}

/// Loads configuration-defining packages.
pub trait PackageProvider: Send + Sync + 'static {
    /// Load a package's current contents.
    fn load(&self, label: &PackageLabel) -> anyhow::Result<Arc<Package>>;

    /// Whether the package's content changed after the given version.
    fn changed_since(&self, label: &PackageLabel, version: u64) -> bool;
}

/// Assembles configurations from options and package contents.
///
/// The assembly algorithm belongs to the surrounding build system; the
/// resolver only drives it and records what it read.
pub trait ConfigurationBuilder: Send + Sync + 'static {
    /// The packages that must be consulted for the given options.
    fn required_packages(&self, options: &BuildOptions) -> Vec<PackageLabel>;

    /// Assemble the configuration for a single CPU.
    fn configure(
        &self,
        options: &BuildOptions,
        cpu: &str,
        packages: &[Arc<Package>],
    ) -> anyhow::Result<BuildConfiguration>;
}

/// Key payload for configuration-collection resolution.
///
/// Two requests with equal options and equal CPU sets address the same memo
/// entry regardless of the order the CPUs were listed in: the set lives in
/// a `BTreeSet`, so it hashes and compares in canonical order.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConfigurationKey {
    pub options: BuildOptions,
    pub multi_cpu: BTreeSet<String>,
}

impl ConfigurationKey {
    /// Build the node key addressing the resolution of these options.
    pub fn key(
        options: BuildOptions,
        multi_cpu: impl IntoIterator<Item = impl Into<String>>,
    ) -> NodeKey {
        let payload = Self {
            options,
            multi_cpu: multi_cpu.into_iter().map(Into::into).collect(),
        };
        NodeKey::new(CONFIGURATION_COLLECTION, payload)
    }
}

/// One fully resolved configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildConfiguration {
    pub cpu: String,
    pub compilation_mode: String,
    pub settings: BTreeMap<String, String>,
}

/// The fully resolved set of configurations for one build request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigurationCollection {
    /// One configuration per requested target CPU.
    pub targets: Vec<BuildConfiguration>,
    /// The configuration that tools used during the build are built in.
    pub host: BuildConfiguration,
}

/// The result committed for a configuration key: the resolved collection
/// plus the packages consulted to produce it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigurationCollectionValue {
    pub collection: ConfigurationCollection,
    pub packages: BTreeSet<PackageLabel>,
}

/// The computation function resolving configuration collections.
///
/// Consults every configuration-defining package through the provider and
/// records each one as an external input, so that a later change to any of
/// them invalidates exactly the entries that read it.
pub struct ConfigurationCollectionResolver {
    packages: Arc<dyn PackageProvider>,
    builder: Arc<dyn ConfigurationBuilder>,
}

impl ConfigurationCollectionResolver {
    pub fn new(
        packages: Arc<dyn PackageProvider>,
        builder: Arc<dyn ConfigurationBuilder>,
    ) -> Self {
        Self { packages, builder }
    }
}

impl NodeFunction for ConfigurationCollectionResolver {
    fn compute(
        &self,
        key: &NodeKey,
        ctx: &EvalContext,
    ) -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
        let Some(request) = key.payload::<ConfigurationKey>() else {
            anyhow::bail!("configuration-collection key carries a foreign payload");
        };

        let mut loaded = Vec::new();
        let mut consulted = BTreeSet::new();
        for label in self.builder.required_packages(&request.options) {
            let package = self
                .packages
                .load(&label)
                .with_context(|| format!("loading configuration package {label}"))?;
            ctx.record_external_input(label.external_id());
            consulted.insert(label);
            loaded.push(package);
        }

        // An empty multi-CPU set resolves the single CPU from the options.
        let cpus: Vec<&str> = if request.multi_cpu.is_empty() {
            vec![request.options.cpu.as_str()]
        } else {
            request.multi_cpu.iter().map(String::as_str).collect()
        };

        let mut targets = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            targets.push(self.builder.configure(&request.options, cpu, &loaded)?);
        }
        let host = self.builder.configure(&request.options, &request.options.host_cpu, &loaded)?;

        Ok(Arc::new(ConfigurationCollectionValue {
            collection: ConfigurationCollection { targets, host },
            packages: consulted,
        }))
    }
}
