//! Remote Java runtime discovery and installation

mod install;
mod locator;
mod version;

pub use install::{
    detect_environment, BundleInstaller, BundleSource, Cpu, HttpBundleSource, InstallError,
    Platform, RuntimeInstaller,
};
pub use locator::{
    installed_java_path, probe, probe_command, DefaultRuntimeProvider, ExplicitRuntimeProvider,
    ListRuntimeProvider, ProbeOutcome, RuntimeCandidate, RuntimeLocator, RuntimeProvider,
    Unqualified, DEFAULT_JAVA_PATHS,
};
pub use version::{RuntimeVersion, VersionParseError, MINIMUM_VERSION};
