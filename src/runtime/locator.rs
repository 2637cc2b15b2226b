//! Runtime candidate probing

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::version::RuntimeVersion;
use crate::launcher::Progress;
use crate::sftp::remote_join;
use crate::ssh::{RemoteTarget, Transport};

/// Conventional Java locations, probed in order.
pub const DEFAULT_JAVA_PATHS: [&str; 6] = [
    "java",
    "/usr/bin/java",
    "/usr/java/default/bin/java",
    "/usr/java/latest/bin/java",
    "/usr/local/bin/java",
    "/usr/local/java/bin/java",
];

/// Java executable of a runtime installed by the launcher under `working_directory`.
pub fn installed_java_path(working_directory: &str) -> String {
    remote_join(working_directory, "jdk/bin/java")
}

/// Supplies candidate runtime executables for a target.
pub trait RuntimeProvider: Send + Sync {
    fn candidates(&self, target: &RemoteTarget, working_directory: &str) -> Vec<String>;
}

/// The Java path configured on the target, if any.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExplicitRuntimeProvider;

impl RuntimeProvider for ExplicitRuntimeProvider {
    fn candidates(&self, target: &RemoteTarget, _working_directory: &str) -> Vec<String> {
        target
            .java_path
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// [`DEFAULT_JAVA_PATHS`] followed by the auto-install location.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRuntimeProvider;

impl RuntimeProvider for DefaultRuntimeProvider {
    fn candidates(&self, _target: &RemoteTarget, working_directory: &str) -> Vec<String> {
        DEFAULT_JAVA_PATHS
            .iter()
            .map(|p| p.to_string())
            .chain(std::iter::once(installed_java_path(working_directory)))
            .collect()
    }
}

/// A fixed list of paths, from configuration.
#[derive(Debug, Clone, Default)]
pub struct ListRuntimeProvider(pub Vec<String>);

impl RuntimeProvider for ListRuntimeProvider {
    fn candidates(&self, _target: &RemoteTarget, _working_directory: &str) -> Vec<String> {
        self.0.clone()
    }
}

/// Result of probing one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Compatible(RuntimeVersion),
    TooOld(RuntimeVersion),
    /// The command ran but printed no recognisable version
    Unparseable,
    /// The command could not be run at all
    ExecFailed(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Compatible(v) => write!(f, "{}", v),
            ProbeOutcome::TooOld(v) => write!(f, "{} (too old)", v),
            ProbeOutcome::Unparseable => f.write_str("unknown"),
            ProbeOutcome::ExecFailed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// A probed runtime executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCandidate {
    pub path: String,
    pub outcome: ProbeOutcome,
}

impl RuntimeCandidate {
    pub fn is_compatible(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Compatible(_))
    }
}

/// `<java>[ <options>] -version`
pub fn probe_command(java: &str, options: &str) -> String {
    let options = options.trim();
    if options.is_empty() {
        format!("{} -version", java)
    } else {
        format!("{} {} -version", java, options)
    }
}

/// Run the version check for one executable.
///
/// Never fails: every problem disqualifies the candidate.
pub async fn probe(
    transport: &mut dyn Transport,
    java: &str,
    options: &str,
    progress: &Progress,
) -> RuntimeCandidate {
    progress.info(format!("Checking java version of {}", java));

    let outcome = match transport.exec(&probe_command(java, options)).await {
        Err(e) => ProbeOutcome::ExecFailed(e.to_string()),
        Ok(output) => {
            let text = output.combined();
            match RuntimeVersion::from_probe_output(&text) {
                Some(version) if version.is_supported() => ProbeOutcome::Compatible(version),
                Some(version) => ProbeOutcome::TooOld(version),
                None => {
                    debug!("[runtime] {} printed {:?}", java, text);
                    ProbeOutcome::Unparseable
                }
            }
        }
    };

    progress.info(format!("{} -version returned {}", java, outcome));
    RuntimeCandidate {
        path: java.to_string(),
        outcome,
    }
}

/// No candidate met the version floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unqualified {
    pub tried: Vec<RuntimeCandidate>,
}

impl Unqualified {
    pub fn paths(&self) -> Vec<String> {
        self.tried.iter().map(|c| c.path.clone()).collect()
    }
}

/// Probes candidates from its providers in order, stopping at the first compatible one.
#[derive(Clone)]
pub struct RuntimeLocator {
    providers: Vec<Arc<dyn RuntimeProvider>>,
}

impl Default for RuntimeLocator {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(ExplicitRuntimeProvider),
            Arc::new(DefaultRuntimeProvider),
        ])
    }
}

impl RuntimeLocator {
    pub fn new(providers: Vec<Arc<dyn RuntimeProvider>>) -> Self {
        Self { providers }
    }

    /// Candidates of every provider, in order, without duplicates.
    pub fn candidates(&self, target: &RemoteTarget, working_directory: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for path in self
            .providers
            .iter()
            .flat_map(|p| p.candidates(target, working_directory))
        {
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
        seen
    }

    pub async fn locate(
        &self,
        transport: &mut dyn Transport,
        target: &RemoteTarget,
        working_directory: &str,
        options: &str,
        progress: &Progress,
    ) -> Result<RuntimeCandidate, Unqualified> {
        let mut tried = Vec::new();
        for java in self.candidates(target, working_directory) {
            let candidate = probe(transport, &java, options, progress).await;
            if candidate.is_compatible() {
                return Ok(candidate);
            }
            tried.push(candidate);
        }
        Err(Unqualified { tried })
    }
}
