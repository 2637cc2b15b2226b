//! Java version strings

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Oldest runtime the agent payload runs on.
pub const MINIMUM_VERSION: &str = "1.5";

const VERSION_PREFIXES: [&str; 2] = ["java version \"", "openjdk version \""];

/// A dotted runtime version, compared numerically per component.
///
/// `1.6.0_45`, `11.0.2+9` and `17-ea` are all accepted; missing trailing
/// components compare as zero, so `1.6` == `1.6.0`.
#[derive(Debug, Clone)]
pub struct RuntimeVersion {
    raw: String,
    parts: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unparseable version string {0:?}")]
pub struct VersionParseError(pub String);

impl RuntimeVersion {
    pub fn minimum() -> Self {
        Self {
            raw: MINIMUM_VERSION.to_string(),
            parts: vec![1, 5],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_supported(&self) -> bool {
        *self >= Self::minimum()
    }

    /// Find the version in the output of `java -version`.
    ///
    /// Only lines starting with `java version "` or `openjdk version "`
    /// (any case) are considered.
    pub fn from_probe_output(output: &str) -> Option<Self> {
        output.lines().find_map(|line| {
            let line = line.trim();
            let lower = line.to_ascii_lowercase();
            VERSION_PREFIXES
                .iter()
                .find(|prefix| lower.starts_with(*prefix))
                .and_then(|_| {
                    let first = line.find('"')?;
                    let last = line.rfind('"')?;
                    (last > first).then(|| &line[first + 1..last])
                })
                .and_then(|quoted| quoted.parse().ok())
        })
    }
}

impl FromStr for RuntimeVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let mut parts = Vec::new();
        for token in raw.split(['.', '_', '-', '+']) {
            match token.parse::<u32>() {
                Ok(n) => parts.push(n),
                // Qualifiers such as `ea` end the numeric part
                Err(_) if !parts.is_empty() => break,
                Err(_) => return Err(VersionParseError(s.to_string())),
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for RuntimeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RuntimeVersion {}

impl PartialOrd for RuntimeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuntimeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).copied().unwrap_or(0);
                let b = other.parts.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}
