//! Runtime version parsing and comparison
//!
//! The runtime reports versions such as `v1.29.5+k0s` while release metadata
//! carries `v1.29.5+k0s.1`. Only the semantic core (major, minor, patch and
//! pre-release) takes part in ordering; the build qualifier after `+` is kept
//! for display and for the previous-installation fallback.

use std::cmp::Ordering;
use std::fmt;

use crate::controller::error::{Error, Result};

/// Parsed runtime version
#[derive(Clone, Debug)]
pub struct KubeVersion {
    core: semver::Version,
    qualifier: Option<String>,
    raw: String,
}

impl KubeVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let unprefixed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let (core, qualifier) = match unprefixed.split_once('+') {
            Some((core, qualifier)) => (core, Some(qualifier.to_string())),
            None => (unprefixed, None),
        };
        let core = semver::Version::parse(core)
            .map_err(|e| Error::ValidationError(format!("invalid version {:?}: {}", raw, e)))?;
        Ok(Self {
            core,
            qualifier,
            raw: trimmed.to_string(),
        })
    }

    /// Same semantic core and same qualifier
    pub fn identical(&self, other: &KubeVersion) -> bool {
        self == other && self.qualifier == other.qualifier
    }
}

impl PartialEq for KubeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KubeVersion {}

impl PartialOrd for KubeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KubeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.core.major, self.core.minor, self.core.patch)
            .cmp(&(other.core.major, other.core.minor, other.core.patch))
            .then_with(|| self.core.pre.cmp(&other.core.pre))
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Parse both versions and reject a downgrade.
///
/// The error string is the reason recorded on a Failed installation.
pub fn check_versions(desired: &str, running: &str) -> std::result::Result<(KubeVersion, KubeVersion), String> {
    let desired_version = KubeVersion::parse(desired).map_err(|e| e.to_string())?;
    let running_version = KubeVersion::parse(running).map_err(|e| e.to_string())?;
    if desired_version < running_version {
        return Err(format!(
            "Kubernetes downgrade from {} to {} is not supported",
            running_version, desired_version
        ));
    }
    Ok((desired_version, running_version))
}

/// Whether moving from `running` to `desired` needs a runtime upgrade.
///
/// When the semantic cores match the running qualifier is not comparable to
/// the metadata one, so the version converged by the previous installation
/// decides: a different packaging of the same core still needs a rollout.
pub fn upgrade_required(
    desired: &KubeVersion,
    running: &KubeVersion,
    previous: Option<&KubeVersion>,
) -> bool {
    if desired != running {
        return true;
    }
    if desired.qualifier == running.qualifier {
        return false;
    }
    match previous {
        Some(previous) => !previous.identical(desired),
        None => false,
    }
}

/// Compare operator versions ignoring a leading `v`
pub fn same_release(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches('v').to_string();
    strip(a) == strip(b)
}
