//! Run identities and the resource names derived from them

use std::fmt;

use uuid::Uuid;

/// Longest pod name produced. One short of the 63-character label ceiling.
pub const MAX_POD_NAME_LEN: usize = 62;

const VOLUME_PREFIX: &str = "scan-pv-";
const CLAIM_PREFIX: &str = "scan-pvc-";
const FALLBACK_POD_PREFIX: &str = "scan";

/// Unique token minted once per request and embedded in every child resource name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunIdentity(Uuid);

impl RunIdentity {
    /// Fresh random (v4) identity
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // lowercase hyphenated, 36 chars
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Names of the three child resources of one scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    /// Cluster-scoped PersistentVolume
    pub volume: String,
    /// Worker pod, also used as the container name
    pub pod: String,
    /// PersistentVolumeClaim owned by the pod
    pub claim: String,
}

/// Derive child resource names for `repo_name` under `identity`.
///
/// The pod name is `<sanitized repo>-<identity>`. When that exceeds
/// [`MAX_POD_NAME_LEN`] the repository part is shortened; the identity suffix is
/// always kept whole so names stay unique.
pub fn derive_names(identity: &RunIdentity, repo_name: &str) -> ResourceNames {
    let id = identity.to_string();

    let budget = MAX_POD_NAME_LEN - id.len() - 1;
    let mut prefix = sanitize_label(repo_name);
    if prefix.len() > budget {
        // sanitized text is ASCII, byte truncation is safe
        prefix.truncate(budget);
        prefix.truncate(prefix.trim_end_matches('-').len());
    }
    if prefix.is_empty() {
        prefix.push_str(FALLBACK_POD_PREFIX);
    }

    ResourceNames {
        volume: format!("{VOLUME_PREFIX}{id}"),
        pod: format!("{prefix}-{id}"),
        claim: format!("{CLAIM_PREFIX}{id}"),
    }
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, strip edge hyphens.
fn sanitize_label(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}
