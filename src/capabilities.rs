use std::collections::HashSet;
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// Closed set of permissions gating host APIs. Every host function names the
/// capability it requires; the gate rejects before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ReadScripts,
    WriteScripts,
    DeleteScripts,
    ReadAssets,
    WriteAssets,
    DeleteAssets,
    ReadSecrets,
    NetFetch,
    DbRead,
    DbWrite,
    DbAdmin,
    RegisterRoute,
    RegisterStream,
    RegisterGraphql,
    RegisterSchedule,
    PublishMessage,
    ReadLogs,
    ManageUsers,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadScripts => "ReadScripts",
            Self::WriteScripts => "WriteScripts",
            Self::DeleteScripts => "DeleteScripts",
            Self::ReadAssets => "ReadAssets",
            Self::WriteAssets => "WriteAssets",
            Self::DeleteAssets => "DeleteAssets",
            Self::ReadSecrets => "ReadSecrets",
            Self::NetFetch => "NetFetch",
            Self::DbRead => "DbRead",
            Self::DbWrite => "DbWrite",
            Self::DbAdmin => "DbAdmin",
            Self::RegisterRoute => "RegisterRoute",
            Self::RegisterStream => "RegisterStream",
            Self::RegisterGraphql => "RegisterGraphql",
            Self::RegisterSchedule => "RegisterSchedule",
            Self::PublishMessage => "PublishMessage",
            Self::ReadLogs => "ReadLogs",
            Self::ManageUsers => "ManageUsers",
        };
        f.write_str(name)
    }
}

/// Inverse of `Display`, for rehydrating capability names out of exception
/// messages crossing the JS boundary.
pub fn parse_capability(name: &str) -> Option<Capability> {
    ALL.into_iter().find(|cap| cap.to_string() == name.trim())
}

const ALL: [Capability; 18] = [
    Capability::ReadScripts,
    Capability::WriteScripts,
    Capability::DeleteScripts,
    Capability::ReadAssets,
    Capability::WriteAssets,
    Capability::DeleteAssets,
    Capability::ReadSecrets,
    Capability::NetFetch,
    Capability::DbRead,
    Capability::DbWrite,
    Capability::DbAdmin,
    Capability::RegisterRoute,
    Capability::RegisterStream,
    Capability::RegisterGraphql,
    Capability::RegisterSchedule,
    Capability::PublishMessage,
    Capability::ReadLogs,
    Capability::ManageUsers,
];

/// The default grant for non-privileged scripts. Db/Asset/Log rights in this
/// set are additionally scoped to the script's own resources at the resource
/// layer (table prefix, asset owner, log uri).
const DEFAULT_GRANT: [Capability; 12] = [
    Capability::RegisterRoute,
    Capability::RegisterStream,
    Capability::RegisterGraphql,
    Capability::RegisterSchedule,
    Capability::NetFetch,
    Capability::DbRead,
    Capability::DbWrite,
    Capability::DbAdmin,
    Capability::PublishMessage,
    Capability::ReadAssets,
    Capability::WriteAssets,
    Capability::ReadSecrets,
];

/// The capability set attached to one loaded sandbox, computed once per load.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    granted: HashSet<Capability>,
    privileged: bool,
}

impl CapabilitySet {
    /// Compute the set for a script from its privilege flag.
    pub fn for_script(privileged: bool) -> Self {
        let granted = if privileged {
            ALL.into_iter().collect()
        } else {
            let mut set: HashSet<Capability> = DEFAULT_GRANT.into_iter().collect();
            // Non-privileged scripts may read their own logs.
            set.insert(Capability::ReadLogs);
            set
        };
        Self {
            granted,
            privileged,
        }
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.granted.contains(&cap)
    }

    /// Gate check: error before the host side effect when the capability is
    /// missing.
    pub fn require(&self, cap: Capability) -> EngineResult<()> {
        if self.has(cap) {
            Ok(())
        } else {
            Err(EngineError::CapabilityDenied(cap))
        }
    }

    /// Cross-script resource access (another script's assets, logs, source,
    /// raw SQL outside the own-table prefix) requires privilege regardless of
    /// the base capability.
    pub fn require_privileged(&self, cap: Capability) -> EngineResult<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(EngineError::CapabilityDenied(cap))
        }
    }
}
