use serde::{Deserialize, Serialize};

/// The kind of recurring scan a policy (and a scan ledger entry) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    Indexing,
    Retention,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Indexing => "indexing",
            ScanKind::Retention => "retention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "indexing" => Some(ScanKind::Indexing),
            "retention" => Some(ScanKind::Retention),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which repositories a policy covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PolicyScope {
    /// Every live repository. Only honoured when the policy is marked
    /// `allow_global` and the caller allows global policies.
    Global,
    Repository(i64),
    /// Glob patterns over repository names; membership is precomputed.
    Patterns(Vec<String>),
}

impl PolicyScope {
    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            PolicyScope::Global => "global",
            PolicyScope::Repository(_) => "repository",
            PolicyScope::Patterns(_) => "patterns",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationPolicy {
    pub id: i64,
    pub name: String,
    pub scan_kind: ScanKind,
    pub enabled: bool,
    pub scope: PolicyScope,
    pub allow_global: bool,
}

/// Input for authoring a policy. New policies start enabled.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub name: String,
    pub scan_kind: ScanKind,
    pub scope: PolicyScope,
    pub allow_global: bool,
}

impl NewPolicy {
    pub fn new(name: impl Into<String>, scan_kind: ScanKind, scope: PolicyScope) -> Self {
        Self {
            name: name.into(),
            scan_kind,
            scope,
            allow_global: false,
        }
    }

    pub fn allowing_global(mut self) -> Self {
        self.allow_global = true;
        self
    }
}
