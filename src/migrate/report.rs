//! Migration warnings and summary.

use crate::storage::EntityKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// How much attention a warning needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// A record was skipped.
    Warning,
    /// Source data needs manual repair.
    Severe,
}

impl Severity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Severe => "severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A soft condition met while migrating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationWarning {
    /// Severity.
    pub severity: Severity,
    /// Kind of the affected record.
    pub kind: EntityKind,
    /// Id of the affected record.
    pub id: String,
    /// What happened.
    pub message: String,
}

impl fmt::Display for MigrationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} '{}': {}",
            self.severity, self.kind, self.id, self.message
        )
    }
}

/// Outcome of a successful migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Records written per kind.
    pub counts: BTreeMap<EntityKind, usize>,
    /// Soft conditions, in the order they were met.
    pub warnings: Vec<MigrationWarning>,
}

impl MigrationReport {
    /// Records written for one kind.
    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Warnings of at least the given severity.
    pub fn warnings_at_least(&self, severity: Severity) -> impl Iterator<Item = &MigrationWarning> {
        self.warnings.iter().filter(move |w| w.severity >= severity)
    }

    pub(crate) fn record_copied(&mut self, kind: EntityKind) {
        *self.counts.entry(kind).or_default() += 1;
        metrics::counter!("portal_migrated_records_total", "kind" => kind.as_str()).increment(1);
    }

    pub(crate) fn warn(
        &mut self,
        severity: Severity,
        kind: EntityKind,
        id: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.warnings.push(MigrationWarning {
            severity,
            kind,
            id: id.into(),
            message: message.into(),
        });
    }

    /// Logs every warning at a level matching its severity.
    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            match warning.severity {
                Severity::Info => tracing::info!(kind = %warning.kind, id = warning.id, "{}", warning.message),
                Severity::Warning => tracing::warn!(kind = %warning.kind, id = warning.id, "{}", warning.message),
                Severity::Severe => tracing::error!(kind = %warning.kind, id = warning.id, "{}", warning.message),
            }
        }
    }
}
