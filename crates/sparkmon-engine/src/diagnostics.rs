use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedEvent,
    UnknownEventKind,
    ReferentialGap,
    OrderingInversion,
    CapacityUnderflow,
    DuplicateEvent,
    ConflictingStatus,
    RetiredEntity,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::MalformedEvent => "malformed_event",
            DiagnosticKind::UnknownEventKind => "unknown_event_kind",
            DiagnosticKind::ReferentialGap => "referential_gap",
            DiagnosticKind::OrderingInversion => "ordering_inversion",
            DiagnosticKind::CapacityUnderflow => "capacity_underflow",
            DiagnosticKind::DuplicateEvent => "duplicate_event",
            DiagnosticKind::ConflictingStatus => "conflicting_status",
            DiagnosticKind::RetiredEntity => "retired_entity",
        }
    }

    fn is_warning(&self) -> bool {
        matches!(
            self,
            DiagnosticKind::MalformedEvent
                | DiagnosticKind::UnknownEventKind
                | DiagnosticKind::CapacityUnderflow
                | DiagnosticKind::ConflictingStatus
        )
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory note about an input the monitor had to repair or drop. Never
/// returned as an error; collected in [`ApplyReport`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub diagnostics: Vec<Diagnostic>,
    /// True when committed state changed.
    pub changed: bool,
}

impl ApplyReport {
    pub fn note(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        let message = message.into();
        if kind.is_warning() {
            tracing::warn!(event = kind.as_str(), %message);
        } else {
            tracing::debug!(event = kind.as_str(), %message);
        }
        self.diagnostics.push(Diagnostic { kind, message });
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn has(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|diag| diag.kind == kind)
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.diagnostics.extend(other.diagnostics);
        self.changed |= other.changed;
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_accumulate_and_merge() {
        let mut report = ApplyReport::default();
        report.note(DiagnosticKind::DuplicateEvent, "job 0:1 already started");
        assert!(report.has(DiagnosticKind::DuplicateEvent));
        assert!(!report.changed);

        let mut other = ApplyReport::default();
        other.mark_changed();
        other.note(DiagnosticKind::CapacityUnderflow, "executor 3");
        report.merge(other);

        assert!(report.changed);
        assert_eq!(report.diagnostics.len(), 2);
        assert_eq!(
            report.diagnostics[1].to_string(),
            "capacity_underflow: executor 3"
        );
    }
}
