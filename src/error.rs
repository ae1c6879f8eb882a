// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use crate::metric::{MetricId, ValueKind};
use crate::source::SourceState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NixError(#[from] nix::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),

    #[error("malformed event specification {spec:?}: {reason}")]
    MalformedEventSpec { spec: String, reason: &'static str },
    #[error("expression references unregistered metric {0}")]
    UnknownMetricReference(MetricId),
    #[error("unknown metric id {0}")]
    UnknownMetricId(MetricId),
    #[error("no sampling source supports event {0:?}")]
    NoMatchingSource(String),
    #[error("source {new} claims event {event:?} already owned by {existing}")]
    OverlappingEventNamespace {
        new: String,
        existing: String,
        event: String,
    },
    #[error("event {event:?} of source {source_name} already bound to counter {counter}")]
    DuplicateEventBinding {
        source_name: String,
        event: String,
        counter: u32,
    },
    #[error("metric name must not be empty")]
    EmptyMetricName,
    #[error("metric registry is full ({0} metrics)")]
    RegistryFull(usize),
    #[error("metric {0} is computed and has no accumulator")]
    NotRawMetric(MetricId),

    #[error("source {source_name}: {op} is not allowed in state {state:?}")]
    OrderingViolation {
        source_name: String,
        state: SourceState,
        op: &'static str,
    },

    #[error("metric {id} accumulates {expected:?} values, got {found:?}")]
    TypeMismatch {
        id: MetricId,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("metric {0} rejects writes after a type mismatch")]
    MetricRejected(MetricId),
}

/// Coarse classification of [`Error`], used by callers deciding whether a
/// failure stops the run or only a single metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    OrderingViolation,
    TypeMismatch,
    Platform,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NixError(_) | Error::IoError(_) => ErrorKind::Platform,
            Error::OrderingViolation { .. } => ErrorKind::OrderingViolation,
            Error::TypeMismatch { .. } | Error::MetricRejected(_) => ErrorKind::TypeMismatch,
            _ => ErrorKind::Configuration,
        }
    }

    pub(crate) fn ordering(source_name: &str, state: SourceState, op: &'static str) -> Self {
        Error::OrderingViolation {
            source_name: source_name.to_owned(),
            state,
            op,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        assert_eq!(
            Error::NoMatchingSource("X".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::ordering("memleak", SourceState::Uninit, "start").kind(),
            ErrorKind::OrderingViolation
        );
        assert_eq!(
            Error::MetricRejected(MetricId(3)).kind(),
            ErrorKind::TypeMismatch
        );
        assert_eq!(
            Error::NixError(nix::Error::EINVAL).kind(),
            ErrorKind::Platform
        );
    }

    #[test]
    fn ordering_message_names_transition() {
        let err = Error::ordering("rcce", SourceState::Uninit, "start");
        assert_eq!(
            err.to_string(),
            "source rcce: start is not allowed in state Uninit"
        );
    }
}
