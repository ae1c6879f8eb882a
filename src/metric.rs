// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt::{Display, Error as FmtError, Formatter};

use crate::expr::Expr;

/// Dense identifier of a registered metric. Ids are handed out in
/// registration order starting at zero and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricId(pub u32);

impl MetricId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for MetricId {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        write!(f, "${}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Samples,
    Events,
}

impl Display for MetricUnit {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        match self {
            MetricUnit::Samples => write!(f, "samples"),
            MetricUnit::Events => write!(f, "events"),
        }
    }
}

/// Representation an accumulator is fixed to for the lifetime of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Int = 1,
    Real = 2,
}

impl ValueKind {
    pub(crate) fn from_u8(v: u8) -> Option<ValueKind> {
        match v {
            1 => Some(ValueKind::Int),
            2 => Some(ValueKind::Real),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Real(f64),
}

impl MetricValue {
    /// Result of a computed metric whose expression divides by zero.
    pub const UNDEFINED: MetricValue = MetricValue::Real(f64::NAN);

    pub fn kind(&self) -> ValueKind {
        match self {
            MetricValue::Int(_) => ValueKind::Int,
            MetricValue::Real(_) => ValueKind::Real,
        }
    }

    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => MetricValue::Int(0),
            ValueKind::Real => MetricValue::Real(0.0),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Real(v) => v,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, MetricValue::Real(v) if v.is_nan())
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            MetricValue::Int(v) => v == 0,
            MetricValue::Real(v) => v == 0.0,
        }
    }

    pub(crate) fn to_bits(self) -> u64 {
        match self {
            MetricValue::Int(v) => v as u64,
            MetricValue::Real(v) => v.to_bits(),
        }
    }

    pub(crate) fn from_bits(kind: ValueKind, bits: u64) -> Self {
        match kind {
            ValueKind::Int => MetricValue::Int(bits as i64),
            ValueKind::Real => MetricValue::Real(f64::from_bits(bits)),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Real(v)
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Real(v) if v.is_nan() => write!(f, "-"),
            MetricValue::Real(v) => write!(f, "{:.3}", v),
        }
    }
}

/// Connection between a raw metric and the event that feeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    pub source: String,
    pub event: String,
    /// Events per sample.
    pub period: u64,
    /// Hardware counter index the event is programmed into, when the
    /// source multiplexes a fixed set of counters.
    pub counter: Option<u32>,
}

impl EventBinding {
    pub fn new(source: impl Into<String>, event: impl Into<String>, period: u64) -> Self {
        Self {
            source: source.into(),
            event: event.into(),
            period,
            counter: None,
        }
    }

    pub fn with_counter(mut self, counter: u32) -> Self {
        self.counter = Some(counter);
        self
    }

    pub(crate) fn aliases(&self, other: &EventBinding) -> bool {
        self.counter.is_some()
            && self.counter == other.counter
            && self.source == other.source
            && self.event == other.event
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Raw(EventBinding),
    Computed(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub id: MetricId,
    pub name: String,
    pub unit: MetricUnit,
    pub value_kind: ValueKind,
    pub kind: MetricKind,
}

impl MetricDescriptor {
    pub fn is_raw(&self) -> bool {
        matches!(self.kind, MetricKind::Raw(_))
    }

    pub fn expr(&self) -> Option<&Expr> {
        match &self.kind {
            MetricKind::Computed(expr) => Some(expr),
            MetricKind::Raw(_) => None,
        }
    }
}

impl Display for MetricDescriptor {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        match &self.kind {
            MetricKind::Raw(binding) => write!(
                f,
                "{} [{}] {{{}:{} ev/smpl}}",
                self.name, self.unit, binding.event, binding.period
            ),
            MetricKind::Computed(expr) => write!(f, "{} {{{}}}", self.name, expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;

    #[test]
    fn bits_preserve_sign_and_fraction() {
        let v = MetricValue::Int(-42);
        assert_eq!(MetricValue::from_bits(ValueKind::Int, v.to_bits()), v);

        let v = MetricValue::Real(-0.125);
        assert_eq!(MetricValue::from_bits(ValueKind::Real, v.to_bits()), v);
    }

    #[test]
    fn undefined_is_nan() {
        assert!(MetricValue::UNDEFINED.is_undefined());
        assert!(!MetricValue::Real(1.0).is_undefined());
        assert!(!MetricValue::Int(0).is_undefined());
        assert_eq!(MetricValue::UNDEFINED.to_string(), "-");
    }

    #[test]
    fn describe_raw_and_computed() {
        let raw = MetricDescriptor {
            id: MetricId(0),
            name: "Bytes Allocated".to_owned(),
            unit: MetricUnit::Events,
            value_kind: ValueKind::Int,
            kind: MetricKind::Raw(EventBinding::new("memleak", "MEMLEAK", 1)),
        };
        assert_eq!(
            raw.to_string(),
            "Bytes Allocated [events] {MEMLEAK:1 ev/smpl}"
        );

        let computed = MetricDescriptor {
            id: MetricId(2),
            name: "Bytes Leaked".to_owned(),
            unit: MetricUnit::Events,
            value_kind: ValueKind::Int,
            kind: MetricKind::Computed(Expr::binary(
                BinaryOp::Sub,
                Expr::Leaf(MetricId(0)),
                Expr::Leaf(MetricId(1)),
            )),
        };
        assert_eq!(computed.to_string(), "Bytes Leaked {($0 - $1)}");
        assert!(computed.expr().is_some());
        assert!(!computed.is_raw());
    }

    #[test]
    fn counter_aliasing() {
        let a = EventBinding::new("papi", "PAPI_TOT_CYC", 100);
        let b = EventBinding::new("papi", "PAPI_TOT_CYC", 1000);
        assert!(!a.aliases(&b));

        let a = a.with_counter(0);
        let b = b.with_counter(0);
        assert!(a.aliases(&b));
        assert!(!a.aliases(&b.clone().with_counter(1)));
    }
}
