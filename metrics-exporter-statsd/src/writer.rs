use std::{
    fmt::{self, Write as _},
    str::FromStr,
};

use crate::{error::Error, queue::DataPoint};

// Largest magnitude below which every integral `f64` is exactly representable as an integer.
const MAX_EXACT_INTEGRAL_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Kind of a stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatKind {
    /// A counter, sent with the `c` type.
    Counter,

    /// A gauge, sent with the `g` type.
    Gauge,
}

impl StatKind {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            StatKind::Counter => b"|c\n",
            StatKind::Gauge => b"|g\n",
        }
    }

    /// Returns the name of this kind, as accepted by [`StatKind::from_str`].
    pub const fn as_str(self) -> &'static str {
        match self {
            StatKind::Counter => "counter",
            StatKind::Gauge => "gauge",
        }
    }
}

impl FromStr for StatKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(StatKind::Counter),
            "gauge" => Ok(StatKind::Gauge),
            other => Err(Error::UnsupportedStatKind { kind: other.to_owned() }),
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a stat.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// A signed integer.
    Integer(i64),

    /// An unsigned integer.
    Unsigned(u64),

    /// A floating-point number.
    FloatingPoint(f64),
}

macro_rules! impl_from_for_metric_value {
    ($variant:ident as $target:ty: $($source:ty),+) => {
        $(
            impl From<$source> for MetricValue {
                fn from(value: $source) -> Self {
                    MetricValue::$variant(<$target>::from(value))
                }
            }
        )+
    };
}

impl_from_for_metric_value!(Integer as i64: i8, i16, i32, i64);
impl_from_for_metric_value!(Unsigned as u64: u8, u16, u32, u64);
impl_from_for_metric_value!(FloatingPoint as f64: f32, f64);

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        MetricValue::Unsigned(value as u64)
    }
}

/// Formats metric values without intermediate allocations.
pub(crate) struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
    large_writer: String,
}

impl MetricValueFormatter {
    pub fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new(), large_writer: String::new() }
    }

    /// Formats the value the way a number prints by default: integral floats lose their fractional part (`5.0`
    /// becomes `5`, `1e20` becomes `100000000000000000000`), and everything else uses the shortest representation
    /// that round-trips.
    ///
    /// Non-finite values come out as `inf`, `-inf` and `NaN`. No statsd aggregator accepts them, so they are sent as
    /// is rather than being given a spelling of their own.
    pub fn format(&mut self, value: MetricValue) -> &str {
        match value {
            MetricValue::Integer(v) => self.int_writer.format(v),
            MetricValue::Unsigned(v) => self.int_writer.format(v),
            MetricValue::FloatingPoint(v) if v.fract() == 0.0 && v.abs() < MAX_EXACT_INTEGRAL_FLOAT => {
                self.int_writer.format(v as i64)
            }
            MetricValue::FloatingPoint(v) if v.fract() == 0.0 => {
                self.large_writer.clear();
                // Writing to a `String` cannot fail.
                let _ = write!(self.large_writer, "{v}");
                &self.large_writer
            }
            MetricValue::FloatingPoint(v) => self.float_writer.format(v),
        }
    }
}

/// Encodes data points into the statsd line protocol.
pub(crate) struct LineWriter {
    formatter: MetricValueFormatter,
}

impl LineWriter {
    pub fn new() -> Self {
        Self { formatter: MetricValueFormatter::new() }
    }

    /// Appends the line for `point` to `buf`: `<name>:<value>|c\n` for counters, `<name>:<value>|g\n` for gauges.
    pub fn encode(&mut self, point: &DataPoint, buf: &mut Vec<u8>) {
        buf.extend_from_slice(point.stat_name.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(self.formatter.format(point.value).as_bytes());
        buf.extend_from_slice(point.kind.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use quanta::Clock;

    use super::{LineWriter, MetricValue, StatKind};
    use crate::{error::Error, queue::DataPoint};

    fn encoded(kind: StatKind, stat_name: &str, value: MetricValue) -> String {
        let (clock, _) = Clock::mock();
        let point = DataPoint::new(kind, stat_name.to_string(), value, clock.now());

        let mut writer = LineWriter::new();
        let mut buf = Vec::new();
        writer.encode(&point, &mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn counter_and_gauge() {
        assert_eq!(encoded(StatKind::Counter, "a.b", 5.into()), "a.b:5|c\n");
        assert_eq!(encoded(StatKind::Gauge, "a.b", 5.into()), "a.b:5|g\n");
    }

    #[test]
    fn values() {
        // Cases are defined as: metric value, expected output.
        let cases = [
            (MetricValue::from(-12i32), "stat:-12|g\n"),
            (MetricValue::from(u64::MAX), "stat:18446744073709551615|g\n"),
            (MetricValue::from(42.0f64), "stat:42|g\n"),
            (MetricValue::from(-0.0f64), "stat:0|g\n"),
            (MetricValue::from(3.13232f64), "stat:3.13232|g\n"),
            (MetricValue::from(0.5f32), "stat:0.5|g\n"),
            (MetricValue::from(1e20f64), "stat:100000000000000000000|g\n"),
            (MetricValue::from(-9_007_199_254_740_992.0f64), "stat:-9007199254740992|g\n"),
            (MetricValue::from(1.5e-7f64), "stat:1.5e-7|g\n"),
            (MetricValue::from(f64::INFINITY), "stat:inf|g\n"),
            (MetricValue::from(f64::NAN), "stat:NaN|g\n"),
        ];

        for (value, expected) in cases {
            assert_eq!(encoded(StatKind::Gauge, "stat", value), expected);
        }
    }

    #[test]
    fn lines_are_appended() {
        let (clock, _) = Clock::mock();
        let mut writer = LineWriter::new();
        let mut buf = Vec::new();

        let first = DataPoint::new(StatKind::Counter, "one".into(), 1.into(), clock.now());
        let second = DataPoint::new(StatKind::Gauge, "two".into(), 2.5.into(), clock.now());
        writer.encode(&first, &mut buf);
        writer.encode(&second, &mut buf);

        assert_eq!(buf, b"one:1|c\ntwo:2.5|g\n");
    }

    #[test]
    fn stat_kind_from_str() {
        assert_eq!("counter".parse::<StatKind>().unwrap(), StatKind::Counter);
        assert_eq!("gauge".parse::<StatKind>().unwrap(), StatKind::Gauge);

        match "timer".parse::<StatKind>() {
            Err(Error::UnsupportedStatKind { kind }) => assert_eq!(kind, "timer"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
