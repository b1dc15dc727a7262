use std::fmt::{Display, Formatter};

use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    coordinates::IndexSel,
    error::{Error, Result},
};

/// Relative tolerance for the uniform-spacing test on numeric axes.
const UNIFORM_RTOL: f64 = 1e-9;

const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisName {
    Lat,
    Lon,
    Alt,
    Time,
}

impl AxisName {
    pub fn as_str(self) -> &'static str {
        match self {
            AxisName::Lat => "lat",
            AxisName::Lon => "lon",
            AxisName::Alt => "alt",
            AxisName::Time => "time",
        }
    }

    pub fn parse(s: &str) -> Result<AxisName> {
        match s {
            "lat" => Ok(AxisName::Lat),
            "lon" => Ok(AxisName::Lon),
            "alt" => Ok(AxisName::Alt),
            "time" => Ok(AxisName::Time),
            other => Err(Error::InvalidCoordinates(format!(
                "invalid axis name '{other}' (expected lat, lon, alt or time)"
            ))),
        }
    }
}

impl Display for AxisName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single coordinate value: numeric, or a time instant in nanoseconds
/// since the Unix epoch.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Coord {
    Number(f64),
    Time(i64),
}

impl Coord {
    pub fn as_number(self) -> Option<f64> {
        match self {
            Coord::Number(v) => Some(v),
            Coord::Time(_) => None,
        }
    }

    pub fn as_time_ns(self) -> Option<i64> {
        match self {
            Coord::Time(ns) => Some(ns),
            Coord::Number(_) => None,
        }
    }
}

impl Display for Coord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Coord::Number(v) => write!(f, "{v}"),
            Coord::Time(ns) => f.write_str(&format_time(*ns)),
        }
    }
}

/// Spacing between consecutive axis values.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Step {
    Number(f64),
    Nanos(i64),
}

impl Step {
    pub fn abs_f64(self) -> f64 {
        match self {
            Step::Number(v) => v.abs(),
            Step::Nanos(ns) => ns.abs() as f64,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Days,
    Hours,
    Minutes,
    Seconds,
    Months,
    Years,
}

impl TimeUnit {
    pub fn parse(s: &str) -> Result<TimeUnit> {
        match s {
            "D" => Ok(TimeUnit::Days),
            "h" => Ok(TimeUnit::Hours),
            "m" => Ok(TimeUnit::Minutes),
            "s" => Ok(TimeUnit::Seconds),
            "M" => Ok(TimeUnit::Months),
            "Y" => Ok(TimeUnit::Years),
            other => Err(Error::InvalidCoordinates(format!(
                "invalid time unit '{other}' (expected D, h, m, s, M or Y)"
            ))),
        }
    }
}

/// A signed boundary offset applied to axis values.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Offset {
    Number(f64),
    Time { count: i64, unit: TimeUnit },
}

impl Offset {
    /// Parses the `"1,D"` spelling used for time boundaries.
    pub fn from_time_str(s: &str) -> Result<Offset> {
        let (count, unit) = s.split_once(',').ok_or_else(|| {
            Error::InvalidCoordinates(format!("invalid time offset '{s}' (expected 'count,unit')"))
        })?;
        let count: i64 = count.trim().parse().map_err(|_| {
            Error::InvalidCoordinates(format!("invalid time offset count in '{s}'"))
        })?;
        Ok(Offset::Time { count, unit: TimeUnit::parse(unit.trim())? })
    }

    pub fn negated(self) -> Offset {
        match self {
            Offset::Number(v) => Offset::Number(-v),
            Offset::Time { count, unit } => Offset::Time { count: -count, unit },
        }
    }
}

/// Per-axis cell extents used by [`Axis::area_bounds`].
#[derive(Debug, Clone, PartialEq)]
pub enum Boundary {
    /// Point data, no extent.
    Point,
    /// Symmetric extent on both sides.
    Uniform(Offset),
    /// Signed low/high offsets applied to the min/max value.
    Segment(Offset, Offset),
    /// A flat list of signed vertex offsets; the envelope applies.
    Polygon(Vec<Offset>),
    /// One (low, high) offset pair per axis value; per-vertex envelope.
    PerPoint(Vec<(Offset, Offset)>),
}

/// Axis values, sum-typed by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum AxisValues {
    Number(Vec<f64>),
    Time(Vec<i64>),
}

impl AxisValues {
    pub fn len(&self) -> usize {
        match self {
            AxisValues::Number(v) => v.len(),
            AxisValues::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_time(&self) -> bool {
        matches!(self, AxisValues::Time(_))
    }

    pub fn get(&self, i: usize) -> Coord {
        match self {
            AxisValues::Number(v) => Coord::Number(v[i]),
            AxisValues::Time(v) => Coord::Time(v[i]),
        }
    }

    fn take(&self, sel: &IndexSel) -> AxisValues {
        match self {
            AxisValues::Number(v) => AxisValues::Number(sel.iter().map(|i| v[i]).collect()),
            AxisValues::Time(v) => AxisValues::Time(sel.iter().map(|i| v[i]).collect()),
        }
    }
}

impl From<Vec<f64>> for AxisValues {
    fn from(v: Vec<f64>) -> Self {
        AxisValues::Number(v)
    }
}

impl From<&[f64]> for AxisValues {
    fn from(v: &[f64]) -> Self {
        AxisValues::Number(v.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for AxisValues {
    fn from(v: [f64; N]) -> Self {
        AxisValues::Number(v.to_vec())
    }
}

/// A named 1-D coordinate axis.
///
/// Classification (monotonic / descending / uniform) runs at construction
/// and is kept consistent with the values by every transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    name: AxisName,
    values: AxisValues,
    is_monotonic: bool,
    is_descending: bool,
    is_uniform: bool,
    step: Option<Step>,
}

impl Axis {
    pub fn from_values(name: AxisName, values: impl Into<AxisValues>) -> Result<Axis> {
        let values = values.into();
        if values.is_time() != (name == AxisName::Time) {
            return Err(Error::InvalidCoordinates(format!(
                "axis '{name}' dtype mismatch: time values belong to the time axis only"
            )));
        }
        Ok(Axis::rebuild(name, values))
    }

    /// Uniform numeric axis; `size = floor((stop - start) / step) + 1`.
    pub fn uniform(name: AxisName, start: f64, stop: f64, step: f64) -> Result<Axis> {
        if !step.is_finite() || step == 0.0 {
            return Err(Error::InvalidCoordinates(format!("invalid axis step {step}")));
        }
        let span = (stop - start) / step;
        if span < 0.0 {
            return Err(Error::InvalidCoordinates(format!(
                "axis step {step} points away from stop {stop} (start {start})"
            )));
        }
        let size = (span + UNIFORM_RTOL).floor() as usize + 1;
        let values: Vec<f64> = (0..size).map(|i| start + i as f64 * step).collect();
        Axis::from_values(name, values)
    }

    /// Uniform time axis with a fixed nanosecond step.
    pub fn uniform_time(start_ns: i64, stop_ns: i64, step_ns: i64) -> Result<Axis> {
        if step_ns == 0 || (stop_ns - start_ns).signum() * step_ns.signum() < 0 {
            return Err(Error::InvalidCoordinates(format!("invalid time axis step {step_ns}")));
        }
        let size = ((stop_ns - start_ns) / step_ns) as usize + 1;
        let values: Vec<i64> = (0..size as i64).map(|i| start_ns + i * step_ns).collect();
        Ok(Axis::rebuild(AxisName::Time, AxisValues::Time(values)))
    }

    /// `size` evenly spaced values from `start` to `stop` inclusive.
    pub fn linspace(name: AxisName, start: f64, stop: f64, size: usize) -> Result<Axis> {
        let values: Vec<f64> = match size {
            0 => Vec::new(),
            1 => vec![start],
            n => {
                let step = (stop - start) / (n - 1) as f64;
                (0..n).map(|i| start + i as f64 * step).collect()
            }
        };
        Axis::from_values(name, values)
    }

    /// Time axis from ISO-8601 strings.
    pub fn from_iso(values: &[&str]) -> Result<Axis> {
        let ns = values.iter().map(|s| parse_time(s)).collect::<Result<Vec<_>>>()?;
        Ok(Axis::rebuild(AxisName::Time, AxisValues::Time(ns)))
    }

    fn rebuild(name: AxisName, values: AxisValues) -> Axis {
        let flags = match &values {
            AxisValues::Number(v) => classify_f64(v),
            AxisValues::Time(v) => classify_time(v),
        };
        Axis {
            name,
            values,
            is_monotonic: flags.monotonic,
            is_descending: flags.descending,
            is_uniform: flags.uniform,
            step: flags.step,
        }
    }

    pub fn name(&self) -> AxisName {
        self.name
    }

    pub fn values(&self) -> &AxisValues {
        &self.values
    }

    pub fn values_f64(&self) -> Option<&[f64]> {
        match &self.values {
            AxisValues::Number(v) => Some(v),
            AxisValues::Time(_) => None,
        }
    }

    pub fn values_time(&self) -> Option<&[i64]> {
        match &self.values {
            AxisValues::Time(v) => Some(v),
            AxisValues::Number(_) => None,
        }
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_monotonic(&self) -> bool {
        self.is_monotonic
    }

    pub fn is_descending(&self) -> bool {
        self.is_descending
    }

    pub fn is_uniform(&self) -> bool {
        self.is_uniform
    }

    pub fn step(&self) -> Option<Step> {
        self.step
    }

    pub fn get(&self, i: usize) -> Coord {
        self.values.get(i)
    }

    /// `[min, max]` skipping NaN; `None` for an empty (or all-NaN) axis.
    pub fn bounds(&self) -> Option<(Coord, Coord)> {
        match &self.values {
            AxisValues::Number(v) => {
                let mut it = v.iter().copied().filter(|x| !x.is_nan());
                let first = it.next()?;
                let (min, max) = it.fold((first, first), |(lo, hi), x| (lo.min(x), hi.max(x)));
                Some((Coord::Number(min), Coord::Number(max)))
            }
            AxisValues::Time(v) => {
                let min = *v.iter().min()?;
                let max = *v.iter().max()?;
                Some((Coord::Time(min), Coord::Time(max)))
            }
        }
    }

    /// Order-preserving sub-axis whose values fall within `bounds`
    /// (inclusive). With `outer`, each bound is widened to the nearest value
    /// beyond it when one exists. Backwards or disjoint bounds select
    /// nothing.
    pub fn select(&self, bounds: (Coord, Coord), outer: bool) -> Result<(Axis, IndexSel)> {
        let sel = match (&self.values, bounds) {
            (AxisValues::Number(v), (Coord::Number(lo), Coord::Number(hi))) => {
                select_impl(v, lo, hi, outer, self.is_monotonic, self.is_descending, |x| {
                    !x.is_nan()
                })
            }
            (AxisValues::Time(v), (Coord::Time(lo), Coord::Time(hi))) => {
                select_impl(v, lo, hi, outer, self.is_monotonic, self.is_descending, |_| true)
            }
            _ => {
                return Err(Error::InvalidCoordinates(format!(
                    "cannot select axis '{}' with mismatched bound dtype",
                    self.name
                )));
            }
        };
        Ok((self.take(&sel), sel))
    }

    /// [`select`](Axis::select) against another axis's bounds. An empty
    /// `other` selects nothing.
    pub fn intersect(&self, other: &Axis, outer: bool) -> Result<(Axis, IndexSel)> {
        match other.bounds() {
            Some(bounds) => self.select(bounds, outer),
            None => Ok((self.take(&IndexSel::empty()), IndexSel::empty())),
        }
    }

    /// Boolean inclusion mask for `bounds`, with the same widening rules as
    /// [`select`](Axis::select). Used pointwise for stacked dimensions.
    pub fn select_mask(&self, bounds: (Coord, Coord), outer: bool) -> Result<Vec<bool>> {
        let (_, sel) = self.select(bounds, outer)?;
        let mut mask = vec![false; self.size()];
        for i in sel.iter() {
            mask[i] = true;
        }
        Ok(mask)
    }

    /// Out-of-range positions are a fatal error for the caller.
    pub fn take(&self, sel: &IndexSel) -> Axis {
        Axis::rebuild(self.name, self.values.take(sel))
    }

    /// `[min - δ⁻, max + δ⁺]` after widening by per-cell boundary offsets.
    pub fn area_bounds(&self, boundary: &Boundary) -> Result<Option<(Coord, Coord)>> {
        let Some((min, max)) = self.bounds() else {
            return Ok(None);
        };
        let bounds = match boundary {
            Boundary::Point => (min, max),
            Boundary::Uniform(off) => (add_offset(min, off.negated())?, add_offset(max, *off)?),
            Boundary::Segment(lo, hi) => (add_offset(min, *lo)?, add_offset(max, *hi)?),
            Boundary::Polygon(offsets) => {
                let mut lo = min;
                let mut hi = max;
                for off in offsets {
                    lo = coord_min(lo, add_offset(min, *off)?);
                    hi = coord_max(hi, add_offset(max, *off)?);
                }
                (lo, hi)
            }
            Boundary::PerPoint(pairs) => {
                if pairs.len() != self.size() {
                    return Err(Error::InvalidCoordinates(format!(
                        "axis '{}' has {} values but {} boundary pairs",
                        self.name,
                        self.size(),
                        pairs.len()
                    )));
                }
                let mut lo: Option<Coord> = None;
                let mut hi: Option<Coord> = None;
                for (i, (off_lo, off_hi)) in pairs.iter().enumerate() {
                    let v = self.values.get(i);
                    if matches!(v, Coord::Number(x) if x.is_nan()) {
                        continue;
                    }
                    let cand_lo = add_offset(v, *off_lo)?;
                    let cand_hi = add_offset(v, *off_hi)?;
                    lo = Some(lo.map_or(cand_lo, |cur| coord_min(cur, cand_lo)));
                    hi = Some(hi.map_or(cand_hi, |cur| coord_max(cur, cand_hi)));
                }
                match (lo, hi) {
                    (Some(lo), Some(hi)) => (lo, hi),
                    _ => return Ok(None),
                }
            }
        };
        Ok(Some(bounds))
    }

    pub fn definition(&self) -> serde_json::Value {
        let name = self.name.as_str();
        if self.is_uniform && self.size() >= 2 {
            match (&self.values, self.step) {
                (AxisValues::Number(v), Some(Step::Number(step))) => {
                    return json!({
                        "name": name,
                        "start": v[0],
                        "stop": v[v.len() - 1],
                        "step": step,
                    });
                }
                (AxisValues::Time(v), Some(Step::Nanos(step))) => {
                    return json!({
                        "name": name,
                        "start": format_time(v[0]),
                        "stop": format_time(v[v.len() - 1]),
                        "step_ns": step,
                    });
                }
                _ => {}
            }
        }
        match &self.values {
            AxisValues::Number(v) => json!({ "name": name, "values": v }),
            AxisValues::Time(v) => json!({
                "name": name,
                "values": v.iter().map(|&ns| format_time(ns)).collect::<Vec<_>>(),
            }),
        }
    }
}

struct Flags {
    monotonic: bool,
    descending: bool,
    uniform: bool,
    step: Option<Step>,
}

fn classify_f64(v: &[f64]) -> Flags {
    if v.iter().any(|x| x.is_nan()) {
        return Flags { monotonic: false, descending: false, uniform: false, step: None };
    }
    match v.len() {
        0 => Flags { monotonic: true, descending: false, uniform: false, step: None },
        1 => Flags { monotonic: true, descending: false, uniform: true, step: None },
        _ => {
            let ascending = v.windows(2).all(|w| w[1] > w[0]);
            let descending = v.windows(2).all(|w| w[1] < w[0]);
            let step = v[1] - v[0];
            let uniform = (ascending || descending)
                && v.windows(2).all(|w| ((w[1] - w[0]) - step).abs() <= UNIFORM_RTOL * step.abs());
            Flags {
                monotonic: ascending || descending,
                descending,
                uniform,
                step: uniform.then_some(Step::Number(step)),
            }
        }
    }
}

fn classify_time(v: &[i64]) -> Flags {
    match v.len() {
        0 => Flags { monotonic: true, descending: false, uniform: false, step: None },
        1 => Flags { monotonic: true, descending: false, uniform: true, step: None },
        _ => {
            let ascending = v.windows(2).all(|w| w[1] > w[0]);
            let descending = v.windows(2).all(|w| w[1] < w[0]);
            let step = v[1] - v[0];
            // time diffs compare exactly, as integer nanoseconds
            let uniform = (ascending || descending) && v.windows(2).all(|w| w[1] - w[0] == step);
            Flags {
                monotonic: ascending || descending,
                descending,
                uniform,
                step: uniform.then_some(Step::Nanos(step)),
            }
        }
    }
}

fn select_impl<T: PartialOrd + Copy>(
    v: &[T],
    lo: T,
    hi: T,
    outer: bool,
    monotonic: bool,
    descending: bool,
    valid: impl Fn(T) -> bool,
) -> IndexSel {
    if v.is_empty() || !(lo <= hi) {
        return IndexSel::empty();
    }

    let (lo, hi) = if outer {
        // widen each bound to the nearest value beyond it, when one exists
        let mut below: Option<T> = None;
        let mut above: Option<T> = None;
        for &x in v {
            if !valid(x) {
                continue;
            }
            if x < lo && below.is_none_or(|b| x > b) {
                below = Some(x);
            }
            if x > hi && above.is_none_or(|a| x < a) {
                above = Some(x);
            }
        }
        (below.unwrap_or(lo), above.unwrap_or(hi))
    } else {
        (lo, hi)
    };

    if monotonic && v.len() > 1 {
        let (start, end) = if descending {
            (v.partition_point(|&x| x > hi), v.partition_point(|&x| x >= lo))
        } else {
            (v.partition_point(|&x| x < lo), v.partition_point(|&x| x <= hi))
        };
        if start >= end {
            IndexSel::empty()
        } else {
            IndexSel::Slice { start, end, step: 1 }
        }
    } else {
        let ix: Vec<usize> = v
            .iter()
            .enumerate()
            .filter(|&(_, &x)| valid(x) && lo <= x && x <= hi)
            .map(|(i, _)| i)
            .collect();
        IndexSel::Indices(ix)
    }
}

fn coord_min(a: Coord, b: Coord) -> Coord {
    match (a, b) {
        (Coord::Number(x), Coord::Number(y)) => Coord::Number(x.min(y)),
        (Coord::Time(x), Coord::Time(y)) => Coord::Time(x.min(y)),
        (a, _) => a,
    }
}

fn coord_max(a: Coord, b: Coord) -> Coord {
    match (a, b) {
        (Coord::Number(x), Coord::Number(y)) => Coord::Number(x.max(y)),
        (Coord::Time(x), Coord::Time(y)) => Coord::Time(x.max(y)),
        (a, _) => a,
    }
}

fn add_offset(value: Coord, offset: Offset) -> Result<Coord> {
    match (value, offset) {
        (Coord::Number(v), Offset::Number(d)) => Ok(Coord::Number(v + d)),
        (Coord::Time(ns), Offset::Time { count, unit }) => {
            Ok(Coord::Time(add_time(ns, count, unit)?))
        }
        _ => Err(Error::InvalidCoordinates(
            "boundary offset dtype does not match axis dtype".into(),
        )),
    }
}

/// Calendar-aware for months and years; fixed durations otherwise.
fn add_time(ns: i64, count: i64, unit: TimeUnit) -> Result<i64> {
    let fixed = |scale: i64| {
        count
            .checked_mul(scale)
            .and_then(|d| ns.checked_add(d))
            .ok_or_else(|| Error::InvalidCoordinates("time offset out of range".into()))
    };
    match unit {
        TimeUnit::Seconds => fixed(NS_PER_SEC),
        TimeUnit::Minutes => fixed(60 * NS_PER_SEC),
        TimeUnit::Hours => fixed(3600 * NS_PER_SEC),
        TimeUnit::Days => fixed(86_400 * NS_PER_SEC),
        TimeUnit::Months => add_months(ns, count),
        TimeUnit::Years => add_months(ns, count.checked_mul(12).unwrap_or(i64::MAX)),
    }
}

fn add_months(ns: i64, count: i64) -> Result<i64> {
    let out_of_range = || Error::InvalidCoordinates("time offset out of range".into());
    let dt = DateTime::from_timestamp_nanos(ns);
    let months = Months::new(count.unsigned_abs().try_into().map_err(|_| out_of_range())?);
    let shifted = if count >= 0 {
        dt.checked_add_months(months)
    } else {
        dt.checked_sub_months(months)
    }
    .ok_or_else(out_of_range)?;
    shifted.timestamp_nanos_opt().ok_or_else(out_of_range)
}

/// ISO-8601 (date or datetime) to nanoseconds since the epoch.
pub fn parse_time(s: &str) -> Result<i64> {
    let invalid = || Error::InvalidCoordinates(format!("invalid time value '{s}'"));

    let naive = if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        d.and_hms_opt(0, 0, 0).ok_or_else(invalid)?
    } else {
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .ok_or_else(invalid)?
    };
    naive.and_utc().timestamp_nanos_opt().ok_or_else(invalid)
}

pub fn format_time(ns: i64) -> String {
    DateTime::from_timestamp_nanos(ns).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
