use rstar::{RTree, primitives::GeomWithData};

use crate::{
    coordinates::{Axis, AxisName, Dimension},
    error::{Error, Result},
};

type TreePoint = GeomWithData<[f64; 2], usize>;

/// For each destination point, the index of the nearest finite source point
/// within `bound`, or `None` (which becomes NaN downstream).
pub(crate) fn nearest_mapping(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    bound: Option<f64>,
) -> Vec<Option<usize>> {
    let points: Vec<TreePoint> = src
        .iter()
        .enumerate()
        .filter(|(_, p)| p[0].is_finite() && p[1].is_finite())
        .map(|(i, &p)| TreePoint::new(p, i))
        .collect();
    let tree = RTree::bulk_load(points);
    let bound_sq = bound.map(|b| b * b);

    dst.iter()
        .map(|q| {
            if !q[0].is_finite() || !q[1].is_finite() {
                return None;
            }
            let hit = tree.nearest_neighbor(q)?;
            let (dx, dy) = (hit.geom()[0] - q[0], hit.geom()[1] - q[1]);
            match bound_sq {
                Some(b) if dx * dx + dy * dy > b => None,
                _ => Some(hit.data),
            }
        })
        .collect()
}

/// Row-major (lat, lon) cell centers of a grid.
pub(crate) fn grid_points(lat: &Axis, lon: &Axis) -> Result<Vec<[f64; 2]>> {
    fn numeric(axis: &Axis) -> Result<&[f64]> {
        axis.values_f64()
            .ok_or_else(|| Error::InvalidCoordinates("spatial axes must be numeric".into()))
    }
    let lats = numeric(lat)?;
    let lons = numeric(lon)?;
    let mut out = Vec::with_capacity(lats.len() * lons.len());
    for &a in lats {
        for &b in lons {
            out.push([a, b]);
        }
    }
    Ok(out)
}

/// The co-indexed (lat, lon) points of a stacked dimension.
pub(crate) fn stacked_points(dim: &Dimension) -> Result<Vec<[f64; 2]>> {
    let axis_values = |name: AxisName| {
        dim.axis(name)
            .and_then(Axis::values_f64)
            .ok_or_else(|| {
                Error::InvalidCoordinates(format!(
                    "stacked dimension '{}' lacks a numeric '{name}' axis",
                    dim.name()
                ))
            })
    };
    let lats = axis_values(AxisName::Lat)?;
    let lons = axis_values(AxisName::Lon)?;
    Ok(lats.iter().zip(lons).map(|(&a, &b)| [a, b]).collect())
}

/// Per-cell spacing ‖δ‖ of a destination grid, from the mean absolute step
/// of each axis. `None` when the grid is degenerate.
pub(crate) fn grid_spacing(lat: &Axis, lon: &Axis) -> Option<f64> {
    let spacing = |axis: &Axis| {
        let v = axis.values_f64()?;
        if v.len() < 2 {
            return Some(0.0);
        }
        let total: f64 = v.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        Some(total / (v.len() - 1) as f64)
    };
    let d = f64::hypot(spacing(lat)?, spacing(lon)?);
    (d.is_finite() && d > 0.0).then_some(d)
}

/// Mean consecutive spacing of a destination point set.
pub(crate) fn points_spacing(points: &[[f64; 2]]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let total: f64 = points
        .windows(2)
        .map(|w| f64::hypot(w[1][0] - w[0][0], w[1][1] - w[0][1]))
        .sum();
    let d = total / (points.len() - 1) as f64;
    (d.is_finite() && d > 0.0).then_some(d)
}

/// Applies a mapping to one flattened slab of source values.
pub(crate) fn gather(slab: &[f64], mapping: &[Option<usize>]) -> Vec<f64> {
    mapping.iter().map(|m| m.map_or(f64::NAN, |i| slab[i])).collect()
}
