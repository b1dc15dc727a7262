use itertools::Itertools;
use serde_json::json;

use crate::{
    coordinates::{Axis, AxisName, IndexSel},
    error::{Error, Result},
};

/// One dimension of a [`CoordinateSet`]: a single named axis declaring a
/// grid direction, or a tuple of co-indexed axes declaring a point set.
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Single(Axis),
    Stacked(Vec<Axis>),
}

impl Dimension {
    /// Axis names joined by `_` within stacks, e.g. `lat_lon`.
    pub fn name(&self) -> String {
        match self {
            Dimension::Single(axis) => axis.name().to_string(),
            Dimension::Stacked(axes) => axes.iter().map(|a| a.name().as_str()).join("_"),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Dimension::Single(axis) => axis.size(),
            Dimension::Stacked(axes) => axes.first().map_or(0, Axis::size),
        }
    }

    pub fn is_stacked(&self) -> bool {
        matches!(self, Dimension::Stacked(_))
    }

    pub fn axes(&self) -> &[Axis] {
        match self {
            Dimension::Single(axis) => std::slice::from_ref(axis),
            Dimension::Stacked(axes) => axes,
        }
    }

    pub fn axis(&self, name: AxisName) -> Option<&Axis> {
        self.axes().iter().find(|a| a.name() == name)
    }

    pub fn take(&self, sel: &IndexSel) -> Dimension {
        match self {
            Dimension::Single(axis) => Dimension::Single(axis.take(sel)),
            Dimension::Stacked(axes) => {
                Dimension::Stacked(axes.iter().map(|a| a.take(sel)).collect())
            }
        }
    }

    pub fn definition(&self) -> serde_json::Value {
        match self {
            Dimension::Single(axis) => axis.definition(),
            Dimension::Stacked(axes) => {
                json!({ "stacked": axes.iter().map(Axis::definition).collect::<Vec<_>>() })
            }
        }
    }
}

impl From<Axis> for Dimension {
    fn from(axis: Axis) -> Self {
        Dimension::Single(axis)
    }
}

/// An ordered, immutable collection of dimensions describing a grid (with
/// stacked dimensions contributing a single point-set length each). All
/// transformations return new values.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateSet {
    dims: Vec<Dimension>,
}

impl CoordinateSet {
    pub fn new(dims: Vec<Dimension>) -> Result<CoordinateSet> {
        for dim in &dims {
            if let Dimension::Stacked(axes) = dim {
                if axes.is_empty() {
                    return Err(Error::InvalidCoordinates(
                        "stacked dimension must contain at least one axis".into(),
                    ));
                }
                if axes.iter().any(|a| a.size() != axes[0].size()) {
                    return Err(Error::InvalidCoordinates(format!(
                        "stacked dimension '{}' axes differ in length",
                        dim.name()
                    )));
                }
            }
        }

        let names: Vec<AxisName> =
            dims.iter().flat_map(|d| d.axes().iter().map(Axis::name)).collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::InvalidCoordinates(format!("duplicate dimension '{name}'")));
            }
        }

        Ok(CoordinateSet { dims })
    }

    pub fn from_axes(axes: impl IntoIterator<Item = Axis>) -> Result<CoordinateSet> {
        CoordinateSet::new(axes.into_iter().map(Dimension::Single).collect())
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(Dimension::size).collect()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().map(Dimension::size).product()
    }

    pub fn dim_names(&self) -> Vec<String> {
        self.dims.iter().map(Dimension::name).collect()
    }

    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name() == name)
    }

    /// Finds an axis anywhere in the set, inside stacks included.
    pub fn axis(&self, name: AxisName) -> Option<&Axis> {
        self.dims.iter().find_map(|d| d.axis(name))
    }

    /// The axis only if it forms its own (unstacked) dimension.
    pub fn single_axis(&self, name: AxisName) -> Option<&Axis> {
        self.dims.iter().find_map(|d| match d {
            Dimension::Single(axis) if axis.name() == name => Some(axis),
            _ => None,
        })
    }

    /// Per-dimension intersection with the bounds of `other`'s same-named
    /// axes. Dimensions with no counterpart in `other` pass through whole.
    /// For a stacked dimension the mask is the pointwise intersection of
    /// each member axis's selection.
    pub fn intersect(
        &self,
        other: &CoordinateSet,
        outer: bool,
    ) -> Result<(CoordinateSet, Vec<IndexSel>)> {
        let mut dims = Vec::with_capacity(self.dims.len());
        let mut sels = Vec::with_capacity(self.dims.len());

        for dim in &self.dims {
            let sel = match dim {
                Dimension::Single(axis) => match other.axis(axis.name()) {
                    Some(other_axis) => axis.intersect(other_axis, outer)?.1,
                    None => IndexSel::full(axis.size()),
                },
                Dimension::Stacked(axes) => {
                    let mut mask: Option<Vec<bool>> = None;
                    for axis in axes {
                        let Some(other_axis) = other.axis(axis.name()) else { continue };
                        let axis_mask = match other_axis.bounds() {
                            Some(bounds) => axis.select_mask(bounds, outer)?,
                            None => vec![false; axis.size()],
                        };
                        mask = Some(match mask {
                            None => axis_mask,
                            Some(m) => {
                                m.iter().zip(&axis_mask).map(|(&a, &b)| a && b).collect()
                            }
                        });
                    }
                    match mask {
                        None => IndexSel::full(dim.size()),
                        Some(mask) => IndexSel::Indices(
                            mask.iter().positions(|&keep| keep).collect(),
                        ),
                    }
                }
            };
            dims.push(dim.take(&sel));
            sels.push(sel);
        }

        Ok((CoordinateSet { dims }, sels))
    }

    /// Applies one selection per dimension. A length mismatch is a fatal
    /// error for the caller.
    pub fn take(&self, sels: &[IndexSel]) -> CoordinateSet {
        assert_eq!(sels.len(), self.ndim(), "one index selection per dimension");
        let dims = self.dims.iter().zip(sels).map(|(d, sel)| d.take(sel)).collect();
        CoordinateSet { dims }
    }

    /// Flattens stacked dimensions into their constituent axes as separate
    /// grid dimensions.
    pub fn unstack(&self) -> CoordinateSet {
        let dims = self
            .dims
            .iter()
            .flat_map(|d| d.axes().iter().cloned().map(Dimension::Single))
            .collect();
        CoordinateSet { dims }
    }

    /// Stacks the named single dimensions (in the given order) into one
    /// point-set dimension at the position of the first.
    pub fn stack(&self, names: &[AxisName]) -> Result<CoordinateSet> {
        if names.is_empty() {
            return Err(Error::InvalidCoordinates("stack needs at least one axis name".into()));
        }
        let mut positions = Vec::with_capacity(names.len());
        for &name in names {
            let i = self
                .dims
                .iter()
                .position(|d| matches!(d, Dimension::Single(a) if a.name() == name))
                .ok_or_else(|| {
                    Error::InvalidCoordinates(format!("cannot stack missing dimension '{name}'"))
                })?;
            positions.push(i);
        }
        let axes: Vec<Axis> =
            positions.iter().map(|&i| self.dims[i].axes()[0].clone()).collect();
        if axes.iter().any(|a| a.size() != axes[0].size()) {
            return Err(Error::InvalidCoordinates(
                "stacked axes must share the same length".into(),
            ));
        }

        let insert_at = *positions.iter().min().unwrap_or(&0);
        let mut dims = Vec::with_capacity(self.dims.len() - names.len() + 1);
        for (i, dim) in self.dims.iter().enumerate() {
            if i == insert_at {
                dims.push(Dimension::Stacked(axes.clone()));
            }
            if !positions.contains(&i) {
                dims.push(dim.clone());
            }
        }
        Ok(CoordinateSet { dims })
    }

    /// Concatenates dimensions; names must be disjoint.
    pub fn merge(&self, other: &CoordinateSet) -> Result<CoordinateSet> {
        let mut dims = self.dims.clone();
        dims.extend(other.dims.iter().cloned());
        CoordinateSet::new(dims)
    }

    pub fn drop_dims(&self, names: &[String]) -> CoordinateSet {
        let dims = self
            .dims
            .iter()
            .filter(|d| !names.contains(&d.name()))
            .cloned()
            .collect();
        CoordinateSet { dims }
    }

    pub fn replace_dim(&self, name: &str, new_dim: Dimension) -> Result<CoordinateSet> {
        let i = self
            .dim_index(name)
            .ok_or_else(|| Error::DimensionMismatch(format!("no dimension '{name}'")))?;
        let mut dims = self.dims.clone();
        dims[i] = new_dim;
        CoordinateSet::new(dims)
    }

    /// Tiles the full shape into sub-grids of at most `chunk_shape` cells
    /// per dimension, preserving dimension order and stacking. Concatenating
    /// the yielded chunks covers every cell exactly once.
    pub fn iter_chunks<'a>(
        &'a self,
        chunk_shape: &[usize],
    ) -> Result<impl Iterator<Item = (CoordinateSet, Vec<IndexSel>)> + 'a> {
        if chunk_shape.len() != self.ndim() {
            return Err(Error::DimensionMismatch(format!(
                "chunk shape has {} entries for {} dimensions",
                chunk_shape.len(),
                self.ndim()
            )));
        }
        if chunk_shape.contains(&0) {
            return Err(Error::DimensionMismatch("chunk sizes must be positive".into()));
        }

        let ranges: Vec<Vec<(usize, usize)>> = self
            .dims
            .iter()
            .zip(chunk_shape)
            .map(|(dim, &chunk)| {
                let size = dim.size();
                (0..size).step_by(chunk).map(|s| (s, (s + chunk).min(size))).collect()
            })
            .collect();

        Ok(ranges.into_iter().multi_cartesian_product().map(move |combo| {
            let sels: Vec<IndexSel> = combo
                .into_iter()
                .map(|(start, end)| IndexSel::Slice { start, end, step: 1 })
                .collect();
            (self.take(&sels), sels)
        }))
    }

    /// Greedy chunk-shape policy for a total cell budget: kept dimensions
    /// keep their full size, reduced dimensions shrink in order until each
    /// chunk fits the budget. Always positive.
    pub fn chunk_shape(&self, budget: usize, reduced: &[String]) -> Vec<usize> {
        let budget = budget.max(1);
        let mut s: usize = self
            .dims
            .iter()
            .filter(|d| !reduced.contains(&d.name()))
            .map(|d| d.size().max(1))
            .product();

        let mut shape = Vec::with_capacity(self.ndim());
        for dim in &self.dims {
            let size = dim.size();
            if !reduced.contains(&dim.name()) {
                shape.push(size.max(1));
                continue;
            }
            let n = budget / s.max(1);
            let chunk = if n == 0 {
                1
            } else if n < size {
                n
            } else {
                size.max(1)
            };
            shape.push(chunk);
            s = s.saturating_mul(chunk);
        }
        shape
    }

    pub fn definition(&self) -> serde_json::Value {
        json!({ "dims": self.dims.iter().map(Dimension::definition).collect::<Vec<_>>() })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assertables::{assert_all, assert_le};
    use test_case::test_case;

    use super::*;
    use crate::coordinates::Coord;

    fn axis(name: AxisName, values: Vec<f64>) -> Axis {
        Axis::from_values(name, values).unwrap()
    }

    fn grid(lat: Vec<f64>, lon: Vec<f64>) -> CoordinateSet {
        CoordinateSet::from_axes([axis(AxisName::Lat, lat), axis(AxisName::Lon, lon)]).unwrap()
    }

    fn points(lat: Vec<f64>, lon: Vec<f64>) -> CoordinateSet {
        CoordinateSet::new(vec![Dimension::Stacked(vec![
            axis(AxisName::Lat, lat),
            axis(AxisName::Lon, lon),
        ])])
        .unwrap()
    }

    #[test]
    fn construction_invariants() {
        // stacked length mismatch
        let err = CoordinateSet::new(vec![Dimension::Stacked(vec![
            axis(AxisName::Lat, vec![0.0, 1.0]),
            axis(AxisName::Lon, vec![0.0]),
        ])]);
        assert!(err.is_err());

        // duplicate names after unstacking
        let err = CoordinateSet::new(vec![
            Dimension::Single(axis(AxisName::Lat, vec![0.0])),
            Dimension::Stacked(vec![
                axis(AxisName::Lat, vec![0.0]),
                axis(AxisName::Lon, vec![0.0]),
            ]),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn shape_and_names() {
        let c = CoordinateSet::new(vec![
            Dimension::Stacked(vec![
                axis(AxisName::Lat, vec![0.0, 1.0, 2.0]),
                axis(AxisName::Lon, vec![0.0, 1.0, 2.0]),
            ]),
            Dimension::Single(axis(AxisName::Alt, vec![10.0, 20.0])),
        ])
        .unwrap();

        assert_eq!(c.shape(), vec![3, 2]);
        assert_eq!(c.size(), 6);
        assert_eq!(c.dim_names(), vec!["lat_lon", "alt"]);
        assert!(c.axis(AxisName::Lon).is_some());
        assert!(c.single_axis(AxisName::Lon).is_none());
        assert!(c.single_axis(AxisName::Alt).is_some());
    }

    #[test]
    fn intersect_grid() {
        let native = grid(vec![0.0, 1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]);
        let request = grid(vec![0.5, 1.5], vec![15.0, 25.0]);

        let (sub, sels) = native.intersect(&request, false).unwrap();
        assert_eq!(sub.shape(), vec![1, 1]);
        assert_eq!(sels[0], IndexSel::Slice { start: 1, end: 2, step: 1 });

        let (outer, _) = native.intersect(&request, true).unwrap();
        assert_eq!(outer.shape(), vec![3, 3]);
    }

    #[test]
    fn intersect_passes_unknown_dims_through() {
        let native = CoordinateSet::from_axes([
            axis(AxisName::Lat, vec![0.0, 1.0]),
            axis(AxisName::Alt, vec![5.0, 6.0, 7.0]),
        ])
        .unwrap();
        let request = grid(vec![0.0, 1.0], vec![0.0, 1.0]);

        let (sub, sels) = native.intersect(&request, false).unwrap();
        assert_eq!(sub.shape(), vec![2, 3]);
        assert_eq!(sels[1], IndexSel::full(3));
    }

    #[test]
    fn intersect_stacked_pointwise() {
        let native = points(vec![0.0, 1.0, 2.0, 3.0, 4.0], vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        // lat keeps 1..=3, lon keeps 0..=20: the pointwise intersection is 1, 2
        let request = grid(vec![1.0, 3.0], vec![0.0, 20.0]);

        let (sub, sels) = native.intersect(&request, false).unwrap();
        assert_eq!(sub.shape(), vec![2]);
        assert_eq!(sels[0], IndexSel::Indices(vec![1, 2]));
        let lat = sub.axis(AxisName::Lat).unwrap();
        assert_eq!(lat.values_f64().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn unstack_and_stack_round_trip() {
        let c = points(vec![0.0, 1.0, 2.0], vec![5.0, 6.0, 7.0]);
        let flat = c.unstack();
        assert_eq!(flat.dim_names(), vec!["lat", "lon"]);
        assert_eq!(flat.shape(), vec![3, 3]);

        let restacked = flat.stack(&[AxisName::Lat, AxisName::Lon]).unwrap();
        assert_eq!(restacked, c);
    }

    #[test]
    fn merge_disjoint_only() {
        let a = grid(vec![0.0], vec![1.0]);
        let b = CoordinateSet::from_axes([axis(AxisName::Alt, vec![0.0])]).unwrap();
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.dim_names(), vec!["lat", "lon", "alt"]);

        assert!(a.merge(&a).is_err());
    }

    #[test_case(&[2, 2] ; "uneven tail")]
    #[test_case(&[1, 3] ; "rows")]
    #[test_case(&[3, 3] ; "whole")]
    fn iter_chunks_covers_exactly(chunk: &[usize]) {
        let c = grid(vec![0.0, 1.0, 2.0], vec![10.0, 20.0, 30.0]);

        let mut cells: Vec<(Coord, Coord)> = Vec::new();
        for (sub, sels) in c.iter_chunks(chunk).unwrap() {
            assert_eq!(sub.shape(), sels.iter().map(IndexSel::len).collect::<Vec<_>>());
            assert_le!(sub.size(), chunk.iter().product::<usize>());
            let lats = sub.axis(AxisName::Lat).unwrap().clone();
            let lons = sub.axis(AxisName::Lon).unwrap().clone();
            for i in 0..lats.size() {
                for j in 0..lons.size() {
                    cells.push((lats.get(i), lons.get(j)));
                }
            }
        }

        assert_eq!(cells.len(), c.size());
        let unique: HashSet<String> =
            cells.iter().map(|(a, b)| format!("{a}/{b}")).collect();
        assert_eq!(unique.len(), c.size());
    }

    #[test]
    fn iter_chunks_preserves_stacking() {
        let c = points(vec![0.0, 1.0, 2.0, 3.0, 4.0], vec![9.0, 8.0, 7.0, 6.0, 5.0]);
        let chunks: Vec<_> = c.iter_chunks(&[2]).unwrap().collect();
        assert_eq!(chunks.len(), 3);
        assert_all!(chunks.iter(), |(sub, _): &(CoordinateSet, Vec<IndexSel>)| sub
            .dims()[0]
            .is_stacked());
        assert_eq!(chunks[2].0.size(), 1);
    }

    #[test]
    fn chunk_shape_policy() {
        let c = CoordinateSet::from_axes([
            axis(AxisName::Lat, (0..100).map(f64::from).collect()),
            axis(AxisName::Lon, (0..100).map(f64::from).collect()),
            Axis::uniform_time(0, 99_000_000_000, 1_000_000_000).unwrap(),
        ])
        .unwrap();

        // reduce everything: greedy split in dimension order
        let reduced: Vec<String> = vec!["lat".into(), "lon".into(), "time".into()];
        assert_eq!(c.chunk_shape(10_000, &reduced), vec![100, 100, 1]);

        // keep time: it takes its full size first
        let reduced: Vec<String> = vec!["lat".into(), "lon".into()];
        assert_eq!(c.chunk_shape(10_000, &reduced), vec![100, 1, 100]);

        // budget smaller than a single kept row still yields positive chunks
        let reduced: Vec<String> = vec!["lat".into()];
        assert_eq!(c.chunk_shape(10, &reduced), vec![1, 100, 100]);
    }

    #[test]
    fn replace_and_drop() {
        let c = grid(vec![0.0, 1.0], vec![2.0, 3.0]);
        let swapped = c
            .replace_dim("lon", Dimension::Single(axis(AxisName::Lon, vec![9.0])))
            .unwrap();
        assert_eq!(swapped.shape(), vec![2, 1]);

        let dropped = c.drop_dims(&["lat".to_string()]);
        assert_eq!(dropped.dim_names(), vec!["lon"]);
    }
}
