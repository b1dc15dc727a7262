use derive_more::Deref;
use ndarray::{ArrayD, Axis as NdAxis, IxDyn};

use crate::{
    coordinates::{AxisValues, CoordinateSet, Step},
    error::{Error, Result},
};

/// Name of the extra dimension carried by multi-output sources.
pub const OUTPUT_DIM: &str = "output";

/// A dense N-D float buffer tagged by a sequence of dimension names matching
/// a [`CoordinateSet`]. NaN denotes no-data; dimension order is observable
/// and preserved by transposes.
#[derive(Debug, Clone, Deref)]
pub struct UnitsArray {
    #[deref]
    data: ArrayD<f64>,
    dims: Vec<String>,
}

impl UnitsArray {
    pub fn new(data: ArrayD<f64>, dims: Vec<String>) -> Result<UnitsArray> {
        if data.ndim() != dims.len() {
            return Err(Error::DimensionMismatch(format!(
                "array has {} axes but {} dimension names",
                data.ndim(),
                dims.len()
            )));
        }
        Ok(UnitsArray { data, dims })
    }

    pub fn nans(coords: &CoordinateSet) -> UnitsArray {
        UnitsArray {
            data: ArrayD::from_elem(IxDyn(&coords.shape()), f64::NAN),
            dims: coords.dim_names(),
        }
    }

    /// All-NaN array with a trailing `output` dimension.
    pub fn nans_with_outputs(coords: &CoordinateSet, outputs: &[String]) -> UnitsArray {
        let mut shape = coords.shape();
        shape.push(outputs.len());
        let mut dims = coords.dim_names();
        dims.push(OUTPUT_DIM.to_string());
        UnitsArray { data: ArrayD::from_elem(IxDyn(&shape), f64::NAN), dims }
    }

    pub fn filled(coords: &CoordinateSet, value: f64) -> UnitsArray {
        UnitsArray {
            data: ArrayD::from_elem(IxDyn(&coords.shape()), value),
            dims: coords.dim_names(),
        }
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == name)
    }

    pub fn has_dim(&self, name: &str) -> bool {
        self.dim_index(name).is_some()
    }

    /// Whether shape and dimension names line up with `coords`.
    pub fn matches(&self, coords: &CoordinateSet) -> bool {
        self.dims == coords.dim_names() && self.data.shape() == coords.shape().as_slice()
    }

    pub fn nansum(&self, dims: &[String]) -> Result<UnitsArray> {
        self.reduce_axes(dims, 0.0, |acc, v| acc + v)
    }

    pub fn count_finite(&self, dims: &[String]) -> Result<UnitsArray> {
        self.reduce_axes(dims, 0.0, |acc, _| acc + 1.0)
    }

    pub fn nanmean(&self, dims: &[String]) -> Result<UnitsArray> {
        let sum = self.nansum(dims)?;
        let count = self.count_finite(dims)?;
        let mut data = sum.data;
        data.zip_mut_with(&count.data, |s, &n| *s /= n);
        Ok(UnitsArray { data, dims: sum.dims })
    }

    pub fn nanmin(&self, dims: &[String]) -> Result<UnitsArray> {
        let mut out = self.reduce_axes(dims, f64::INFINITY, f64::min)?;
        out.data.mapv_inplace(|v| if v == f64::INFINITY { f64::NAN } else { v });
        Ok(out)
    }

    pub fn nanmax(&self, dims: &[String]) -> Result<UnitsArray> {
        let mut out = self.reduce_axes(dims, f64::NEG_INFINITY, f64::max)?;
        out.data.mapv_inplace(|v| if v == f64::NEG_INFINITY { f64::NAN } else { v });
        Ok(out)
    }

    /// NaN-aware fold along the named dimensions; missing values are
    /// skipped, cells with no finite value keep `init`.
    fn reduce_axes(
        &self,
        dims: &[String],
        init: f64,
        f: impl Fn(f64, f64) -> f64 + Copy,
    ) -> Result<UnitsArray> {
        let mut axes = dims
            .iter()
            .map(|name| {
                self.dim_index(name).ok_or_else(|| {
                    Error::DimensionMismatch(format!("no dimension '{name}' to reduce"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        axes.sort_unstable();
        axes.dedup();

        let mut data = self.data.clone();
        for &ax in axes.iter().rev() {
            data = data.fold_axis(NdAxis(ax), init, move |&acc, &v| {
                if v.is_nan() { acc } else { f(acc, v) }
            });
        }
        let dims_out = self
            .dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, d)| d.clone())
            .collect();
        Ok(UnitsArray { data, dims: dims_out })
    }

    /// Returns a copy with dimensions in the given order.
    pub fn transpose(&self, order: &[&str]) -> Result<UnitsArray> {
        if order.len() != self.dims.len() {
            return Err(Error::DimensionMismatch(format!(
                "transpose order names {} of {} dimensions",
                order.len(),
                self.dims.len()
            )));
        }
        let perm = order
            .iter()
            .map(|name| {
                self.dim_index(name).ok_or_else(|| {
                    Error::DimensionMismatch(format!("no dimension '{name}' to transpose"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut seen = perm.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != perm.len() {
            return Err(Error::DimensionMismatch("transpose order repeats a dimension".into()));
        }

        let data = self.data.clone().permuted_axes(IxDyn(&perm));
        let dims = order.iter().map(|s| s.to_string()).collect();
        Ok(UnitsArray { data, dims })
    }

    /// Replaces the `dim` axis with `dst_values`: each new entry is filled
    /// from the nearest source entry within `tolerance`, NaN otherwise.
    pub fn reindex_nearest(
        &self,
        dim: &str,
        src_values: &AxisValues,
        dst_values: &AxisValues,
        tolerance: Option<Step>,
    ) -> Result<UnitsArray> {
        let ax = self
            .dim_index(dim)
            .ok_or_else(|| Error::DimensionMismatch(format!("no dimension '{dim}' to reindex")))?;
        if self.data.shape()[ax] != src_values.len() {
            return Err(Error::DimensionMismatch(format!(
                "dimension '{dim}' has {} entries but {} source values",
                self.data.shape()[ax],
                src_values.len()
            )));
        }

        let mapping: Vec<Option<usize>> = match (src_values, dst_values) {
            (AxisValues::Number(src), AxisValues::Number(dst)) => {
                let tol = match tolerance {
                    None => f64::INFINITY,
                    Some(Step::Number(t)) => t,
                    Some(Step::Nanos(_)) => {
                        return Err(Error::InvalidCoordinates(
                            "time tolerance on a numeric dimension".into(),
                        ));
                    }
                };
                dst.iter()
                    .map(|&x| {
                        nearest_by(src.iter().copied(), |v| {
                            if v.is_nan() { f64::INFINITY } else { (v - x).abs() }
                        })
                        .filter(|&(_, d)| d <= tol)
                        .map(|(i, _)| i)
                    })
                    .collect()
            }
            (AxisValues::Time(src), AxisValues::Time(dst)) => {
                let tol = match tolerance {
                    None => i64::MAX,
                    Some(Step::Nanos(t)) => t,
                    Some(Step::Number(_)) => {
                        return Err(Error::InvalidCoordinates(
                            "numeric tolerance on the time dimension".into(),
                        ));
                    }
                };
                dst.iter()
                    .map(|&x| {
                        nearest_by(src.iter().copied(), |v| v.abs_diff(x))
                            .filter(|&(_, d)| d <= tol.unsigned_abs())
                            .map(|(i, _)| i)
                    })
                    .collect()
            }
            _ => {
                return Err(Error::InvalidCoordinates(format!(
                    "cannot reindex dimension '{dim}' across dtypes"
                )));
            }
        };

        let mut shape = self.data.shape().to_vec();
        shape[ax] = dst_values.len();
        let mut out = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        for (j, m) in mapping.iter().enumerate() {
            if let Some(i) = m {
                out.index_axis_mut(NdAxis(ax), j).assign(&self.data.index_axis(NdAxis(ax), *i));
            }
        }
        Ok(UnitsArray { data: out, dims: self.dims.clone() })
    }

    /// Element-wise combination; dimension tags must agree.
    pub fn zip_map(&self, other: &UnitsArray, f: impl Fn(f64, f64) -> f64) -> Result<UnitsArray> {
        if self.dims != other.dims || self.data.shape() != other.data.shape() {
            return Err(Error::DimensionMismatch(
                "element-wise operands have different dimensions".into(),
            ));
        }
        let mut data = self.data.clone();
        data.zip_mut_with(&other.data, |a, &b| *a = f(*a, b));
        Ok(UnitsArray { data, dims: self.dims.clone() })
    }

    /// Equal within `tol`, treating NaN as equal to NaN.
    pub fn all_close(&self, other: &UnitsArray, tol: f64) -> bool {
        self.dims == other.dims
            && self.data.shape() == other.data.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(&a, &b)| (a.is_nan() && b.is_nan()) || (a - b).abs() <= tol)
    }
}

fn nearest_by<T, D: PartialOrd + Copy>(
    values: impl Iterator<Item = T>,
    dist: impl Fn(T) -> D,
) -> Option<(usize, D)> {
    values
        .enumerate()
        .map(|(i, v)| (i, dist(v)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::coordinates::{Axis, AxisName, CoordinateSet};

    fn arr2(data: ndarray::Array2<f64>) -> UnitsArray {
        UnitsArray::new(data.into_dyn(), vec!["lat".into(), "lon".into()]).unwrap()
    }

    #[test]
    fn nan_aware_reductions() {
        let a = arr2(array![[1.0, f64::NAN, 3.0], [4.0, 5.0, f64::NAN]]);
        let lat = vec!["lat".to_string()];

        let sum = a.nansum(&lat).unwrap();
        assert_eq!(sum.dims(), ["lon"]);
        assert_eq!(sum.data().as_slice().unwrap(), &[5.0, 5.0, 3.0]);

        let count = a.count_finite(&lat).unwrap();
        assert_eq!(count.data().as_slice().unwrap(), &[2.0, 1.0, 1.0]);

        let mean = a.nanmean(&lat).unwrap();
        assert_eq!(mean.data().as_slice().unwrap(), &[2.5, 5.0, 3.0]);

        let min = a.nanmin(&lat).unwrap();
        assert_eq!(min.data().as_slice().unwrap(), &[1.0, 5.0, 3.0]);

        let max = a.nanmax(&lat).unwrap();
        assert_eq!(max.data().as_slice().unwrap(), &[4.0, 5.0, 3.0]);
    }

    #[test]
    fn all_nan_cells() {
        let a = arr2(array![[f64::NAN], [f64::NAN]]);
        let lat = vec!["lat".to_string()];
        assert!(a.nanmean(&lat).unwrap().data()[[0]].is_nan());
        assert!(a.nanmin(&lat).unwrap().data()[[0]].is_nan());
        assert_eq!(a.nansum(&lat).unwrap().data()[[0]], 0.0);
    }

    #[test]
    fn reduce_multiple_dims_to_scalar() {
        let a = arr2(array![[1.0, 2.0], [3.0, 4.0]]);
        let out = a.nansum(&["lat".to_string(), "lon".to_string()]).unwrap();
        assert_eq!(out.data().ndim(), 0);
        assert_eq!(out.data().first().copied(), Some(10.0));
    }

    #[test]
    fn unknown_reduce_dim() {
        let a = arr2(array![[1.0]]);
        assert!(matches!(
            a.nansum(&["alt".to_string()]),
            Err(Error::DimensionMismatch(_))
        ));
    }

    #[test]
    fn transpose_preserves_values() {
        let a = arr2(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let t = a.transpose(&["lon", "lat"]).unwrap();
        assert_eq!(t.dims(), ["lon", "lat"]);
        assert_eq!(t.data().shape(), &[3, 2]);
        assert_eq!(t.data()[[2, 0]], 3.0);

        assert!(a.transpose(&["lat", "lat"]).is_err());
        assert!(a.transpose(&["lat"]).is_err());
    }

    #[test]
    fn reindex_nearest_with_tolerance() {
        let a = UnitsArray::new(array![10.0, 20.0, 30.0].into_dyn(), vec!["lat".into()]).unwrap();
        let src = AxisValues::Number(vec![0.0, 5.0, 10.0]);
        let dst = AxisValues::Number(vec![0.4, 2.9, 9.5]);

        let out = a
            .reindex_nearest("lat", &src, &dst, Some(Step::Number(1.1)))
            .unwrap();
        let got: Vec<f64> = out.data().iter().copied().collect();
        assert_eq!(got[0], 10.0);
        assert!(got[1].is_nan());
        assert_eq!(got[2], 30.0);

        // no tolerance: everything snaps to the nearest entry
        let out = a.reindex_nearest("lat", &src, &dst, None).unwrap();
        let got: Vec<f64> = out.data().iter().copied().collect();
        assert_eq!(got, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn nans_match_coords() {
        let coords = CoordinateSet::from_axes([
            Axis::from_values(AxisName::Lat, vec![0.0, 1.0]).unwrap(),
            Axis::from_values(AxisName::Lon, vec![0.0, 1.0, 2.0]).unwrap(),
        ])
        .unwrap();
        let a = UnitsArray::nans(&coords);
        assert!(a.matches(&coords));
        assert!(a.data().iter().all(|v| v.is_nan()));

        let m = UnitsArray::nans_with_outputs(&coords, &["x".into(), "y".into()]);
        assert_eq!(m.dims(), ["lat", "lon", OUTPUT_DIM]);
        assert_eq!(m.data().shape(), &[2, 3, 2]);
    }
}
