pub mod grid;
pub mod nearest;
pub mod warp;

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use derive_more::IsVariant;
use enum_iterator::Sequence;
use ndarray::{ArrayD, ArrayViewD, Axis as NdAxis, Ix2, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{
    coordinates::{Axis, AxisName, CoordinateSet, Dimension, Step},
    error::{Error, Result},
    node::EvalContext,
    units::{OUTPUT_DIM, UnitsArray},
};

/// Requested interpolation method.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Sequence, IsVariant, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Nearest,
    NearestPreview,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Gauss,
    Max,
    Min,
    Med,
    Q1,
    Q3,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Nearest => "nearest",
            Method::NearestPreview => "nearest_preview",
            Method::Bilinear => "bilinear",
            Method::Cubic => "cubic",
            Method::CubicSpline => "cubic_spline",
            Method::Lanczos => "lanczos",
            Method::Average => "average",
            Method::Mode => "mode",
            Method::Gauss => "gauss",
            Method::Max => "max",
            Method::Min => "min",
            Method::Med => "med",
            Method::Q1 => "q1",
            Method::Q3 => "q3",
        }
    }

    pub fn is_nearest_like(self) -> bool {
        matches!(self, Method::Nearest | Method::NearestPreview)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Method> {
        enum_iterator::all::<Method>()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown interpolation method '{s}'")))
    }
}

/// Method plus tolerances. Tolerances default to no bound when unset,
/// except the nearest-point query which falls back to `8 × ‖δ‖` of the
/// destination spacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpolation {
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spline_order: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_tolerance_ns: Option<i64>,
}

impl Interpolation {
    pub fn new(method: Method) -> Interpolation {
        Interpolation {
            method,
            spline_order: None,
            spatial_tolerance: None,
            time_tolerance_ns: None,
        }
    }

    /// Accepts method names plus the `spline_k` spelling for a bivariate
    /// spline of order `k`.
    pub fn parse(s: &str) -> Result<Interpolation> {
        if let Some(order) = s.strip_prefix("spline_") {
            let order: u8 = order.parse().map_err(|_| {
                Error::Configuration(format!("unknown interpolation method '{s}'"))
            })?;
            let mut spec = Interpolation::new(Method::CubicSpline);
            spec.spline_order = Some(order);
            return Ok(spec);
        }
        Ok(Interpolation::new(s.parse()?))
    }

    pub fn spline_order(&self) -> u8 {
        self.spline_order.unwrap_or(3).max(1)
    }

    pub(crate) fn tolerance_for(&self, name: AxisName) -> Option<Step> {
        match name {
            AxisName::Time => self.time_tolerance_ns.map(Step::Nanos),
            AxisName::Lat | AxisName::Lon => self.spatial_tolerance.map(Step::Number),
            AxisName::Alt => None,
        }
    }
}

impl Default for Interpolation {
    fn default() -> Self {
        Interpolation::new(Method::Nearest)
    }
}

impl From<Method> for Interpolation {
    fn from(method: Method) -> Self {
        Interpolation::new(method)
    }
}

enum Geometry {
    Grid,
    Points(usize),
    None,
}

fn spatial_geometry(c: &CoordinateSet) -> Geometry {
    if c.single_axis(AxisName::Lat).is_some() && c.single_axis(AxisName::Lon).is_some() {
        return Geometry::Grid;
    }
    for (i, dim) in c.dims().iter().enumerate() {
        if dim.is_stacked()
            && dim.axis(AxisName::Lat).is_some()
            && dim.axis(AxisName::Lon).is_some()
        {
            return Geometry::Points(i);
        }
    }
    Geometry::None
}

/// Maps a source tile onto the request grid. Exactly one interpolator is
/// selected from the source geometry, destination geometry and method;
/// nothing ever falls back to a different method silently.
pub fn interpolate(
    src: &UnitsArray,
    src_coords: &CoordinateSet,
    dst: &CoordinateSet,
    spec: &Interpolation,
    ctx: &EvalContext,
) -> Result<UnitsArray> {
    ctx.check_cancelled()?;

    let mut data = src.clone();
    let mut coords = src_coords.clone();

    // time and alt reduce to the request values before any spatial work
    for name in [AxisName::Time, AxisName::Alt] {
        let pair = match (coords.single_axis(name), dst.single_axis(name)) {
            (Some(sa), Some(da)) if sa.values() != da.values() => {
                Some((sa.clone(), da.clone()))
            }
            _ => None,
        };
        if let Some((sa, da)) = pair {
            data = data.reindex_nearest(
                name.as_str(),
                sa.values(),
                da.values(),
                spec.tolerance_for(name),
            )?;
            coords = coords.replace_dim(name.as_str(), Dimension::Single(da))?;
        }
    }

    let unavailable = || Error::InterpolationUnavailable {
        method: spec.method,
        src: src_coords.dim_names().join(", "),
        dst: dst.dim_names().join(", "),
    };

    let result = match (spatial_geometry(&coords), spatial_geometry(dst)) {
        (Geometry::Grid, Geometry::Grid) => grid_to_grid(&data, &coords, dst, spec)?,
        (Geometry::Grid, Geometry::Points(d)) if spec.method.is_nearest_like() => {
            grid_to_points(&data, &coords, dst, d, spec)?
        }
        (Geometry::Points(s), Geometry::Grid) if spec.method.is_nearest_like() => {
            points_to_grid(&data, &coords, s, dst, spec)?
        }
        (Geometry::Points(s), Geometry::Points(d)) if spec.method.is_nearest_like() => {
            points_to_points(&data, &coords, s, dst, d, spec)?
        }
        (Geometry::Points(_), _) | (_, Geometry::Points(_)) => return Err(unavailable()),
        _ => axis_reindex(data, &coords, dst, spec, &unavailable)?,
    };

    conform(result, dst)
}

fn require_single(c: &CoordinateSet, name: AxisName) -> Result<&Axis> {
    c.single_axis(name).ok_or_else(|| {
        Error::InvalidCoordinates(format!("expected an unstacked '{name}' axis"))
    })
}

fn grid_to_grid(
    data: &UnitsArray,
    coords: &CoordinateSet,
    dst: &CoordinateSet,
    spec: &Interpolation,
) -> Result<UnitsArray> {
    let s_lat = require_single(coords, AxisName::Lat)?.clone();
    let s_lon = require_single(coords, AxisName::Lon)?.clone();
    let d_lat = require_single(dst, AxisName::Lat)?.clone();
    let d_lon = require_single(dst, AxisName::Lon)?.clone();

    let unavailable = || Error::InterpolationUnavailable {
        method: spec.method,
        src: coords.dim_names().join(", "),
        dst: dst.dim_names().join(", "),
    };

    let out_names = [AxisName::Lat.to_string(), AxisName::Lon.to_string()];
    let out_shape = [d_lat.size(), d_lon.size()];

    let warp_ready =
        [&s_lat, &s_lon, &d_lat, &d_lon].iter().all(|a| a.is_uniform() && a.size() >= 2);
    if warp_ready {
        return map_slabs(data, &["lat", "lon"], &out_names, &out_shape, |view| {
            warp::warp_2d(as_2d(view)?, &s_lat, &s_lon, &d_lat, &d_lon, spec)
        });
    }

    if !(s_lat.is_monotonic() && s_lon.is_monotonic()) {
        return Err(unavailable());
    }
    let numeric = |axis: &Axis| {
        axis.values_f64()
            .map(<[f64]>::to_vec)
            .ok_or_else(|| Error::InvalidCoordinates("spatial axes must be numeric".into()))
    };
    let d_lat_vals = numeric(&d_lat)?;
    let d_lon_vals = numeric(&d_lon)?;

    match spec.method {
        Method::Nearest | Method::NearestPreview | Method::Bilinear => {
            let nearest = spec.method.is_nearest_like();
            map_slabs(data, &["lat", "lon"], &out_names, &out_shape, |view| {
                grid::regular_2d(as_2d(view)?, &s_lat, &s_lon, &d_lat_vals, &d_lon_vals, nearest)
            })
        }
        Method::CubicSpline => {
            let order = spec.spline_order();
            map_slabs(data, &["lat", "lon"], &out_names, &out_shape, |view| {
                grid::spline_2d(as_2d(view)?, &s_lat, &s_lon, &d_lat_vals, &d_lon_vals, order)
            })
        }
        _ => Err(unavailable()),
    }
}

fn grid_to_points(
    data: &UnitsArray,
    coords: &CoordinateSet,
    dst: &CoordinateSet,
    dst_dim: usize,
    spec: &Interpolation,
) -> Result<UnitsArray> {
    let s_lat = require_single(coords, AxisName::Lat)?;
    let s_lon = require_single(coords, AxisName::Lon)?;
    let dst_dim = &dst.dims()[dst_dim];

    let src_pts = nearest::grid_points(s_lat, s_lon)?;
    let dst_pts = nearest::stacked_points(dst_dim)?;
    let bound = spec
        .spatial_tolerance
        .or_else(|| nearest::points_spacing(&dst_pts).map(|d| 8.0 * d));
    let mapping = nearest::nearest_mapping(&src_pts, &dst_pts, bound);

    map_slabs(data, &["lat", "lon"], &[dst_dim.name()], &[dst_pts.len()], |view| {
        let flat: Vec<f64> = view.iter().copied().collect();
        Ok(nearest::gather(&flat, &mapping))
    })
}

fn points_to_grid(
    data: &UnitsArray,
    coords: &CoordinateSet,
    src_dim: usize,
    dst: &CoordinateSet,
    spec: &Interpolation,
) -> Result<UnitsArray> {
    let src_dim = &coords.dims()[src_dim];
    let d_lat = require_single(dst, AxisName::Lat)?;
    let d_lon = require_single(dst, AxisName::Lon)?;

    let src_pts = nearest::stacked_points(src_dim)?;
    let dst_pts = nearest::grid_points(d_lat, d_lon)?;
    let bound = spec
        .spatial_tolerance
        .or_else(|| nearest::grid_spacing(d_lat, d_lon).map(|d| 8.0 * d));
    let mapping = nearest::nearest_mapping(&src_pts, &dst_pts, bound);

    let src_name = src_dim.name();
    let out_names = [AxisName::Lat.to_string(), AxisName::Lon.to_string()];
    map_slabs(
        data,
        &[src_name.as_str()],
        &out_names,
        &[d_lat.size(), d_lon.size()],
        |view| {
            let flat: Vec<f64> = view.iter().copied().collect();
            Ok(nearest::gather(&flat, &mapping))
        },
    )
}

fn points_to_points(
    data: &UnitsArray,
    coords: &CoordinateSet,
    src_dim: usize,
    dst: &CoordinateSet,
    dst_dim: usize,
    spec: &Interpolation,
) -> Result<UnitsArray> {
    let src_dim = &coords.dims()[src_dim];
    let dst_dim = &dst.dims()[dst_dim];

    let src_pts = nearest::stacked_points(src_dim)?;
    let dst_pts = nearest::stacked_points(dst_dim)?;
    let bound = spec
        .spatial_tolerance
        .or_else(|| nearest::points_spacing(&dst_pts).map(|d| 8.0 * d));
    let mapping = nearest::nearest_mapping(&src_pts, &dst_pts, bound);

    let src_name = src_dim.name();
    map_slabs(data, &[src_name.as_str()], &[dst_dim.name()], &[dst_pts.len()], |view| {
        let flat: Vec<f64> = view.iter().copied().collect();
        Ok(nearest::gather(&flat, &mapping))
    })
}

/// Per-axis nearest reindex for 1-D and isolated spatial dimensions.
fn axis_reindex(
    mut data: UnitsArray,
    coords: &CoordinateSet,
    dst: &CoordinateSet,
    spec: &Interpolation,
    unavailable: &dyn Fn() -> Error,
) -> Result<UnitsArray> {
    let mut coords = coords.clone();
    for name in [AxisName::Lat, AxisName::Lon] {
        let pair = match (coords.single_axis(name), dst.single_axis(name)) {
            (Some(sa), Some(da)) if sa.values() != da.values() => {
                Some((sa.clone(), da.clone()))
            }
            _ => None,
        };
        if let Some((sa, da)) = pair {
            if !spec.method.is_nearest_like() {
                return Err(unavailable());
            }
            data = data.reindex_nearest(
                name.as_str(),
                sa.values(),
                da.values(),
                spec.tolerance_for(name),
            )?;
            coords = coords.replace_dim(name.as_str(), Dimension::Single(da))?;
        }
    }
    Ok(data)
}

fn as_2d(view: ArrayViewD<'_, f64>) -> Result<ndarray::ArrayView2<'_, f64>> {
    view.into_dimensionality::<Ix2>()
        .map_err(|_| Error::DimensionMismatch("spatial slab is not 2-D".into()))
}

/// Runs a spatial kernel over every slab of the non-spatial dimensions and
/// reassembles the full array with the kernel's output dimensions in place
/// of the spatial ones. Extra dimensions (`time`, `alt`, `output`, ...)
/// broadcast through untouched.
fn map_slabs(
    data: &UnitsArray,
    spatial_dims: &[&str],
    out_names: &[String],
    out_shape: &[usize],
    mut kernel: impl FnMut(ArrayViewD<'_, f64>) -> Result<Vec<f64>>,
) -> Result<UnitsArray> {
    let ndim = data.dims().len();
    let spatial_idx = spatial_dims
        .iter()
        .map(|name| {
            data.dim_index(name).ok_or_else(|| {
                Error::DimensionMismatch(format!("no dimension '{name}' to interpolate"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let other_idx: Vec<usize> = (0..ndim).filter(|i| !spatial_idx.contains(i)).collect();
    let perm: Vec<usize> = other_idx.iter().chain(&spatial_idx).copied().collect();

    let permuted = data.data().clone().permuted_axes(IxDyn(&perm));
    let permuted = permuted.as_standard_layout().into_owned();

    let full_shape = data.data().shape();
    let other_shape: Vec<usize> = other_idx.iter().map(|&i| full_shape[i]).collect();
    let spatial_shape: Vec<usize> = spatial_idx.iter().map(|&i| full_shape[i]).collect();
    let slabs: usize = other_shape.iter().product();
    let slab_len: usize = spatial_shape.iter().product();
    let out_len: usize = out_shape.iter().product();

    let (buf, _offset) = permuted.into_raw_vec_and_offset();

    let mut out_buf: Vec<f64> = Vec::with_capacity(slabs * out_len);
    for k in 0..slabs {
        let slab = &buf[k * slab_len..(k + 1) * slab_len];
        let view = ArrayViewD::from_shape(IxDyn(&spatial_shape), slab)
            .map_err(|e| Error::DimensionMismatch(format!("spatial slab: {e}")))?;
        let values = kernel(view)?;
        if values.len() != out_len {
            return Err(Error::DimensionMismatch(
                "interpolator returned a misshapen tile".into(),
            ));
        }
        out_buf.extend(values);
    }

    let mut total_shape = other_shape;
    total_shape.extend_from_slice(out_shape);
    let arr = ArrayD::from_shape_vec(IxDyn(&total_shape), out_buf)
        .map_err(|e| Error::DimensionMismatch(format!("assembled tile: {e}")))?;

    let mut dims: Vec<String> = other_idx.iter().map(|&i| data.dims()[i].clone()).collect();
    dims.extend(out_names.iter().cloned());
    UnitsArray::new(arr, dims)
}

/// Broadcasts request dimensions missing from the tile and transposes to
/// the request's dimension order; the final shape must agree with the
/// request.
fn conform(result: UnitsArray, dst: &CoordinateSet) -> Result<UnitsArray> {
    let dst_shape = dst.shape();
    let mut target: Vec<String> = dst.dim_names();
    if result.has_dim(OUTPUT_DIM) {
        target.push(OUTPUT_DIM.to_string());
    }

    for dim in result.dims() {
        if !target.contains(dim) {
            return Err(Error::DimensionMismatch(format!(
                "tile dimension '{dim}' is not in the request"
            )));
        }
    }

    let mut data = result.data().clone();
    let mut dims = result.dims().to_vec();
    for (i, name) in target.iter().enumerate() {
        if dims.iter().any(|d| d == name) {
            continue;
        }
        let ndim = data.ndim();
        data = data.insert_axis(NdAxis(ndim));
        let mut shape = data.shape().to_vec();
        *shape.last_mut().expect("just inserted an axis") = dst_shape[i];
        data = data
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| {
                Error::DimensionMismatch(format!("cannot broadcast to dimension '{name}'"))
            })?
            .to_owned();
        dims.push(name.clone());
    }

    let interim = UnitsArray::new(data, dims)?;
    let order: Vec<&str> = target.iter().map(String::as_str).collect();
    let out = interim.transpose(&order)?;

    if out.data().shape()[..dst_shape.len()] != dst_shape[..] {
        return Err(Error::DimensionMismatch(format!(
            "interpolated shape {:?} disagrees with the request shape {:?}",
            out.data().shape(),
            dst_shape
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, Array3};
    use test_case::test_case;

    use super::*;
    use crate::{coordinates::parse_time, settings::Settings};

    fn ctx() -> EvalContext {
        EvalContext::with_settings(Settings::default())
    }

    fn axis(name: AxisName, values: Vec<f64>) -> Axis {
        Axis::from_values(name, values).unwrap()
    }

    fn lat_coords(values: Vec<f64>) -> CoordinateSet {
        CoordinateSet::from_axes([axis(AxisName::Lat, values)]).unwrap()
    }

    fn grid_coords(lat: Vec<f64>, lon: Vec<f64>) -> CoordinateSet {
        CoordinateSet::from_axes([axis(AxisName::Lat, lat), axis(AxisName::Lon, lon)]).unwrap()
    }

    fn stacked_coords(lat: Vec<f64>, lon: Vec<f64>) -> CoordinateSet {
        CoordinateSet::new(vec![Dimension::Stacked(vec![
            axis(AxisName::Lat, lat),
            axis(AxisName::Lon, lon),
        ])])
        .unwrap()
    }

    #[test_case("nearest", Method::Nearest ; "nearest")]
    #[test_case("cubic_spline", Method::CubicSpline ; "cubic spline")]
    #[test_case("q3", Method::Q3 ; "q3")]
    fn parse_methods(name: &str, expected: Method) {
        assert_eq!(Interpolation::parse(name).unwrap().method, expected);
    }

    #[test]
    fn parse_spline_order() {
        let spec = Interpolation::parse("spline_2").unwrap();
        assert_eq!(spec.method, Method::CubicSpline);
        assert_eq!(spec.spline_order(), 2);

        assert_eq!(Interpolation::new(Method::CubicSpline).spline_order(), 3);
        assert!(Interpolation::parse("spline_x").is_err());
        assert!(Interpolation::parse("bicubic").is_err());
    }

    #[test]
    fn nearest_1d() {
        let src_coords = lat_coords(vec![0.0, 2.5, 5.0, 7.5, 10.0]);
        let src = UnitsArray::new(
            Array1::from(vec![10.0, 11.0, 12.0, 13.0, 14.0]).into_dyn(),
            vec!["lat".into()],
        )
        .unwrap();
        let dst = lat_coords(vec![1.0, 1.2, 1.5, 5.0, 9.0]);

        let out =
            interpolate(&src, &src_coords, &dst, &Interpolation::default(), &ctx()).unwrap();
        let got: Vec<f64> = out.data().iter().copied().collect();
        assert_eq!(got, vec![10.0, 10.0, 11.0, 12.0, 14.0]);
    }

    #[test]
    fn nearest_1d_spatial_tolerance() {
        let src_coords = lat_coords(vec![0.0, 2.5, 5.0, 7.5, 10.0]);
        let src = UnitsArray::new(
            Array1::from(vec![10.0, 11.0, 12.0, 13.0, 14.0]).into_dyn(),
            vec!["lat".into()],
        )
        .unwrap();
        let dst = lat_coords(vec![1.0, 1.2, 1.5, 5.0, 9.0]);

        let mut spec = Interpolation::default();
        spec.spatial_tolerance = Some(1.1);
        let out = interpolate(&src, &src_coords, &dst, &spec, &ctx()).unwrap();
        let got: Vec<f64> = out.data().iter().copied().collect();

        assert_eq!(got[0], 10.0);
        assert!(got[1].is_nan());
        assert_eq!(got[2], 11.0);
        assert_eq!(got[3], 12.0);
        assert_eq!(got[4], 14.0);
    }

    #[test]
    fn time_tolerance_reduces_before_spatial() {
        let day = 86_400_000_000_000_i64;
        let t0 = parse_time("2018-01-01").unwrap();
        let src_time = Axis::uniform_time(t0, t0 + 8 * day, 2 * day).unwrap();
        let src_coords = CoordinateSet::new(vec![
            Dimension::Single(axis(AxisName::Lat, vec![0.0, 2.5, 5.0, 7.5, 10.0])),
            Dimension::Single(src_time),
        ])
        .unwrap();
        let src = UnitsArray::new(
            Array2::from_shape_fn((5, 5), |(i, j)| (i * 5 + j) as f64).into_dyn(),
            vec!["lat".into(), "time".into()],
        )
        .unwrap();

        let dst_time = Axis::uniform_time(t0, t0 + 8 * day, 4 * day).unwrap();
        let dst = CoordinateSet::new(vec![
            Dimension::Single(axis(AxisName::Lat, vec![1.0, 1.2, 5.0])),
            Dimension::Single(dst_time),
        ])
        .unwrap();

        let mut spec = Interpolation::default();
        spec.spatial_tolerance = Some(1.1);
        spec.time_tolerance_ns = Some(day);
        let out = interpolate(&src, &src_coords, &dst, &spec, &ctx()).unwrap();

        assert_eq!(out.data().shape(), &[3, 3]);
        // dst times land exactly on source columns 0, 2, 4
        assert_eq!(out.data()[[0, 0]], 0.0);
        assert_eq!(out.data()[[0, 1]], 2.0);
        assert!(out.data()[[1, 0]].is_nan());
        assert_eq!(out.data()[[2, 2]], 14.0);
    }

    #[test]
    fn grid_to_stacked_points_nearest() {
        let src_coords = grid_coords(
            vec![0.0, 2.5, 5.0, 7.5, 10.0],
            vec![0.0, 2.5, 5.0, 7.5, 10.0],
        );
        let src = UnitsArray::new(
            Array2::from_shape_fn((5, 5), |(i, j)| (i * 5 + j) as f64).into_dyn(),
            vec!["lat".into(), "lon".into()],
        )
        .unwrap();
        let dst = stacked_coords(vec![0.0, 2.0, 10.0], vec![0.0, 2.0, 10.0]);

        let out =
            interpolate(&src, &src_coords, &dst, &Interpolation::default(), &ctx()).unwrap();
        assert_eq!(out.dims(), ["lat_lon"]);
        let got: Vec<f64> = out.data().iter().copied().collect();
        assert_eq!(got, vec![0.0, 6.0, 24.0]);
    }

    #[test]
    fn stacked_points_to_grid_nearest() {
        let src_coords = stacked_coords(
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0],
            vec![0.0, 2.0, 4.0, 5.0, 6.0, 10.0],
        );
        let src = UnitsArray::new(
            Array1::from(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).into_dyn(),
            vec!["lat_lon".into()],
        )
        .unwrap();
        let dst = grid_coords(vec![0.1, 5.9], vec![0.1, 4.9]);

        let out =
            interpolate(&src, &src_coords, &dst, &Interpolation::default(), &ctx()).unwrap();
        assert_eq!(out.dims(), ["lat", "lon"]);
        assert_eq!(out.data()[[0, 0]], 0.0);
        assert_eq!(out.data()[[1, 1]], 3.0);
    }

    #[test]
    fn stacked_source_rejects_bilinear() {
        let src_coords = stacked_coords(vec![0.0, 1.0], vec![0.0, 1.0]);
        let src =
            UnitsArray::new(Array1::from(vec![0.0, 1.0]).into_dyn(), vec!["lat_lon".into()])
                .unwrap();
        let dst = grid_coords(vec![0.0, 1.0], vec![0.0, 1.0]);

        let err = interpolate(
            &src,
            &src_coords,
            &dst,
            &Interpolation::new(Method::Bilinear),
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InterpolationUnavailable { .. }));
    }

    #[test]
    fn broadcast_over_missing_request_dims() {
        let src_coords = grid_coords(vec![0.0, 1.0], vec![0.0, 1.0]);
        let src = UnitsArray::new(
            Array2::from_shape_fn((2, 2), |(i, j)| (i * 2 + j) as f64).into_dyn(),
            vec!["lat".into(), "lon".into()],
        )
        .unwrap();
        let dst = CoordinateSet::new(vec![
            Dimension::Single(axis(AxisName::Alt, vec![100.0, 200.0, 300.0])),
            Dimension::Single(axis(AxisName::Lat, vec![0.0, 1.0])),
            Dimension::Single(axis(AxisName::Lon, vec![0.0, 1.0])),
        ])
        .unwrap();

        let out =
            interpolate(&src, &src_coords, &dst, &Interpolation::default(), &ctx()).unwrap();
        assert_eq!(out.dims(), ["alt", "lat", "lon"]);
        assert_eq!(out.data().shape(), &[3, 2, 2]);
        for k in 0..3 {
            assert_eq!(out.data()[[k, 1, 0]], 2.0);
        }
    }

    #[test]
    fn transposes_to_request_order() {
        let src_coords = grid_coords(vec![0.0, 1.0, 2.0], vec![0.0, 1.0]);
        let src = UnitsArray::new(
            Array2::from_shape_fn((3, 2), |(i, j)| (i * 2 + j) as f64).into_dyn(),
            vec!["lat".into(), "lon".into()],
        )
        .unwrap();
        let dst = CoordinateSet::from_axes([
            axis(AxisName::Lon, vec![0.0, 1.0]),
            axis(AxisName::Lat, vec![0.0, 1.0, 2.0]),
        ])
        .unwrap();

        let out =
            interpolate(&src, &src_coords, &dst, &Interpolation::default(), &ctx()).unwrap();
        assert_eq!(out.dims(), ["lon", "lat"]);
        assert_eq!(out.data().shape(), &[2, 3]);
        assert_eq!(out.data()[[1, 2]], 5.0);
    }

    #[test]
    fn multi_output_dim_rides_through() {
        let src_coords = grid_coords(vec![0.0, 1.0], vec![0.0, 1.0]);
        let src = UnitsArray::new(
            Array3::from_shape_fn((2, 2, 2), |(i, j, k)| (i * 4 + j * 2 + k) as f64).into_dyn(),
            vec!["lat".into(), "lon".into(), OUTPUT_DIM.into()],
        )
        .unwrap();
        let dst = grid_coords(vec![0.0, 1.0], vec![0.0, 1.0]);

        let out =
            interpolate(&src, &src_coords, &dst, &Interpolation::default(), &ctx()).unwrap();
        assert_eq!(out.dims(), ["lat", "lon", OUTPUT_DIM]);
        assert_eq!(out.data()[[1, 1, 1]], 7.0);
    }

    #[test]
    fn cancellation_aborts_interpolation() {
        let src_coords = lat_coords(vec![0.0, 1.0]);
        let src = UnitsArray::new(Array1::from(vec![0.0, 1.0]).into_dyn(), vec!["lat".into()])
            .unwrap();
        let context = ctx();
        context.cancel_token().cancel();

        let err = interpolate(
            &src,
            &src_coords,
            &src_coords.clone(),
            &Interpolation::default(),
            &context,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
