use ndarray::{Array2, ArrayView2, Axis as NdAxis};

use crate::{
    coordinates::Axis,
    error::{Error, Result},
};

/// Reorients a 2-D lat × lon tile so both axes ascend, returning the
/// flipped copy and the ascending coordinate arrays.
fn ascending(
    src: ArrayView2<f64>,
    s_lat: &Axis,
    s_lon: &Axis,
) -> Result<(Array2<f64>, Vec<f64>, Vec<f64>)> {
    let mut data = src.to_owned();
    let mut lats = s_lat
        .values_f64()
        .ok_or_else(|| Error::InvalidCoordinates("spatial axes must be numeric".into()))?
        .to_vec();
    let mut lons = s_lon
        .values_f64()
        .ok_or_else(|| Error::InvalidCoordinates("spatial axes must be numeric".into()))?
        .to_vec();

    if s_lat.is_descending() {
        data.invert_axis(NdAxis(0));
        lats.reverse();
    }
    if s_lon.is_descending() {
        data.invert_axis(NdAxis(1));
        lons.reverse();
    }
    Ok((data, lats, lons))
}

/// Tensor-product nearest / linear interpolation on the ascending 1-D
/// coordinate arrays. Destination values outside the source extent become
/// NaN; NaN source corners propagate.
pub(crate) fn regular_2d(
    src: ArrayView2<f64>,
    s_lat: &Axis,
    s_lon: &Axis,
    d_lat_vals: &[f64],
    d_lon_vals: &[f64],
    nearest: bool,
) -> Result<Vec<f64>> {
    let (data, lats, lons) = ascending(src, s_lat, s_lon)?;

    let mut out = Vec::with_capacity(d_lat_vals.len() * d_lon_vals.len());
    for &lat in d_lat_vals {
        for &lon in d_lon_vals {
            let value = if nearest {
                match (nearest_index(&lats, lat), nearest_index(&lons, lon)) {
                    (Some(i), Some(j)) => data[[i, j]],
                    _ => f64::NAN,
                }
            } else {
                bilinear_at(&data, &lats, &lons, lat, lon)
            };
            out.push(value);
        }
    }
    Ok(out)
}

fn nearest_index(values: &[f64], x: f64) -> Option<usize> {
    match values.len() {
        0 => None,
        1 => Some(0),
        n => {
            if x < values[0] || x > values[n - 1] {
                return None;
            }
            let hi = values.partition_point(|&v| v < x).min(n - 1);
            let lo = hi.saturating_sub(1);
            if (x - values[lo]).abs() <= (values[hi] - x).abs() { Some(lo) } else { Some(hi) }
        }
    }
}

fn bilinear_at(data: &Array2<f64>, lats: &[f64], lons: &[f64], lat: f64, lon: f64) -> f64 {
    let (i, t) = match segment(lats, lat) {
        Some(seg) => seg,
        None => return f64::NAN,
    };
    let (j, u) = match segment(lons, lon) {
        Some(seg) => seg,
        None => return f64::NAN,
    };

    let i1 = (i + 1).min(lats.len() - 1);
    let j1 = (j + 1).min(lons.len() - 1);
    let v00 = data[[i, j]];
    let v01 = data[[i, j1]];
    let v10 = data[[i1, j]];
    let v11 = data[[i1, j1]];
    (1.0 - t) * ((1.0 - u) * v00 + u * v01) + t * ((1.0 - u) * v10 + u * v11)
}

/// Locates `x` in ascending `values`: the segment index and the fractional
/// position within it. `None` outside the extent. A single value matches
/// everything (no interpolation along that axis).
fn segment(values: &[f64], x: f64) -> Option<(usize, f64)> {
    match values.len() {
        0 => None,
        1 => Some((0, 0.0)),
        n => {
            if x < values[0] || x > values[n - 1] {
                return None;
            }
            let hi = values.partition_point(|&v| v < x).clamp(1, n - 1);
            let lo = hi - 1;
            Some((lo, (x - values[lo]) / (values[hi] - values[lo])))
        }
    }
}

/// Separable interpolating spline of order `max(1, k)` per axis, evaluated
/// on the destination grid. Orders 2 and above evaluate as natural cubic
/// splines; order 1 degenerates to linear. Evaluation extrapolates with the
/// boundary polynomial. A NaN anywhere in a source line makes that line's
/// outputs NaN.
pub(crate) fn spline_2d(
    src: ArrayView2<f64>,
    s_lat: &Axis,
    s_lon: &Axis,
    d_lat_vals: &[f64],
    d_lon_vals: &[f64],
    order: u8,
) -> Result<Vec<f64>> {
    let (data, lats, lons) = ascending(src, s_lat, s_lon)?;
    let cubic = order >= 2;
    let (dlat_n, dlon_n) = (d_lat_vals.len(), d_lon_vals.len());

    // along lat, one spline per source column
    let mut mid = Array2::from_elem((dlat_n, lons.len()), f64::NAN);
    for j in 0..lons.len() {
        let col: Vec<f64> = data.column(j).to_vec();
        let line = spline_line(&lats, &col, d_lat_vals, cubic);
        for (i, v) in line.into_iter().enumerate() {
            mid[[i, j]] = v;
        }
    }

    // along lon, one spline per destination row
    let mut out = Vec::with_capacity(dlat_n * dlon_n);
    for i in 0..dlat_n {
        let row: Vec<f64> = mid.row(i).to_vec();
        out.extend(spline_line(&lons, &row, d_lon_vals, cubic));
    }
    Ok(out)
}

fn spline_line(xs: &[f64], ys: &[f64], eval_at: &[f64], cubic: bool) -> Vec<f64> {
    if xs.is_empty() || ys.iter().any(|v| v.is_nan()) {
        return vec![f64::NAN; eval_at.len()];
    }
    if xs.len() == 1 {
        return vec![ys[0]; eval_at.len()];
    }

    let y2 = if cubic { second_derivatives(xs, ys) } else { vec![0.0; xs.len()] };
    eval_at.iter().map(|&x| spline_eval(xs, ys, &y2, x)).collect()
}

/// Second derivatives of a natural cubic spline (tridiagonal sweep).
fn second_derivatives(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let mut y2 = vec![0.0; n];
    let mut u = vec![0.0; n];

    for i in 1..n - 1 {
        let sig = (xs[i] - xs[i - 1]) / (xs[i + 1] - xs[i - 1]);
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        let d = (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])
            - (ys[i] - ys[i - 1]) / (xs[i] - xs[i - 1]);
        u[i] = (6.0 * d / (xs[i + 1] - xs[i - 1]) - sig * u[i - 1]) / p;
    }
    for i in (0..n - 1).rev() {
        y2[i] = y2[i] * y2[i + 1] + u[i];
    }
    y2
}

fn spline_eval(xs: &[f64], ys: &[f64], y2: &[f64], x: f64) -> f64 {
    let n = xs.len();
    let hi = xs.partition_point(|&v| v < x).clamp(1, n - 1);
    let lo = hi - 1;
    let h = xs[hi] - xs[lo];
    let a = (xs[hi] - x) / h;
    let b = (x - xs[lo]) / h;
    a * ys[lo]
        + b * ys[hi]
        + ((a * a * a - a) * y2[lo] + (b * b * b - b) * y2[hi]) * h * h / 6.0
}
