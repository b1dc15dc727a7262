use ndarray::{Array2, ArrayView2, Axis as NdAxis};

use crate::{
    coordinates::{Axis, Step},
    error::{Error, Result},
    interpolation::{Interpolation, Method},
};

/// One side of the affine mapping: ascending cell centers described by the
/// lower area-bounds edge and a positive step.
struct Side {
    edge: f64,
    step: f64,
    n: usize,
    descending: bool,
}

impl Side {
    fn of(axis: &Axis) -> Result<Side> {
        let step = match axis.step() {
            Some(Step::Number(step)) if axis.size() >= 2 => step.abs(),
            _ => {
                return Err(Error::InvalidCoordinates(format!(
                    "raster warp needs a uniform numeric '{}' axis with at least 2 values",
                    axis.name()
                )));
            }
        };
        let values = axis
            .values_f64()
            .ok_or_else(|| Error::InvalidCoordinates("spatial axes must be numeric".into()))?;
        let first = if axis.is_descending() { values[values.len() - 1] } else { values[0] };
        Ok(Side { edge: first - step / 2.0, step, n: axis.size(), descending: axis.is_descending() })
    }

    /// Fractional pixel position of a coordinate (0 at the first center).
    fn pixel(&self, coord: f64) -> f64 {
        (coord - self.edge) / self.step - 0.5
    }

    fn center(&self, i: usize) -> f64 {
        self.edge + (i as f64 + 0.5) * self.step
    }

    fn contains(&self, pixel: f64) -> bool {
        (-0.5..=self.n as f64 - 0.5).contains(&pixel)
    }
}

/// Same-CRS affine resampling between two uniform lat × lon grids. The
/// source is flipped to ascending orientation on input and the destination
/// flipped back on output, so ascending and descending tiles of identical
/// values warp identically. NaN passes through as no-data on both sides.
pub(crate) fn warp_2d(
    src: ArrayView2<f64>,
    s_lat: &Axis,
    s_lon: &Axis,
    d_lat: &Axis,
    d_lon: &Axis,
    spec: &Interpolation,
) -> Result<Vec<f64>> {
    let src_lat = Side::of(s_lat)?;
    let src_lon = Side::of(s_lon)?;
    let dst_lat = Side::of(d_lat)?;
    let dst_lon = Side::of(d_lon)?;

    let mut data = src.to_owned();
    if src_lat.descending {
        data.invert_axis(NdAxis(0));
    }
    if src_lon.descending {
        data.invert_axis(NdAxis(1));
    }

    // destination cell half-widths in source pixel units
    let half_r = dst_lat.step / src_lat.step / 2.0;
    let half_c = dst_lon.step / src_lon.step / 2.0;

    let mut out = Array2::from_elem((dst_lat.n, dst_lon.n), f64::NAN);
    for i in 0..dst_lat.n {
        let fr = src_lat.pixel(dst_lat.center(i));
        for j in 0..dst_lon.n {
            let fc = src_lon.pixel(dst_lon.center(j));
            out[[i, j]] = match spec.method {
                Method::Nearest | Method::NearestPreview => {
                    point_nearest(&data, &src_lat, &src_lon, fr, fc)
                }
                Method::Bilinear => point_bilinear(&data, &src_lat, &src_lon, fr, fc),
                Method::Cubic | Method::CubicSpline => {
                    point_cubic(&data, &src_lat, &src_lon, fr, fc)
                }
                Method::Lanczos => point_lanczos(&data, &src_lat, &src_lon, fr, fc),
                Method::Average
                | Method::Min
                | Method::Max
                | Method::Med
                | Method::Q1
                | Method::Q3
                | Method::Mode
                | Method::Gauss => {
                    windowed(&data, &src_lat, &src_lon, fr, fc, half_r, half_c, spec.method)
                }
            };
        }
    }

    if dst_lat.descending {
        out.invert_axis(NdAxis(0));
    }
    if dst_lon.descending {
        out.invert_axis(NdAxis(1));
    }
    Ok(out.into_iter().collect())
}

fn point_nearest(data: &Array2<f64>, lat: &Side, lon: &Side, fr: f64, fc: f64) -> f64 {
    if !lat.contains(fr) || !lon.contains(fc) {
        return f64::NAN;
    }
    let r = (fr.round() as usize).min(lat.n - 1);
    let c = (fc.round() as usize).min(lon.n - 1);
    data[[r, c]]
}

fn point_bilinear(data: &Array2<f64>, lat: &Side, lon: &Side, fr: f64, fc: f64) -> f64 {
    if !lat.contains(fr) || !lon.contains(fc) {
        return f64::NAN;
    }
    let (r0, t) = clamp_segment(fr, lat.n);
    let (c0, u) = clamp_segment(fc, lon.n);
    let v00 = data[[r0, c0]];
    let v01 = data[[r0, c0 + 1]];
    let v10 = data[[r0 + 1, c0]];
    let v11 = data[[r0 + 1, c0 + 1]];
    (1.0 - t) * ((1.0 - u) * v00 + u * v01) + t * ((1.0 - u) * v10 + u * v11)
}

/// Segment start and fractional offset, clamped so both taps stay in range.
fn clamp_segment(pixel: f64, n: usize) -> (usize, f64) {
    if pixel <= 0.0 {
        (0, 0.0)
    } else if pixel >= (n - 1) as f64 {
        (n - 2, 1.0)
    } else {
        let lo = pixel.floor() as usize;
        (lo.min(n - 2), pixel - lo as f64)
    }
}

fn point_cubic(data: &Array2<f64>, lat: &Side, lon: &Side, fr: f64, fc: f64) -> f64 {
    if !lat.contains(fr) || !lon.contains(fc) {
        return f64::NAN;
    }
    separable_kernel(data, lat, lon, fr, fc, 2, catmull_rom, false)
}

fn point_lanczos(data: &Array2<f64>, lat: &Side, lon: &Side, fr: f64, fc: f64) -> f64 {
    if !lat.contains(fr) || !lon.contains(fc) {
        return f64::NAN;
    }
    separable_kernel(data, lat, lon, fr, fc, 3, lanczos3, true)
}

/// Separable convolution with edge-clamped taps. With `normalize`, weights
/// are rescaled to sum to one (lanczos); otherwise they already do
/// (Catmull-Rom). Any NaN tap makes the result NaN.
fn separable_kernel(
    data: &Array2<f64>,
    lat: &Side,
    lon: &Side,
    fr: f64,
    fc: f64,
    radius: i64,
    weight: impl Fn(f64) -> f64,
    normalize: bool,
) -> f64 {
    let r0 = fr.floor() as i64;
    let c0 = fc.floor() as i64;
    let mut acc = 0.0;
    let mut wsum = 0.0;

    for dr in (1 - radius)..=radius {
        let r = r0 + dr;
        let wr = weight(fr - r as f64);
        if wr == 0.0 {
            continue;
        }
        let ri = r.clamp(0, lat.n as i64 - 1) as usize;
        for dc in (1 - radius)..=radius {
            let c = c0 + dc;
            let wc = weight(fc - c as f64);
            if wc == 0.0 {
                continue;
            }
            let ci = c.clamp(0, lon.n as i64 - 1) as usize;
            let v = data[[ri, ci]];
            if v.is_nan() {
                return f64::NAN;
            }
            acc += wr * wc * v;
            wsum += wr * wc;
        }
    }
    if normalize {
        if wsum == 0.0 { f64::NAN } else { acc / wsum }
    } else {
        acc
    }
}

fn catmull_rom(x: f64) -> f64 {
    const A: f64 = -0.5;
    let x = x.abs();
    if x < 1.0 {
        (A + 2.0) * x * x * x - (A + 3.0) * x * x + 1.0
    } else if x < 2.0 {
        A * x * x * x - 5.0 * A * x * x + 8.0 * A * x - 4.0 * A
    } else {
        0.0
    }
}

fn lanczos3(x: f64) -> f64 {
    const A: f64 = 3.0;
    if x == 0.0 {
        return 1.0;
    }
    if x.abs() >= A {
        return 0.0;
    }
    let px = std::f64::consts::PI * x;
    A * px.sin() * (px / A).sin() / (px * px)
}

#[allow(clippy::too_many_arguments)]
fn windowed(
    data: &Array2<f64>,
    lat: &Side,
    lon: &Side,
    fr: f64,
    fc: f64,
    half_r: f64,
    half_c: f64,
    method: Method,
) -> f64 {
    const EPS: f64 = 1e-9;
    if !lat.contains(fr) || !lon.contains(fc) {
        return f64::NAN;
    }

    // source pixels whose centers fall within the destination cell
    let r0 = ((fr - half_r - EPS).ceil().max(0.0)) as usize;
    let r1 = (fr + half_r + EPS).floor().min(lat.n as f64 - 1.0) as i64;
    let c0 = ((fc - half_c - EPS).ceil().max(0.0)) as usize;
    let c1 = (fc + half_c + EPS).floor().min(lon.n as f64 - 1.0) as i64;

    if r1 < r0 as i64 || c1 < c0 as i64 {
        // upsampling: the window holds no center, take the nearest pixel
        return point_nearest(data, lat, lon, fr, fc);
    }
    let (r1, c1) = (r1 as usize, c1 as usize);

    if method == Method::Gauss {
        let (sr, sc) = (half_r.max(0.5), half_c.max(0.5));
        let mut acc = 0.0;
        let mut wsum = 0.0;
        for r in r0..=r1 {
            for c in c0..=c1 {
                let v = data[[r, c]];
                if v.is_nan() {
                    continue;
                }
                let (dr, dc) = (r as f64 - fr, c as f64 - fc);
                let w = (-(dr * dr) / (2.0 * sr * sr) - (dc * dc) / (2.0 * sc * sc)).exp();
                acc += w * v;
                wsum += w;
            }
        }
        return if wsum == 0.0 { f64::NAN } else { acc / wsum };
    }

    let mut values: Vec<f64> = Vec::with_capacity((r1 - r0 + 1) * (c1 - c0 + 1));
    for r in r0..=r1 {
        for c in c0..=c1 {
            let v = data[[r, c]];
            if !v.is_nan() {
                values.push(v);
            }
        }
    }
    if values.is_empty() {
        return f64::NAN;
    }

    match method {
        Method::Average => values.iter().sum::<f64>() / values.len() as f64,
        Method::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Method::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Method::Med => percentile(&mut values, 0.5),
        Method::Q1 => percentile(&mut values, 0.25),
        Method::Q3 => percentile(&mut values, 0.75),
        Method::Mode => mode(&mut values),
        _ => f64::NAN,
    }
}

/// Linear-interpolated percentile of the sorted window.
fn percentile(values: &mut [f64], q: f64) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)
}

/// Most frequent value; ties break toward the smallest.
fn mode(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut best = values[0];
    let mut best_run = 0;
    let mut i = 0;
    while i < values.len() {
        let mut j = i;
        while j < values.len() && values[j] == values[i] {
            j += 1;
        }
        if j - i > best_run {
            best_run = j - i;
            best = values[i];
        }
        i = j;
    }
    best
}
