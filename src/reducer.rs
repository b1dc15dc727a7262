use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use enum_iterator::Sequence;
use log::debug;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    coordinates::CoordinateSet,
    error::{Error, Result},
    node::{EvalContext, Node, write_output},
    units::UnitsArray,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Sequence, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceKind {
    Mean,
    Sum,
    Count,
    Min,
    Max,
    Std,
    Median,
    Mode,
}

impl ReduceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReduceKind::Mean => "mean",
            ReduceKind::Sum => "sum",
            ReduceKind::Count => "count",
            ReduceKind::Min => "min",
            ReduceKind::Max => "max",
            ReduceKind::Std => "std",
            ReduceKind::Median => "median",
            ReduceKind::Mode => "mode",
        }
    }

    /// Whether a memory-bounded streaming recurrence exists. Median and
    /// mode are exact and materialize the full input instead; the engine
    /// dispatches on this flag rather than trying and recovering.
    pub fn supports_chunked(self) -> bool {
        !matches!(self, ReduceKind::Median | ReduceKind::Mode)
    }
}

impl Display for ReduceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReduceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<ReduceKind> {
        enum_iterator::all::<ReduceKind>()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown reduction '{s}'")))
    }
}

/// Collapses a subset of the request dimensions with a streaming
/// aggregation, evaluating the input in budget-sized tiles when one is
/// configured.
pub struct Reduce {
    input: Arc<dyn Node>,
    kind: ReduceKind,
    dims: Vec<String>,
    chunk_size: Option<usize>,
}

impl Reduce {
    pub fn new(
        kind: ReduceKind,
        input: Arc<dyn Node>,
        dims: impl IntoIterator<Item = impl Into<String>>,
    ) -> Reduce {
        Reduce {
            input,
            kind,
            dims: dims.into_iter().map(Into::into).collect(),
            chunk_size: None,
        }
    }

    /// Cell budget per tile; overrides the settings value.
    pub fn with_chunk_size(mut self, cells: usize) -> Reduce {
        self.chunk_size = Some(cells);
        self
    }

    /// Translates the requested reduce dimensions against the request:
    /// direct matches pass, a joined name like `lat_lon` expands to its
    /// unstacked parts, anything else is rejected.
    fn resolve_dims(&self, request: &CoordinateSet) -> Result<Vec<String>> {
        let names = request.dim_names();
        let mut resolved: Vec<String> = Vec::new();
        for dim in &self.dims {
            if names.contains(dim) {
                if !resolved.contains(dim) {
                    resolved.push(dim.clone());
                }
                continue;
            }
            let parts: Vec<&str> = dim.split('_').collect();
            if parts.len() > 1 && parts.iter().all(|p| names.iter().any(|n| n == p)) {
                for part in parts {
                    if !resolved.iter().any(|r| r == part) {
                        resolved.push(part.to_string());
                    }
                }
                continue;
            }
            return Err(Error::DimensionMismatch(format!(
                "cannot reduce dimension '{dim}': not in the request"
            )));
        }
        Ok(resolved)
    }

    fn reduce_full(&self, x: &UnitsArray, reduced: &[String]) -> Result<UnitsArray> {
        match self.kind {
            ReduceKind::Mean => x.nanmean(reduced),
            ReduceKind::Sum => x.nansum(reduced),
            ReduceKind::Count => x.count_finite(reduced),
            ReduceKind::Min => x.nanmin(reduced),
            ReduceKind::Max => x.nanmax(reduced),
            ReduceKind::Std => {
                let (kept_dims, kept_shape) = kept_layout(x, reduced)?;
                let mut acc = Accumulator::new(ReduceKind::Std, kept_dims, kept_shape);
                acc.update(x, reduced)?;
                acc.finish()
            }
            ReduceKind::Median | ReduceKind::Mode => buffered(x, reduced, self.kind),
        }
    }

    fn reduce_chunked(
        &self,
        request: &CoordinateSet,
        kept: &CoordinateSet,
        reduced: &[String],
        budget: usize,
        ctx: &EvalContext,
    ) -> Result<UnitsArray> {
        let chunk_shape = request.chunk_shape(budget, reduced);
        debug!(target: "reducer", "streaming {} over {reduced:?} in chunks of {chunk_shape:?}", self.kind);

        let mut acc = Accumulator::new(self.kind, kept.dim_names(), kept.shape());
        let mut chunks = 0usize;
        for (chunk_coords, _) in request.iter_chunks(&chunk_shape)? {
            ctx.check_cancelled()?;
            let tile = self.input.eval(&chunk_coords, ctx)?;
            acc.update(&tile, reduced)?;
            chunks += 1;
        }
        debug!(target: "reducer", "consumed {chunks} tiles");
        acc.finish()
    }
}

impl Node for Reduce {
    fn kind(&self) -> &'static str {
        "reduce"
    }

    fn eval_into(
        &self,
        request: &CoordinateSet,
        out: Option<&mut UnitsArray>,
        ctx: &EvalContext,
    ) -> Result<UnitsArray> {
        ctx.check_cancelled()?;

        let reduced = self.resolve_dims(request)?;
        let kept = request.drop_dims(&reduced);
        let budget = self.chunk_size.or(ctx.settings().chunk_size);

        let result = match budget {
            Some(cells) if self.kind.supports_chunked() && cells < request.size() => {
                self.reduce_chunked(request, &kept, &reduced, cells, ctx)?
            }
            _ => {
                let full = self.input.eval(request, ctx)?;
                self.reduce_full(&full, &reduced)?
            }
        };

        write_output(&result, out)?;
        Ok(result)
    }

    fn find_coordinates(&self) -> Vec<CoordinateSet> {
        self.input.find_coordinates()
    }

    fn attrs(&self) -> serde_json::Value {
        json!({
            "reduction": self.kind,
            "dims": self.dims,
            "chunk_size": self.chunk_size,
        })
    }

    fn inputs(&self) -> Vec<(String, Arc<dyn Node>)> {
        vec![("input".to_string(), Arc::clone(&self.input))]
    }
}

fn kept_layout(x: &UnitsArray, reduced: &[String]) -> Result<(Vec<String>, Vec<usize>)> {
    let mut dims = Vec::new();
    let mut shape = Vec::new();
    for (i, name) in x.dims().iter().enumerate() {
        if !reduced.contains(name) {
            dims.push(name.clone());
            shape.push(x.data().shape()[i]);
        }
    }
    Ok((dims, shape))
}

/// Streaming state over the kept-dimension grid. The chunk-shape policy
/// never splits kept dimensions, so every tile reduces to exactly this
/// shape.
struct Accumulator {
    kind: ReduceKind,
    dims: Vec<String>,
    shape: Vec<usize>,
    /// sum, running min/max, or the Welford running mean
    a: ArrayD<f64>,
    /// finite count / Welford n
    b: ArrayD<f64>,
    /// Welford M2
    c: ArrayD<f64>,
}

impl Accumulator {
    fn new(kind: ReduceKind, dims: Vec<String>, shape: Vec<usize>) -> Accumulator {
        let fill = match kind {
            ReduceKind::Min | ReduceKind::Max => f64::NAN,
            _ => 0.0,
        };
        Accumulator {
            kind,
            dims,
            a: ArrayD::from_elem(IxDyn(&shape), fill),
            b: ArrayD::zeros(IxDyn(&shape)),
            c: ArrayD::zeros(IxDyn(&shape)),
            shape,
        }
    }

    fn update(&mut self, tile: &UnitsArray, reduced: &[String]) -> Result<()> {
        let check = |t: &UnitsArray| {
            if t.dims() != self.dims || t.data().shape() != self.shape.as_slice() {
                return Err(Error::DimensionMismatch(format!(
                    "tile reduces to {:?} {:?}, accumulator holds {:?} {:?}",
                    t.dims(),
                    t.data().shape(),
                    self.dims,
                    self.shape
                )));
            }
            Ok(())
        };

        match self.kind {
            ReduceKind::Sum => {
                let t = tile.nansum(reduced)?;
                check(&t)?;
                self.a.zip_mut_with(t.data(), |a, &v| *a += v);
            }
            ReduceKind::Count => {
                let t = tile.count_finite(reduced)?;
                check(&t)?;
                self.b.zip_mut_with(t.data(), |b, &v| *b += v);
            }
            ReduceKind::Mean => {
                let s = tile.nansum(reduced)?;
                check(&s)?;
                let n = tile.count_finite(reduced)?;
                self.a.zip_mut_with(s.data(), |a, &v| *a += v);
                self.b.zip_mut_with(n.data(), |b, &v| *b += v);
            }
            ReduceKind::Min => {
                let t = tile.nanmin(reduced)?;
                check(&t)?;
                self.a.zip_mut_with(t.data(), |a, &v| {
                    if !v.is_nan() {
                        *a = if a.is_nan() { v } else { a.min(v) };
                    }
                });
            }
            ReduceKind::Max => {
                let t = tile.nanmax(reduced)?;
                check(&t)?;
                self.a.zip_mut_with(t.data(), |a, &v| {
                    if !v.is_nan() {
                        *a = if a.is_nan() { v } else { a.max(v) };
                    }
                });
            }
            ReduceKind::Std => {
                let (n_b, mean_b, m2_b) = tile_welford(tile, reduced, &self.dims, &self.shape)?;
                // Chan's parallel merge of the tile triple into the running one
                ndarray::Zip::from(&mut self.b)
                    .and(&mut self.a)
                    .and(&mut self.c)
                    .and(&n_b)
                    .and(&mean_b)
                    .and(&m2_b)
                    .for_each(|na, mean_a, m2_a, &nb, &mb, &m2b| {
                        if nb == 0.0 {
                            return;
                        }
                        if *na == 0.0 {
                            *na = nb;
                            *mean_a = mb;
                            *m2_a = m2b;
                            return;
                        }
                        let n = *na + nb;
                        let delta = mb - *mean_a;
                        *m2_a += m2b + delta * delta * *na * nb / n;
                        *mean_a += delta * nb / n;
                        *na = n;
                    });
            }
            ReduceKind::Median | ReduceKind::Mode => {
                return Err(Error::Configuration(format!(
                    "{} has no streaming recurrence",
                    self.kind
                )));
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<UnitsArray> {
        let data = match self.kind {
            ReduceKind::Sum | ReduceKind::Min | ReduceKind::Max => self.a,
            ReduceKind::Count => self.b,
            ReduceKind::Mean => {
                let mut a = self.a;
                a.zip_mut_with(&self.b, |s, &n| *s /= n);
                a
            }
            ReduceKind::Std => {
                // population standard deviation
                let mut c = self.c;
                c.zip_mut_with(&self.b, |m2, &n| *m2 = (*m2 / n).sqrt());
                c
            }
            ReduceKind::Median | ReduceKind::Mode => {
                return Err(Error::Configuration(format!(
                    "{} has no streaming recurrence",
                    self.kind
                )));
            }
        };
        UnitsArray::new(data, self.dims)
    }
}

/// Per-cell Welford triple `(n, mean, M2)` of one tile along the reduced
/// dimensions.
fn tile_welford(
    tile: &UnitsArray,
    reduced: &[String],
    kept_dims: &[String],
    kept_shape: &[usize],
) -> Result<(ArrayD<f64>, ArrayD<f64>, ArrayD<f64>)> {
    let (dims, shape) = kept_layout(tile, reduced)?;
    if dims != kept_dims || shape != kept_shape {
        return Err(Error::DimensionMismatch(format!(
            "tile keeps {dims:?} {shape:?}, accumulator holds {kept_dims:?} {kept_shape:?}"
        )));
    }

    let kept_pos: Vec<usize> = tile
        .dims()
        .iter()
        .enumerate()
        .filter(|(_, name)| !reduced.contains(name))
        .map(|(i, _)| i)
        .collect();
    let strides = row_major_strides(kept_shape);
    let kept_len: usize = kept_shape.iter().product::<usize>().max(1);

    let mut n = vec![0.0; kept_len];
    let mut mean = vec![0.0; kept_len];
    let mut m2 = vec![0.0; kept_len];

    let tile_shape = tile.data().shape().to_vec();
    let mut idx = vec![0usize; tile_shape.len()];
    for &v in tile.data().iter() {
        if !v.is_nan() {
            let k: usize = kept_pos.iter().zip(&strides).map(|(&p, &s)| idx[p] * s).sum();
            n[k] += 1.0;
            let delta = v - mean[k];
            mean[k] += delta / n[k];
            m2[k] += delta * (v - mean[k]);
        }
        advance(&mut idx, &tile_shape);
    }

    let build = |v: Vec<f64>| {
        ArrayD::from_shape_vec(IxDyn(kept_shape), v)
            .map_err(|e| Error::DimensionMismatch(format!("welford buffer: {e}")))
    };
    Ok((build(n)?, build(mean)?, build(m2)?))
}

/// Exact median / mode with full materialization.
fn buffered(x: &UnitsArray, reduced: &[String], kind: ReduceKind) -> Result<UnitsArray> {
    let (kept_dims, kept_shape) = kept_layout(x, reduced)?;
    let kept_pos: Vec<usize> = x
        .dims()
        .iter()
        .enumerate()
        .filter(|(_, name)| !reduced.contains(name))
        .map(|(i, _)| i)
        .collect();
    // reject unknown reduce names explicitly
    for name in reduced {
        if !x.dims().contains(name) {
            return Err(Error::DimensionMismatch(format!(
                "cannot reduce dimension '{name}': not in the input"
            )));
        }
    }

    let strides = row_major_strides(&kept_shape);
    let kept_len: usize = kept_shape.iter().product::<usize>().max(1);
    let mut cells: Vec<Vec<f64>> = vec![Vec::new(); kept_len];

    let shape = x.data().shape().to_vec();
    let mut idx = vec![0usize; shape.len()];
    for &v in x.data().iter() {
        if !v.is_nan() {
            let k: usize = kept_pos.iter().zip(&strides).map(|(&p, &s)| idx[p] * s).sum();
            cells[k].push(v);
        }
        advance(&mut idx, &shape);
    }

    let values: Vec<f64> = cells
        .into_iter()
        .map(|mut cell| {
            if cell.is_empty() {
                return f64::NAN;
            }
            cell.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            match kind {
                ReduceKind::Median => {
                    let mid = cell.len() / 2;
                    if cell.len() % 2 == 1 {
                        cell[mid]
                    } else {
                        (cell[mid - 1] + cell[mid]) / 2.0
                    }
                }
                // longest run of equal values, ties toward the smallest
                _ => {
                    let mut best = cell[0];
                    let mut best_run = 0;
                    let mut i = 0;
                    while i < cell.len() {
                        let mut j = i;
                        while j < cell.len() && cell[j] == cell[i] {
                            j += 1;
                        }
                        if j - i > best_run {
                            best_run = j - i;
                            best = cell[i];
                        }
                        i = j;
                    }
                    best
                }
            }
        })
        .collect();

    let data = ArrayD::from_shape_vec(IxDyn(&kept_shape), values)
        .map_err(|e| Error::DimensionMismatch(format!("reduce buffer: {e}")))?;
    UnitsArray::new(data, kept_dims)
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn advance(idx: &mut [usize], shape: &[usize]) {
    for i in (0..idx.len()).rev() {
        idx[i] += 1;
        if idx[i] < shape[i] {
            return;
        }
        idx[i] = 0;
    }
}
