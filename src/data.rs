pub mod array;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::{debug, warn};
use ndarray::ArrayD;
use serde_json::json;

pub use array::ArrayAdapter;

use crate::{
    cache::{CacheEntry, Fingerprint},
    coordinates::{CoordinateSet, IndexSel},
    error::{Error, Result},
    interpolation::{self, Interpolation, Method},
    node::{self, EvalContext, Node, write_output},
    units::{OUTPUT_DIM, UnitsArray},
};

/// External collaborator interface: turns remote tiles into dense float
/// buffers restricted to index ranges of the native coordinates.
pub trait RasterAdapter: Send + Sync + 'static {
    fn native_coordinates(&self) -> anyhow::Result<CoordinateSet>;

    /// Idempotent; called lazily before the first read.
    fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) {}

    /// Row-major in native dimension order; the buffer shape matches the
    /// selection (multi-output adapters append one trailing axis).
    fn read(&self, index: &[IndexSel]) -> anyhow::Result<ArrayD<f64>>;

    /// Values remapped to NaN before any interpolation.
    fn no_data_values(&self) -> &[f64] {
        &[]
    }

    fn outputs(&self) -> Option<&[String]> {
        None
    }

    /// Identifying attributes for definitions and cache fingerprints.
    fn definition(&self) -> serde_json::Value {
        json!({ "adapter": "unknown" })
    }
}

/// A leaf node that fetches only the tiles intersecting the request and
/// interpolates them onto the request grid.
pub struct DataSource<A: RasterAdapter> {
    adapter: A,
    interpolation: Interpolation,
    opened: Mutex<bool>,
}

impl<A: RasterAdapter> DataSource<A> {
    pub fn new(adapter: A) -> DataSource<A> {
        DataSource { adapter, interpolation: Interpolation::default(), opened: Mutex::new(false) }
    }

    pub fn with_interpolation(mut self, interpolation: impl Into<Interpolation>) -> DataSource<A> {
        self.interpolation = interpolation.into();
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn interpolation(&self) -> &Interpolation {
        &self.interpolation
    }

    fn native(&self) -> Result<CoordinateSet> {
        self.adapter
            .native_coordinates()
            .map_err(|source| Error::UpstreamUnavailable { attempts: 1, source })
    }

    fn ensure_open(&self) -> Result<()> {
        let mut opened = self.opened.lock().expect("open flag poisoned");
        if !*opened {
            self.adapter
                .open()
                .map_err(|source| Error::UpstreamUnavailable { attempts: 1, source })?;
            *opened = true;
        }
        Ok(())
    }

    /// Exponential backoff bounded by the retry deadline, then
    /// [`Error::UpstreamUnavailable`].
    fn read_with_retry(&self, index: &[IndexSel], ctx: &EvalContext) -> Result<ArrayD<f64>> {
        let settings = ctx.settings();
        let max_attempts = settings.retry_max_attempts.max(1);
        let deadline = Instant::now() + Duration::from_millis(settings.retry_deadline_ms);
        let mut delay = Duration::from_millis(settings.retry_base_delay_ms.max(1));
        let mut attempt = 0;

        loop {
            attempt += 1;
            ctx.check_cancelled()?;
            match self.adapter.read(index) {
                Ok(data) => return Ok(data),
                Err(source) => {
                    if attempt >= max_attempts || Instant::now() + delay > deadline {
                        return Err(Error::UpstreamUnavailable { attempts: attempt, source });
                    }
                    warn!(target: "datasource", "read failed on attempt {attempt}: {source:#}; retrying in {delay:?}");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }

    fn nan_fill(&self, request: &CoordinateSet) -> UnitsArray {
        match self.adapter.outputs() {
            Some(outputs) => UnitsArray::nans_with_outputs(request, outputs),
            None => UnitsArray::nans(request),
        }
    }
}

impl DataSource<ArrayAdapter> {
    pub fn from_array(
        data: impl Into<ArrayD<f64>>,
        coords: CoordinateSet,
    ) -> Result<DataSource<ArrayAdapter>> {
        let adapter = ArrayAdapter::new(data, coords)
            .map_err(|err| Error::InvalidCoordinates(format!("{err:#}")))?;
        Ok(DataSource::new(adapter))
    }
}

impl<A: RasterAdapter> Node for DataSource<A> {
    fn kind(&self) -> &'static str {
        "data_source"
    }

    fn eval_into(
        &self,
        request: &CoordinateSet,
        out: Option<&mut UnitsArray>,
        ctx: &EvalContext,
    ) -> Result<UnitsArray> {
        ctx.check_cancelled()?;

        let fingerprint = ctx.cache().map(|_| Fingerprint::of(&node::definition(self), request));
        if let (Some(cache), Some(fp)) = (ctx.cache(), &fingerprint) {
            if let Some(CacheEntry::Array(hit)) = cache.get(fp) {
                debug!(target: "datasource", "cache hit for {fp}");
                write_output(&hit, out)?;
                return Ok(hit);
            }
        }

        let native = self.native()?;
        let outer = self.interpolation.method != Method::Nearest;
        let (mut sub, mut index) = native.intersect(request, outer)?;

        if sub.size() == 0 {
            debug!(target: "datasource", "request does not intersect the native coordinates");
            let result = self.nan_fill(request);
            write_output(&result, out)?;
            return Ok(result);
        }

        // preview requests stride the native grid down to the request
        // cadence to minimize I/O; a finer request keeps the source cadence
        if self.interpolation.method == Method::NearestPreview {
            for (i, dim) in sub.dims().iter().enumerate() {
                let axis = &dim.axes()[0];
                let stride = request
                    .single_axis(axis.name())
                    .and_then(|req_axis| match (axis.step(), req_axis.step()) {
                        (Some(native_step), Some(req_step)) => {
                            Some((req_step.abs_f64() / native_step.abs_f64()).round() as usize)
                        }
                        _ => None,
                    })
                    .unwrap_or(1)
                    .max(1);
                if stride > 1 && !dim.is_stacked() {
                    index[i] = index[i].strided(stride);
                }
            }
            sub = native.take(&index);
        }

        self.ensure_open()?;
        let data = self.read_with_retry(&index, ctx)?;

        let mut dims = sub.dim_names();
        let mut expected = sub.shape();
        if let Some(outputs) = self.adapter.outputs() {
            dims.push(OUTPUT_DIM.to_string());
            expected.push(outputs.len());
        }
        if data.shape() != expected.as_slice() {
            return Err(Error::DimensionMismatch(format!(
                "adapter read returned shape {:?}, expected {:?}",
                data.shape(),
                expected
            )));
        }
        let mut tile = UnitsArray::new(data, dims)?;

        let no_data = self.adapter.no_data_values();
        if !no_data.is_empty() {
            tile.data_mut()
                .mapv_inplace(|v| if no_data.contains(&v) { f64::NAN } else { v });
        }

        let result = interpolation::interpolate(&tile, &sub, request, &self.interpolation, ctx)?;
        write_output(&result, out)?;

        if let (Some(cache), Some(fp)) = (ctx.cache(), fingerprint) {
            cache.put(fp, CacheEntry::Array(result.clone()), false);
        }
        Ok(result)
    }

    fn find_coordinates(&self) -> Vec<CoordinateSet> {
        match self.adapter.native_coordinates() {
            Ok(coords) => vec![coords],
            Err(err) => {
                warn!(target: "datasource", "native coordinates unavailable: {err:#}");
                Vec::new()
            }
        }
    }

    fn outputs(&self) -> Option<&[String]> {
        self.adapter.outputs()
    }

    fn attrs(&self) -> serde_json::Value {
        json!({
            "interpolation": self.interpolation,
            "source": self.adapter.definition(),
        })
    }
}

impl<A: RasterAdapter> Drop for DataSource<A> {
    fn drop(&mut self) {
        if *self.opened.lock().expect("open flag poisoned") {
            self.adapter.close();
        }
    }
}

/// Evaluates another node at fixed coordinates and interpolates that
/// coarser (or reprojected) result onto the request. Useful to average a
/// source over a larger area before refining bilinearly.
pub struct ReprojectedSource {
    source: Arc<dyn Node>,
    reprojected_coordinates: CoordinateSet,
    interpolation: Interpolation,
}

impl ReprojectedSource {
    pub fn new(source: Arc<dyn Node>, reprojected_coordinates: CoordinateSet) -> ReprojectedSource {
        ReprojectedSource {
            source,
            reprojected_coordinates,
            interpolation: Interpolation::default(),
        }
    }

    pub fn with_interpolation(
        mut self,
        interpolation: impl Into<Interpolation>,
    ) -> ReprojectedSource {
        self.interpolation = interpolation.into();
        self
    }

    /// The source's advertised dimensions with the reprojected dimensions
    /// substituted where present.
    fn native(&self) -> CoordinateSet {
        let Some(advertised) = self.source.find_coordinates().into_iter().next() else {
            return self.reprojected_coordinates.clone();
        };
        let dims = advertised
            .dims()
            .iter()
            .map(|dim| {
                self.reprojected_coordinates
                    .dim_index(&dim.name())
                    .map(|i| self.reprojected_coordinates.dims()[i].clone())
                    .unwrap_or_else(|| dim.clone())
            })
            .collect();
        CoordinateSet::new(dims).unwrap_or_else(|_| self.reprojected_coordinates.clone())
    }
}

impl Node for ReprojectedSource {
    fn kind(&self) -> &'static str {
        "reprojected_source"
    }

    fn eval_into(
        &self,
        request: &CoordinateSet,
        out: Option<&mut UnitsArray>,
        ctx: &EvalContext,
    ) -> Result<UnitsArray> {
        ctx.check_cancelled()?;

        let native = self.native();
        let outer = !self.interpolation.method.is_nearest_like();
        let (sub, _) = native.intersect(request, outer)?;
        if sub.size() == 0 {
            let result = UnitsArray::nans(request);
            write_output(&result, out)?;
            return Ok(result);
        }

        let data = self.source.eval(&sub, ctx)?;
        let result = interpolation::interpolate(&data, &sub, request, &self.interpolation, ctx)?;
        write_output(&result, out)?;
        Ok(result)
    }

    fn find_coordinates(&self) -> Vec<CoordinateSet> {
        vec![self.native()]
    }

    fn attrs(&self) -> serde_json::Value {
        json!({
            "interpolation": self.interpolation,
            "reprojected_coordinates": self.reprojected_coordinates.definition(),
        })
    }

    fn inputs(&self) -> Vec<(String, Arc<dyn Node>)> {
        vec![("source".to_string(), Arc::clone(&self.source))]
    }
}
