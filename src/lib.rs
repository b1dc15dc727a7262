//! Lazy, composable pipeline engine for evaluating geospatial/temporal
//! raster queries against heterogeneous data sources.
//!
//! A pipeline is a DAG of [`Node`]s: data sources, compositors and
//! reducers. Evaluating the root at a request [`CoordinateSet`] fetches
//! only the tiles that intersect the request, interpolates each tile onto
//! the request grid, composites overlapping sources in priority order and
//! streams reductions in bounded memory.

pub mod cache;
pub mod compositor;
pub mod coordinates;
pub mod data;
pub mod error;
pub mod interpolation;
pub mod node;
pub mod reducer;
pub mod scheduler;
pub mod settings;
pub mod units;

pub use crate::{
    cache::{Cache, CacheEntry, Fingerprint, MemoryCache},
    compositor::OrderedCompositor,
    coordinates::{
        Axis, AxisName, AxisValues, Boundary, Coord, CoordinateSet, Dimension, IndexSel, Offset,
        Step, TimeUnit,
    },
    data::{ArrayAdapter, DataSource, RasterAdapter, ReprojectedSource},
    error::{Error, Result},
    interpolation::{Interpolation, Method, interpolate},
    node::{EvalContext, Node, NodeDefinition, definition, validate_graph},
    reducer::{Reduce, ReduceKind},
    scheduler::ThreadBudget,
    settings::Settings,
    units::UnitsArray,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::Array2;

    use super::*;

    fn grid(lat: Vec<f64>, lon: Vec<f64>) -> CoordinateSet {
        CoordinateSet::from_axes([
            Axis::from_values(AxisName::Lat, lat).unwrap(),
            Axis::from_values(AxisName::Lon, lon).unwrap(),
        ])
        .unwrap()
    }

    /// A compositor over two partially overlapping sources feeding a
    /// chunked mean, evaluated end to end.
    #[test]
    fn composite_then_reduce_pipeline() {
        let acoords = grid(vec![0.0, 1.0], vec![0.0, 1.0, 2.0]);
        let mut a = Array2::from_elem((2, 3), 2.0);
        a[[0, 0]] = f64::NAN;
        let bcoords = grid(vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]);
        let b = Array2::from_elem((3, 3), 4.0);

        let composite: Arc<dyn Node> = Arc::new(
            OrderedCompositor::new(vec![
                Arc::new(DataSource::from_array(a.into_dyn(), acoords).unwrap()),
                Arc::new(DataSource::from_array(b.into_dyn(), bcoords).unwrap()),
            ])
            .unwrap(),
        );
        validate_graph(&composite).unwrap();

        let request = grid(vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]);
        let ctx = EvalContext::with_settings(Settings {
            multithreading: false,
            ..Settings::default()
        });

        // overlay: source a wins where finite, b fills the gaps
        let overlay = composite.eval(&request, &ctx).unwrap();
        assert_eq!(overlay.data()[[0, 0]], 4.0);
        assert_eq!(overlay.data()[[0, 1]], 2.0);
        assert_eq!(overlay.data()[[2, 2]], 4.0);

        // row means, streamed a few columns at a time
        let mean =
            Reduce::new(ReduceKind::Mean, Arc::clone(&composite), ["lon"]).with_chunk_size(6);
        let out = mean.eval(&request, &ctx).unwrap();
        assert_eq!(out.dims(), ["lat"]);
        let got: Vec<f64> = out.data().iter().copied().collect();
        assert!((got[0] - 8.0 / 3.0).abs() < 1e-12);
        assert!((got[1] - 2.0).abs() < 1e-12);
        assert!((got[2] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn definitions_fingerprint_the_whole_graph() {
        let coords = grid(vec![0.0, 1.0], vec![0.0, 1.0]);
        let source: Arc<dyn Node> = Arc::new(
            DataSource::from_array(Array2::zeros((2, 2)).into_dyn(), coords.clone()).unwrap(),
        );
        let mean = Reduce::new(ReduceKind::Mean, Arc::clone(&source), ["lat"]);
        let sum = Reduce::new(ReduceKind::Sum, source, ["lat"]);

        let def_mean = definition(&mean);
        assert_eq!(def_mean.kind, "reduce");
        assert!(def_mean.inputs.contains_key("input"));

        let fp_mean = Fingerprint::of(&def_mean, &coords);
        let fp_sum = Fingerprint::of(&definition(&sum), &coords);
        assert_ne!(fp_mean, fp_sum);
        assert_eq!(fp_mean, Fingerprint::of(&definition(&mean), &coords));
    }
}
