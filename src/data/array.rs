use anyhow::{Context, bail, ensure};
use ndarray::{ArrayD, Axis as NdAxis};
use serde_json::json;

use crate::{
    coordinates::{CoordinateSet, IndexSel},
    data::RasterAdapter,
};

/// In-memory adapter over a dense array. The reference adapter
/// implementation, and the workhorse for tests and derived products.
pub struct ArrayAdapter {
    data: ArrayD<f64>,
    coords: CoordinateSet,
    no_data: Vec<f64>,
    outputs: Option<Vec<String>>,
}

impl ArrayAdapter {
    pub fn new(data: impl Into<ArrayD<f64>>, coords: CoordinateSet) -> anyhow::Result<ArrayAdapter> {
        let data = data.into();
        ensure!(
            data.shape() == coords.shape().as_slice(),
            "array shape {:?} does not match coordinates {:?}",
            data.shape(),
            coords.shape()
        );
        Ok(ArrayAdapter { data, coords, no_data: Vec::new(), outputs: None })
    }

    /// Values remapped to NaN before interpolation.
    pub fn with_no_data(mut self, values: Vec<f64>) -> ArrayAdapter {
        self.no_data = values;
        self
    }

    /// Declares a multi-output array: the trailing dimension indexes the
    /// named outputs.
    pub fn with_outputs(
        data: impl Into<ArrayD<f64>>,
        coords: CoordinateSet,
        outputs: Vec<String>,
    ) -> anyhow::Result<ArrayAdapter> {
        let data = data.into();
        let mut expected = coords.shape();
        expected.push(outputs.len());
        ensure!(
            data.shape() == expected.as_slice(),
            "multi-output array shape {:?} does not match coordinates plus {} outputs",
            data.shape(),
            outputs.len()
        );
        ensure!(!outputs.is_empty(), "multi-output array needs at least one output name");
        Ok(ArrayAdapter { data, coords, no_data: Vec::new(), outputs: Some(outputs) })
    }
}

impl RasterAdapter for ArrayAdapter {
    fn native_coordinates(&self) -> anyhow::Result<CoordinateSet> {
        Ok(self.coords.clone())
    }

    fn read(&self, index: &[IndexSel]) -> anyhow::Result<ArrayD<f64>> {
        if index.len() != self.coords.ndim() {
            bail!(
                "read wants {} index ranges but the array has {} dimensions",
                index.len(),
                self.coords.ndim()
            );
        }
        let mut data = self.data.clone();
        for (axis, sel) in index.iter().enumerate() {
            let positions: Vec<usize> = sel.iter().collect();
            if let Some(&max) = positions.iter().max() {
                ensure!(max < data.shape()[axis], "index {} out of range on axis {}", max, axis);
            }
            data = data.select(NdAxis(axis), &positions);
        }
        Ok(data)
    }

    fn no_data_values(&self) -> &[f64] {
        &self.no_data
    }

    fn outputs(&self) -> Option<&[String]> {
        self.outputs.as_deref()
    }

    fn definition(&self) -> serde_json::Value {
        json!({
            "adapter": "array",
            "shape": self.data.shape(),
            "coordinates": self.coords.definition(),
        })
    }
}

/// Adapter wrapper that fails a fixed number of reads before succeeding.
/// Exercises the retry policy in tests.
#[cfg(test)]
pub(crate) struct FlakyAdapter {
    pub inner: ArrayAdapter,
    pub failures: std::sync::atomic::AtomicU32,
    pub reads: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl RasterAdapter for FlakyAdapter {
    fn native_coordinates(&self) -> anyhow::Result<CoordinateSet> {
        self.inner.native_coordinates()
    }

    fn read(&self, index: &[IndexSel]) -> anyhow::Result<ArrayD<f64>> {
        use std::sync::atomic::Ordering;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("transient upstream failure");
        }
        self.inner.read(index).context("inner read")
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::coordinates::{Axis, AxisName};

    fn coords() -> CoordinateSet {
        CoordinateSet::from_axes([
            Axis::from_values(AxisName::Lat, vec![0.0, 1.0, 2.0]).unwrap(),
            Axis::from_values(AxisName::Lon, vec![0.0, 1.0]).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn shape_must_match_coordinates() {
        let data = Array2::<f64>::zeros((2, 2)).into_dyn();
        assert!(ArrayAdapter::new(data, coords()).is_err());
    }

    #[test]
    fn read_applies_selections_in_native_order() {
        let data = Array2::from_shape_fn((3, 2), |(i, j)| (i * 2 + j) as f64).into_dyn();
        let adapter = ArrayAdapter::new(data, coords()).unwrap();

        let out = adapter
            .read(&[
                IndexSel::Slice { start: 1, end: 3, step: 1 },
                IndexSel::Indices(vec![1]),
            ])
            .unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out[[0, 0]], 3.0);
        assert_eq!(out[[1, 0]], 5.0);
    }

    #[test]
    fn read_rejects_out_of_range() {
        let data = Array2::<f64>::zeros((3, 2)).into_dyn();
        let adapter = ArrayAdapter::new(data, coords()).unwrap();
        assert!(adapter.read(&[IndexSel::Indices(vec![7]), IndexSel::full(2)]).is_err());
    }
}
