use std::sync::Arc;

use log::debug;
use ndarray::Axis as NdAxis;
use serde_json::json;

use crate::{
    coordinates::{CoordinateSet, IndexSel},
    error::{Error, Result},
    node::{EvalContext, Node, write_output},
    scheduler,
    units::UnitsArray,
};

type SourceOutput = Result<(Option<Vec<String>>, UnitsArray)>;

/// Overlays the outputs of multiple sources with NaN-aware priority: the
/// earliest source wins wherever it has data, later sources only fill what
/// is still missing.
pub struct OrderedCompositor {
    sources: Vec<Arc<dyn Node>>,
    source_coordinates: Option<CoordinateSet>,
    outputs: Option<Vec<String>>,
}

impl std::fmt::Debug for OrderedCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedCompositor")
            .field("sources", &self.sources.iter().map(|s| s.kind()).collect::<Vec<_>>())
            .field("source_coordinates", &self.source_coordinates)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl OrderedCompositor {
    pub fn new(sources: Vec<Arc<dyn Node>>) -> Result<OrderedCompositor> {
        let outputs = union_outputs(&sources)?;
        Ok(OrderedCompositor { sources, source_coordinates: None, outputs })
    }

    /// One synthetic coordinate per source; only sources whose entry
    /// intersects the request are evaluated.
    pub fn with_source_coordinates(
        mut self,
        coords: CoordinateSet,
    ) -> Result<OrderedCompositor> {
        if coords.ndim() != 1 {
            return Err(Error::Configuration(format!(
                "invalid source_coordinates: expected 1 dimension, got {}",
                coords.ndim()
            )));
        }
        if coords.size() != self.sources.len() {
            return Err(Error::Configuration(format!(
                "invalid source_coordinates: {} sources but {} coordinates",
                self.sources.len(),
                coords.size()
            )));
        }
        self.source_coordinates = Some(coords);
        Ok(self)
    }

    pub fn sources(&self) -> &[Arc<dyn Node>] {
        &self.sources
    }

    pub fn select_sources(&self, request: &CoordinateSet) -> Vec<Arc<dyn Node>> {
        let Some(coords) = &self.source_coordinates else {
            return self.sources.clone();
        };
        self.sources
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let entry = coords.take(&[IndexSel::Indices(vec![*i])]);
                entry.intersect(request, false).map_or(true, |(sub, _)| sub.size() > 0)
            })
            .map(|(_, source)| Arc::clone(source))
            .collect()
    }

    /// Ordered overlay. Consumes source outputs lazily and stops as soon as
    /// no cell is missing, so later sources in a sequential iterator are
    /// never evaluated once the result is full.
    pub fn composite(
        &self,
        request: &CoordinateSet,
        items: impl Iterator<Item = SourceOutput>,
    ) -> Result<UnitsArray> {
        let mut result = match &self.outputs {
            Some(outputs) => UnitsArray::nans_with_outputs(request, outputs),
            None => UnitsArray::nans(request),
        };
        let mut missing = result.data().len();

        for item in items {
            if missing == 0 {
                debug!(target: "compositor", "all cells filled, skipping remaining sources");
                break;
            }
            let (source_outputs, tile) = item?;

            match (&self.outputs, source_outputs) {
                (None, None) => {
                    missing -= overlay(&mut result, &tile, None, None)?;
                }
                (Some(union), Some(source_outputs)) => {
                    for (k, name) in source_outputs.iter().enumerate() {
                        let Some(u) = union.iter().position(|n| n == name) else {
                            continue;
                        };
                        missing -= overlay(&mut result, &tile, Some(u), Some(k))?;
                    }
                }
                _ => {
                    return Err(Error::Configuration(
                        "cannot composite standard sources with multi-output sources".into(),
                    ));
                }
            }
        }
        Ok(result)
    }
}

/// Fills still-missing cells of `result` from the finite cells of `tile`,
/// returning how many were filled. Slot indices select one `output` slice
/// on either side.
fn overlay(
    result: &mut UnitsArray,
    tile: &UnitsArray,
    result_slot: Option<usize>,
    tile_slot: Option<usize>,
) -> Result<usize> {
    let result_axis = result.data().ndim().saturating_sub(1);
    let tile_axis = tile.data().ndim().saturating_sub(1);
    let mut dst = match result_slot {
        Some(u) => result.data_mut().index_axis_mut(NdAxis(result_axis), u),
        None => result.data_mut().view_mut(),
    };
    let src = match tile_slot {
        Some(k) => tile.data().index_axis(NdAxis(tile_axis), k),
        None => tile.data().view(),
    };
    if dst.shape() != src.shape() {
        return Err(Error::DimensionMismatch(format!(
            "source output shape {:?} disagrees with the request {:?}",
            src.shape(),
            dst.shape()
        )));
    }

    let mut filled = 0;
    ndarray::Zip::from(&mut dst).and(&src).for_each(|d, &s| {
        if d.is_nan() && !s.is_nan() {
            *d = s;
            filled += 1;
        }
    });
    Ok(filled)
}

fn union_outputs(sources: &[Arc<dyn Node>]) -> Result<Option<Vec<String>>> {
    let mut union: Option<Vec<String>> = None;
    let mut saw_standard = false;
    for source in sources {
        match source.outputs() {
            Some(outputs) => {
                let u = union.get_or_insert_with(Vec::new);
                for name in outputs {
                    if !u.contains(name) {
                        u.push(name.clone());
                    }
                }
            }
            None => saw_standard = true,
        }
    }
    if union.is_some() && saw_standard {
        return Err(Error::Configuration(
            "cannot composite standard sources with multi-output sources".into(),
        ));
    }
    Ok(union)
}

impl Node for OrderedCompositor {
    fn kind(&self) -> &'static str {
        "ordered_compositor"
    }

    fn eval_into(
        &self,
        request: &CoordinateSet,
        out: Option<&mut UnitsArray>,
        ctx: &EvalContext,
    ) -> Result<UnitsArray> {
        ctx.check_cancelled()?;

        let selected = self.select_sources(request);
        debug!(target: "compositor", "compositing {} of {} sources", selected.len(), self.sources.len());

        let result = if ctx.settings().multithreading && selected.len() > 1 {
            let results = scheduler::eval_parallel(&selected, request, ctx);
            let items = selected
                .iter()
                .zip(results)
                .map(|(s, r)| r.map(|a| (s.outputs().map(<[String]>::to_vec), a)));
            self.composite(request, items)?
        } else {
            let items = selected.iter().map(|s| {
                ctx.check_cancelled()?;
                let tile = s.eval(request, ctx)?;
                Ok((s.outputs().map(<[String]>::to_vec), tile))
            });
            self.composite(request, items)?
        };

        write_output(&result, out)?;
        Ok(result)
    }

    fn find_coordinates(&self) -> Vec<CoordinateSet> {
        self.sources.iter().flat_map(|s| s.find_coordinates()).collect()
    }

    fn outputs(&self) -> Option<&[String]> {
        self.outputs.as_deref()
    }

    fn attrs(&self) -> serde_json::Value {
        match &self.source_coordinates {
            Some(coords) => json!({ "source_coordinates": coords.definition() }),
            None => json!({}),
        }
    }

    fn inputs(&self) -> Vec<(String, Arc<dyn Node>)> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("source_{i}"), Arc::clone(s)))
            .collect()
    }
}
