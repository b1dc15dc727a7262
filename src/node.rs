use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use petgraph::{
    algo::is_cyclic_directed,
    graph::{DiGraph, NodeIndex},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::Cache,
    coordinates::CoordinateSet,
    error::{Error, Result},
    scheduler::ThreadBudget,
    settings::Settings,
    units::UnitsArray,
};

/// The abstract evaluation unit. Implementations must be deterministic
/// given their inputs and the request (modulo data-source side effects).
pub trait Node: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Evaluates the node at the request grid, writing into `out` when
    /// provided. The returned array is owned by the caller.
    fn eval_into(
        &self,
        request: &CoordinateSet,
        out: Option<&mut UnitsArray>,
        ctx: &EvalContext,
    ) -> Result<UnitsArray>;

    fn eval(&self, request: &CoordinateSet, ctx: &EvalContext) -> Result<UnitsArray> {
        self.eval_into(request, None, ctx)
    }

    /// Best-effort static coordinate advertisement.
    fn find_coordinates(&self) -> Vec<CoordinateSet> {
        Vec::new()
    }

    /// Output names for multi-output sources; `None` for standard nodes.
    fn outputs(&self) -> Option<&[String]> {
        None
    }

    /// Configuration attributes for the serialized definition.
    fn attrs(&self) -> serde_json::Value {
        json!({})
    }

    /// Input ports, for graph walking and serialization.
    fn inputs(&self) -> Vec<(String, Arc<dyn Node>)> {
        Vec::new()
    }
}

/// Serializable node shape: `{kind, attrs, inputs}` with inputs mapping
/// port names to nested definitions. The on-disk encoding is a
/// collaborator concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub kind: String,
    #[serde(default)]
    pub attrs: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, NodeDefinition>,
}

pub fn definition(node: &dyn Node) -> NodeDefinition {
    NodeDefinition {
        kind: node.kind().to_string(),
        attrs: node.attrs(),
        inputs: node
            .inputs()
            .into_iter()
            .map(|(port, input)| (port, definition(&*input)))
            .collect(),
    }
}

/// Per-eval state: a settings snapshot (read once at the start of the
/// evaluation), a cancellation token checked at suspension points, the
/// shared thread budget and an optional result cache.
#[derive(Clone)]
pub struct EvalContext {
    settings: Arc<Settings>,
    cancel: CancellationToken,
    budget: Arc<ThreadBudget>,
    cache: Option<Arc<dyn Cache>>,
}

impl EvalContext {
    pub fn new() -> EvalContext {
        EvalContext::with_settings(Settings::global().clone())
    }

    pub fn with_settings(settings: Settings) -> EvalContext {
        let budget = Arc::new(ThreadBudget::new(settings.n_threads));
        EvalContext {
            settings: Arc::new(settings),
            cancel: CancellationToken::new(),
            budget,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> EvalContext {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn budget(&self) -> &Arc<ThreadBudget> {
        &self.budget
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        EvalContext::new()
    }
}

/// Walks the graph and rejects cycles. Shared subtrees (the same node
/// reached through several parents) are fine and counted once. Returns the
/// number of distinct nodes.
pub fn validate_graph(root: &Arc<dyn Node>) -> Result<usize> {
    fn key(node: &Arc<dyn Node>) -> *const () {
        Arc::as_ptr(node) as *const ()
    }

    let mut graph: DiGraph<(), ()> = DiGraph::new();
    let mut seen: HashMap<*const (), NodeIndex> = HashMap::new();

    let root_ix = graph.add_node(());
    seen.insert(key(root), root_ix);
    let mut stack: Vec<Arc<dyn Node>> = vec![Arc::clone(root)];

    while let Some(node) = stack.pop() {
        let from = seen[&key(&node)];
        for (_, input) in node.inputs() {
            let to = match seen.get(&key(&input)) {
                Some(&ix) => ix,
                None => {
                    let ix = graph.add_node(());
                    seen.insert(key(&input), ix);
                    stack.push(Arc::clone(&input));
                    ix
                }
            };
            graph.add_edge(from, to, ());
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(Error::Configuration("node graph contains a cycle".into()));
    }
    Ok(graph.node_count())
}

/// Checks a caller-provided output array against the request before a node
/// writes into it.
pub(crate) fn write_output(
    result: &UnitsArray,
    out: Option<&mut UnitsArray>,
) -> Result<()> {
    if let Some(out) = out {
        if out.dims() != result.dims() || out.data().shape() != result.data().shape() {
            return Err(Error::DimensionMismatch(format!(
                "output array dimensions {:?} disagree with the request {:?}",
                out.dims(),
                result.dims()
            )));
        }
        out.data_mut().assign(result.data());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::{Axis, AxisName};

    struct Constant {
        value: f64,
        inputs: Vec<Arc<dyn Node>>,
    }

    impl Constant {
        fn new(value: f64) -> Constant {
            Constant { value, inputs: Vec::new() }
        }
    }

    impl Node for Constant {
        fn kind(&self) -> &'static str {
            "constant"
        }

        fn eval_into(
            &self,
            request: &CoordinateSet,
            out: Option<&mut UnitsArray>,
            _ctx: &EvalContext,
        ) -> Result<UnitsArray> {
            let result = UnitsArray::filled(request, self.value);
            write_output(&result, out)?;
            Ok(result)
        }

        fn attrs(&self) -> serde_json::Value {
            json!({ "value": self.value })
        }

        fn inputs(&self) -> Vec<(String, Arc<dyn Node>)> {
            self.inputs
                .iter()
                .enumerate()
                .map(|(i, n)| (format!("input_{i}"), Arc::clone(n)))
                .collect()
        }
    }

    fn request() -> CoordinateSet {
        CoordinateSet::from_axes([
            Axis::from_values(AxisName::Lat, vec![0.0, 1.0]).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn eval_shape_matches_request() {
        let node = Constant::new(3.0);
        let out = node.eval(&request(), &EvalContext::with_settings(Settings::default())).unwrap();
        assert_eq!(out.data().shape(), &[2]);
        assert!(out.data().iter().all(|&v| v == 3.0));
    }

    #[test]
    fn output_array_must_match() {
        let node = Constant::new(1.0);
        let ctx = EvalContext::with_settings(Settings::default());
        let other = CoordinateSet::from_axes([
            Axis::from_values(AxisName::Lon, vec![0.0, 1.0, 2.0]).unwrap(),
        ])
        .unwrap();
        let mut out = UnitsArray::nans(&other);
        assert!(matches!(
            node.eval_into(&request(), Some(&mut out), &ctx),
            Err(Error::DimensionMismatch(_))
        ));

        let mut out = UnitsArray::nans(&request());
        node.eval_into(&request(), Some(&mut out), &ctx).unwrap();
        assert!(out.data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn definition_shape() {
        let leaf: Arc<dyn Node> = Arc::new(Constant::new(2.0));
        let parent = Constant { value: 0.0, inputs: vec![Arc::clone(&leaf)] };

        let def = definition(&parent);
        assert_eq!(def.kind, "constant");
        assert_eq!(def.inputs.len(), 1);
        assert_eq!(def.inputs["input_0"].attrs, json!({ "value": 2.0 }));

        let text = serde_json::to_string(&def).unwrap();
        let round: NodeDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(round, def);
    }

    #[test]
    fn graph_validation_counts_shared_subtrees_once() {
        let shared: Arc<dyn Node> = Arc::new(Constant::new(1.0));
        let a: Arc<dyn Node> =
            Arc::new(Constant { value: 0.0, inputs: vec![Arc::clone(&shared)] });
        let b: Arc<dyn Node> =
            Arc::new(Constant { value: 0.0, inputs: vec![Arc::clone(&shared)] });
        let root: Arc<dyn Node> = Arc::new(Constant { value: 0.0, inputs: vec![a, b] });

        assert_eq!(validate_graph(&root).unwrap(), 4);
    }

    #[test]
    fn cancellation_is_observable() {
        let ctx = EvalContext::with_settings(Settings::default());
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(Error::Cancelled)));
    }
}
