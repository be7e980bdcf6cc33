// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Plan execution
//!
//! [`Executor::execute`] turns a physical plan into a network of running
//! nodes. The plan is visited bottom-up; every plan node becomes one or more
//! replicas, sources run on their own threads and every edge into a
//! transformation becomes a transport whose work runs on the dispatcher.
//! Terminal nodes are bound to named results handed back to the caller.

use crate::exec::config::ExecutorConfig;
use crate::exec::context::{ExecutionContext, ParallelOpts, StreamContext};
use crate::exec::dispatcher::{panic_message, PoolDispatcher};
use crate::exec::error::{ErrorCode, ExecutionError, Result};
use crate::exec::memory::Allocator;
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Metadata, Source, Transformation};
use crate::exec::registry::{default_registry, Registry};
use crate::exec::result::{new_result, QueryResult, ResultAbort};
use crate::exec::run_context::RunContext;
use crate::exec::table::Table;
use crate::exec::transport::{share, ConsecutiveTransport};
use crate::plan::physical::{PhysicalPlan, PlanNode, ResourceManagement};
use crate::plan::procedure::DEFAULT_YIELD_NAME;
use crossbeam_channel::{bounded, select, Receiver};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use petgraph::graph::NodeIndex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Named results of an execution
pub type Results = HashMap<String, QueryResult>;

/// Executes physical plans
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<Registry>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Executor {
    /// Executor using the built-in operators
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_registry(config, default_registry())
    }

    pub fn with_registry(config: ExecutorConfig, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start executing `plan`.
    ///
    /// Returns the named results and a channel yielding the metadata of
    /// sources that report some. The channel never blocks a producer and is
    /// closed once the run finished or aborted. An error is only returned
    /// when the graph cannot be built or validated; failures while running
    /// abort every result instead.
    ///
    /// `alloc` defaults to a fresh allocator limited by the memory quota.
    pub fn execute(
        &self,
        ctx: &RunContext,
        plan: &PhysicalPlan,
        alloc: Option<Allocator>,
    ) -> Result<(Results, Receiver<Metadata>)> {
        let es = self
            .create_execution_state(ctx, plan, alloc)
            .map_err(|e| e.wrap(ErrorCode::Inherit, "failed to initialize execute state"))?;
        Ok(es.run())
    }

    /// Build the execution graph of `plan` without running it and return
    /// the resolved quotas.
    pub fn validate(&self, plan: &PhysicalPlan) -> Result<ResourceManagement> {
        let ctx = RunContext::background();
        let es = self
            .create_execution_state(&ctx, plan, None)
            .map_err(|e| e.wrap(ErrorCode::Inherit, "failed to initialize execute state"))?;
        let resources = es.resources;
        ctx.cancel();
        Ok(resources)
    }

    /// Quotas `plan` would run with
    pub fn resolve_resources(&self, plan: &PhysicalPlan) -> Result<ResourceManagement> {
        let mut resources = plan.resources;
        choose_default_resources(&self.config, plan, &mut resources)?;
        Ok(resources)
    }

    fn create_execution_state(
        &self,
        ctx: &RunContext,
        plan: &PhysicalPlan,
        alloc: Option<Allocator>,
    ) -> Result<ExecutionState> {
        plan.validate()?;

        let mut resources = plan.resources;
        choose_default_resources(&self.config, plan, &mut resources)?;
        let alloc = alloc.unwrap_or_else(|| Allocator::new(Some(resources.memory_bytes_quota)));

        let mut es = ExecutionState {
            ctx: ctx.child(),
            alloc,
            resources,
            results: HashMap::new(),
            aborts: Arc::new(Mutex::new(HashMap::new())),
            sources: Vec::new(),
            transports: Vec::new(),
            dispatcher: Arc::new(PoolDispatcher::new(self.config.dispatcher_throughput)),
        };

        let mut builder = GraphBuilder {
            es: &mut es,
            plan,
            registry: &self.registry,
            nodes: HashMap::new(),
        };
        plan.bottom_up_walk(|idx, node| builder.visit(idx, node))?;

        es.validate()
            .map_err(|e| e.wrap(ErrorCode::Invalid, "execution state"))?;
        Ok(es)
    }
}

/// Fill in quotas the plan left unset.
///
/// The memory quota falls back to the configured default. The concurrency
/// quota falls back to the number of roots, or, with a concurrency limit
/// configured, to the summed parallel factors of all non-source nodes
/// clamped to `1..=limit`.
fn choose_default_resources(
    config: &ExecutorConfig,
    plan: &PhysicalPlan,
    resources: &mut ResourceManagement,
) -> Result<()> {
    let options = &config.options;
    if resources.memory_bytes_quota == 0 {
        resources.memory_bytes_quota = options.default_memory_limit.unwrap_or(0);
    }
    if resources.concurrency_quota == 0 {
        resources.concurrency_quota = plan.roots().len();

        if let Some(limit) = options.concurrency_limit.filter(|l| *l > 0) {
            let mut quota = 0;
            // Sources do not run on the dispatcher.
            plan.top_down_walk(|idx, node| {
                if !plan.predecessors(idx).is_empty() {
                    quota += node.parallel_run.unwrap_or(1);
                }
                Ok(())
            })?;
            resources.concurrency_quota = quota.clamp(1, limit);
        }
    }
    Ok(())
}

#[derive(Clone)]
enum ExecNode {
    Source(usize),
    Dataset(Arc<dyn Dataset>),
}

/// Everything one execution owns
struct ExecutionState {
    ctx: RunContext,
    alloc: Allocator,
    resources: ResourceManagement,
    results: Results,
    aborts: Arc<Mutex<HashMap<String, ResultAbort>>>,
    sources: Vec<Box<dyn Source>>,
    transports: Vec<ConsecutiveTransport>,
    dispatcher: Arc<PoolDispatcher>,
}

impl ExecutionState {
    fn validate(&self) -> Result<()> {
        if self.resources.concurrency_quota == 0 {
            return Err(ExecutionError::ZeroConcurrencyQuota);
        }
        Ok(())
    }

    fn add_transformation(&mut self, node: &ExecNode, t: Box<dyn Transformation>) {
        match node {
            ExecNode::Source(i) => self.sources[*i].add_transformation(t),
            ExecNode::Dataset(ds) => ds.add_transformation(t),
        }
    }

    fn run(self) -> (Results, Receiver<Metadata>) {
        let ExecutionState {
            ctx,
            alloc,
            resources,
            results,
            aborts,
            sources,
            transports,
            dispatcher,
        } = self;

        info!(
            "starting execution: {} sources, {} transports, {} results, concurrency quota {}, {}",
            sources.len(),
            transports.len(),
            results.len(),
            resources.concurrency_quota,
            alloc.stats().format_human_readable()
        );

        // Room for every source, so an unread channel never blocks one.
        let (meta_tx, meta_rx) = bounded(sources.len());
        let aborter = Aborter {
            ctx: ctx.clone(),
            results: aborts,
        };

        let mut handles = Vec::with_capacity(sources.len() + 1);
        for mut src in sources {
            let ctx = ctx.clone();
            let meta_tx = meta_tx.clone();
            let src_aborter = aborter.clone();
            let label = src.label().to_string();
            let spawned = thread::Builder::new()
                .name(format!("streamexec-source-{}", label))
                .spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        src.run(&ctx);
                        src.metadata()
                    }));
                    match outcome {
                        Ok(Some(meta)) => {
                            if meta_tx.try_send(meta).is_err() {
                                debug!("metadata of source {} dropped", label);
                            }
                        }
                        Ok(None) => {}
                        Err(panic) => {
                            let msg = panic_message(panic.as_ref());
                            error!("panic in source {}: {}", label, msg);
                            src_aborter.abort(ExecutionError::Panic(format!("{}: {}", label, msg)));
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => aborter.abort(ExecutionError::Internal(format!(
                    "failed to spawn source thread: {}",
                    e
                ))),
            }
        }

        dispatcher.start(resources.concurrency_quota, &ctx);

        let watcher = {
            let aborter = aborter.clone();
            thread::Builder::new()
                .name("streamexec-watcher".to_string())
                .spawn(move || watch(&ctx, &transports, &dispatcher, &aborter))
        };
        match watcher {
            Ok(handle) => handles.push(handle),
            Err(e) => aborter.abort(ExecutionError::Internal(format!(
                "failed to spawn watcher thread: {}",
                e
            ))),
        }

        let closer = thread::Builder::new()
            .name("streamexec-closer".to_string())
            .spawn(move || {
                for handle in handles {
                    if handle.join().is_err() {
                        error!("execution thread panicked");
                    }
                }
                drop(meta_tx);
                debug!("execution finished, metadata channel closed");
            });
        if let Err(e) = closer {
            // The sender went down with the closure, so the channel is closed.
            error!("failed to spawn closer thread: {}", e);
        }

        (results, meta_rx)
    }
}

/// Wait for every transport to finish, then stop the dispatcher
fn watch(
    ctx: &RunContext,
    transports: &[ConsecutiveTransport],
    dispatcher: &PoolDispatcher,
    aborter: &Aborter,
) {
    for t in transports {
        select! {
            recv(t.finished()) -> _ => {}
            recv(ctx.done()) -> _ => aborter.abort(ctx.err().unwrap_or(ExecutionError::Canceled)),
            recv(dispatcher.err()) -> err => {
                if let Ok(err) = err {
                    aborter.abort(err);
                }
            }
        }
    }
    if let Some(err) = dispatcher.stop() {
        aborter.abort(err);
    }
    info!("execution done");
}

/// Fails every result and cancels the run
#[derive(Clone)]
struct Aborter {
    ctx: RunContext,
    results: Arc<Mutex<HashMap<String, ResultAbort>>>,
}

impl Aborter {
    fn abort(&self, err: ExecutionError) {
        if !self.ctx.is_done() {
            warn!("aborting execution: {}", err);
        }
        for result in self.results.lock().values() {
            result.abort(err.clone());
        }
        self.ctx.cancel_with(err);
    }
}

/// Instantiates execution nodes for plan nodes
struct GraphBuilder<'a> {
    es: &'a mut ExecutionState,
    plan: &'a PhysicalPlan,
    registry: &'a Registry,
    nodes: HashMap<NodeIndex, Vec<ExecNode>>,
}

impl GraphBuilder<'_> {
    fn visit(&mut self, idx: NodeIndex, node: &PlanNode) -> Result<()> {
        // Yields become results, other terminal nodes are handled below.
        if let Some(name) = node.spec.yield_name() {
            return self.generate_result(name, idx);
        }

        let plan = self.plan;
        let registry = self.registry;
        let stream = StreamContext::new(node.bounds.map(|b| b.resolve(plan.now)));
        let copies = node.parallel_run.unwrap_or(1);
        let is_parallel_merge = node.parallel_merge.is_some();
        let pred_copies = node.parallel_merge.unwrap_or(1);
        let preds = plan.non_yield_predecessors(idx)?;
        for pred in &preds {
            self.check_wiring(*pred, node, copies, is_parallel_merge, pred_copies)?;
        }

        let contexts: Vec<ExecutionContext> = (0..copies)
            .map(|i| {
                let mut parents = Vec::with_capacity(preds.len() * pred_copies);
                for pred in &preds {
                    for j in 0..pred_copies {
                        let replica = self.upstream_replica(*pred, pred_copies, i + j);
                        parents.push(DatasetId::from_node_id(&plan.node(*pred).id, replica));
                    }
                }
                ExecutionContext::new(
                    self.es.ctx.clone(),
                    parents,
                    stream,
                    ParallelOpts {
                        group: i,
                        factor: copies,
                    },
                    self.es.alloc.clone(),
                    plan.now,
                )
            })
            .collect();

        let kind = node.kind();
        let mut replicas = Vec::with_capacity(copies);
        if preds.is_empty() {
            let create = registry
                .source(kind)
                .ok_or_else(|| ExecutionError::UnsupportedSource(kind.to_string()))?;
            for (i, ec) in contexts.iter().enumerate() {
                let id = DatasetId::from_node_id(&node.id, i);
                let mut source = create(&node.spec, id, ec)?;
                source.set_label(node.id.clone());
                debug!("created source {} replica {}/{}", node.id, i, copies);
                self.es.sources.push(source);
                replicas.push(ExecNode::Source(self.es.sources.len() - 1));
            }
        } else {
            let create = registry
                .transformation(kind)
                .ok_or_else(|| ExecutionError::UnsupportedProcedure(kind.to_string()))?;
            let trigger = node.trigger.clone().unwrap_or_default();
            for (i, ec) in contexts.iter().enumerate() {
                let id = DatasetId::from_node_id(&node.id, i);
                let (t, ds) = create(id, AccumulationMode::Discarding, &node.spec, ec)?;
                if let Some(aware) = ds.as_context_aware() {
                    aware.with_context(self.es.ctx.clone());
                }
                ds.set_trigger_spec(trigger.clone());

                let shared = share(t);
                // i iterates for parallel replicas, j for merged predecessor
                // replicas; at most one of them is ever above zero.
                for pred in &preds {
                    for j in 0..pred_copies {
                        let replica = self.upstream_replica(*pred, pred_copies, i + j);
                        let upstream = self
                            .nodes
                            .get(pred)
                            .and_then(|r| r.get(replica))
                            .cloned()
                            .ok_or_else(|| {
                                ExecutionError::InvalidPlan(format!(
                                    "node {:?} has no replica {} to feed {:?}",
                                    plan.node(*pred).id,
                                    replica,
                                    node.id
                                ))
                            })?;
                        let transport = ConsecutiveTransport::new(
                            node.id.clone(),
                            shared.clone(),
                            self.es.dispatcher.scheduler(),
                            self.es.dispatcher.throughput(),
                        );
                        self.es.transports.push(transport.clone());
                        self.es.add_transformation(&upstream, Box::new(transport));
                    }
                }
                debug!(
                    "created transformation {} replica {}/{} with {} parents",
                    node.id,
                    i,
                    copies,
                    ec.parents().len()
                );
                replicas.push(ExecNode::Dataset(ds));
            }
        }
        self.nodes.insert(idx, replicas);

        // Terminal nodes need a result, otherwise nothing demands their output.
        if plan.successors(idx).is_empty() {
            let name = self.result_name(idx, node, is_parallel_merge)?;
            self.generate_result(&name, idx)?;
        }
        Ok(())
    }

    /// Every replica of `pred` must have exactly one consumer replica.
    fn check_wiring(
        &self,
        pred: NodeIndex,
        node: &PlanNode,
        copies: usize,
        is_parallel_merge: bool,
        pred_copies: usize,
    ) -> Result<()> {
        let available = self.nodes.get(&pred).map(Vec::len).unwrap_or(0);
        let valid = if is_parallel_merge {
            copies == 1 && available == pred_copies
        } else if copies > 1 {
            available == 1 || available == copies
        } else {
            available == 1
        };
        if valid {
            return Ok(());
        }
        let shape = if is_parallel_merge {
            format!("merges {} replicas", pred_copies)
        } else {
            format!("runs {} replicas", copies)
        };
        Err(ExecutionError::InvalidPlan(format!(
            "node {:?} {} but predecessor {:?} runs {} replicas",
            node.id,
            shape,
            self.plan.node(pred).id,
            available
        )))
    }

    /// Replica of `pred` feeding replica `wanted`. A predecessor running a
    /// single replica feeds every replica of a parallel node.
    fn upstream_replica(&self, pred: NodeIndex, pred_copies: usize, wanted: usize) -> usize {
        let available = self.nodes.get(&pred).map(Vec::len).unwrap_or(0);
        if pred_copies == 1 && available == 1 {
            0
        } else {
            wanted
        }
    }

    /// Result name for a terminal node.
    ///
    /// Nodes with side effects name their result after themselves. Parallel
    /// merge nodes are inserted by the planner and stand in for their single
    /// predecessor.
    fn result_name(&self, idx: NodeIndex, node: &PlanNode, is_parallel_merge: bool) -> Result<String> {
        let named = if is_parallel_merge {
            let preds = self.plan.predecessors(idx);
            if preds.len() != 1 {
                return Err(ExecutionError::operator(
                    ErrorCode::Internal,
                    "parallel merge must have a single predecessor",
                ));
            }
            self.plan.node(preds[0])
        } else {
            node
        };
        if named.spec.has_side_effect() {
            Ok(named.id.clone())
        } else {
            Ok(DEFAULT_YIELD_NAME.to_string())
        }
    }

    fn generate_result(&mut self, name: &str, idx: NodeIndex) -> Result<()> {
        if self.es.results.contains_key(name) {
            return Err(ExecutionError::DuplicateResult(name.to_string()));
        }
        let target = self.plan.skip_yields(idx)?;
        let upstream = self
            .nodes
            .get(&target)
            .and_then(|r| r.first())
            .cloned()
            .ok_or_else(|| {
                ExecutionError::Internal(format!(
                    "no execution node for {:?}",
                    self.plan.node(target).id
                ))
            })?;
        let (sink, result) = new_result(name);
        self.es
            .aborts
            .lock()
            .insert(name.to_string(), sink.abort_handle());
        self.es.results.insert(name.to_string(), result);
        self.es.add_transformation(&upstream, Box::new(sink));
        debug!("result {:?} bound to {}", name, self.plan.node(target).id);
        Ok(())
    }
}

/// Read every result to completion.
///
/// Results hand tables over one at a time, so each one is drained on its own
/// thread; reading them one after another could stall a run whose nodes
/// feed several results.
pub fn read_results(results: Results) -> BTreeMap<String, Result<Vec<Table>>> {
    let readers: Vec<_> = results
        .into_iter()
        .map(|(name, mut result)| {
            let reader = thread::Builder::new()
                .name(format!("streamexec-result-{}", name))
                .spawn(move || result.collect_tables());
            (name, reader)
        })
        .collect();

    readers
        .into_iter()
        .map(|(name, reader)| {
            let tables = match reader {
                Ok(handle) => handle.join().unwrap_or_else(|panic| {
                    Err(ExecutionError::Panic(panic_message(panic.as_ref())))
                }),
                Err(e) => Err(ExecutionError::Internal(format!(
                    "failed to spawn result reader: {}",
                    e
                ))),
            };
            (name, tables)
        })
        .collect()
}
