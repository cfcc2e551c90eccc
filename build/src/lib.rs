//! Graph construction and parallel execution for mmk.
//!
//! `graph::generate` resolves a requested `(target, rule_type)` into a DAG;
//! `execute` runs it leaves-first on a bounded worker pool, with staleness
//! decided by the `MTimeRebuilder` and recipes dispatched through a
//! `RecipeRunner`.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{error, info, warn};
use petgraph::graph::NodeIndex;
use thiserror::Error;

pub mod deps;
pub mod disk_interface;
pub mod graph;
mod pool;
pub mod rebuilder;
pub mod shell;


use disk_interface::DiskInterface;
use graph::{Graph, Node};
use pool::{Job, JobPool, Scope};

pub use disk_interface::SystemDiskInterface;
pub use graph::{generate, GraphError};
pub use rebuilder::MTimeRebuilder;
pub use shell::{BashRunner, RecipeError, RecipeRunner};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to execute target: {target}: {source}")]
    Recipe { target: String, source: RecipeError },
    #[error("Cannot build {target}. Dependency failed: {cause}")]
    DependencyFailed { target: String, cause: String },
}

pub fn default_rebuilder() -> MTimeRebuilder<SystemDiskInterface> {
    MTimeRebuilder::new(SystemDiskInterface)
}

struct RecipeJob<'a> {
    idx: NodeIndex,
    node: &'a Node,
    runner: &'a dyn RecipeRunner,
}

impl<'a> Job for RecipeJob<'a> {
    type Output = (NodeIndex, Result<(), BuildError>);

    fn run(self) -> Self::Output {
        let body = self.node.body();
        info!("Building {}", self.node.key());
        let result = match self.runner.run(self.node, &body.lines) {
            Ok(()) => Ok(()),
            Err(err) if body.fail_ok => {
                warn!("{}: recipe failed ({}); marked failok, continuing", self.node.key(), err);
                Ok(())
            }
            Err(err) => Err(BuildError::Recipe {
                target: self.node.target.clone(),
                source: err,
            }),
        };
        (self.idx, result)
    }
}

/// A node is finished exactly once; its result releases any dependent whose
/// dependencies have now all finished. A failure is stored as the message
/// dependents will cite.
fn finish_node(
    graph: &Graph,
    idx: NodeIndex,
    result: Result<(), String>,
    finished: &mut HashMap<NodeIndex, Result<(), String>>,
    ready: &mut VecDeque<NodeIndex>,
    waiting: &mut HashSet<NodeIndex>,
) {
    finished.insert(idx, result);
    for dependent in graph.dependents(idx) {
        if !waiting.contains(&dependent) {
            continue;
        }
        if graph
            .dependencies(dependent)
            .all(|dep| finished.contains_key(&dep))
        {
            waiting.remove(&dependent);
            ready.push_back(dependent);
        }
    }
}

/// Runs the graph under `njobs` workers. Execution starts at the leaves;
/// every recipe starts strictly after all of its dependencies finished and
/// runs at most once. A failure never cancels unrelated work; dependents of
/// a failed node short-circuit, and the last error observed is returned.
pub fn execute<Disk>(
    graph: &Graph,
    njobs: usize,
    rebuilder: &MTimeRebuilder<Disk>,
    runner: &dyn RecipeRunner,
) -> Result<(), BuildError>
where
    Disk: DiskInterface,
{
    let total = graph.node_count();
    if total == 0 {
        return Ok(());
    }

    let mut ready: VecDeque<NodeIndex> = graph.roots().into();
    let mut waiting: HashSet<NodeIndex> = graph
        .indices()
        .filter(|idx| !ready.contains(idx))
        .collect();
    let mut finished: HashMap<NodeIndex, Result<(), String>> = HashMap::new();
    let mut errors: Vec<BuildError> = Vec::new();
    let mut inflight = 0usize;

    let pool: JobPool<RecipeJob> = JobPool::with_capacity(njobs);
    let pool_result = pool.run(|scope: Scope<RecipeJob>| {
        while finished.len() < total {
            if scope.has_capacity() || inflight == 0 {
                if let Some(idx) = ready.pop_front() {
                    let node = graph.node(idx);

                    // A failed dependency fails this node without running
                    // its recipe; the original cause propagates onward.
                    let failed_dep = graph.dependencies(idx).find_map(|dep| {
                        finished
                            .get(&dep)
                            .and_then(|r| r.as_ref().err())
                            .cloned()
                    });
                    if let Some(cause) = failed_dep {
                        let err = BuildError::DependencyFailed {
                            target: node.target.clone(),
                            cause: cause.clone(),
                        };
                        error!("{}", err);
                        errors.push(err);
                        finish_node(
                            graph,
                            idx,
                            Err(cause),
                            &mut finished,
                            &mut ready,
                            &mut waiting,
                        );
                        continue;
                    }

                    // The staleness check happens here, after every
                    // dependency has completed, so upstream build dates are
                    // final.
                    if rebuilder.needs_build(graph, idx, runner) {
                        inflight += 1;
                        scope.enqueue(RecipeJob { idx, node, runner });
                    } else {
                        info!("{} already built.", node.key());
                        finish_node(
                            graph,
                            idx,
                            Ok(()),
                            &mut finished,
                            &mut ready,
                            &mut waiting,
                        );
                    }
                    continue;
                }
            }

            // Nothing dispatchable: wait for a worker to finish something.
            // The graph is acyclic, so if nothing is in flight there must
            // have been something ready above.
            debug_assert!(inflight > 0);
            let (idx, result) = scope.rx.recv().expect("workers outlive the queue");
            inflight -= 1;
            let stored = match result {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!("{}", err);
                    let cause = err.to_string();
                    errors.push(err);
                    Err(cause)
                }
            };
            finish_node(graph, idx, stored, &mut finished, &mut ready, &mut waiting);
        }
    });
    if let Err(panic) = pool_result {
        // A recipe worker panicked; the pool has already shut down, so
        // resume the panic on the scheduling thread with its payload.
        std::panic::resume_unwind(panic);
    }

    match errors.pop() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
