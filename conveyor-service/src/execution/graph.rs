// Execution Graph (DAG) Resolver
// Validates `requires` edges and orders jobs for execution

use crate::artifacts;
use crate::error::DefinitionError;
use crate::workflow::models::{Job, Workflow};

use std::collections::{BTreeSet, HashMap};

/// Resolved dependency graph of a workflow
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    /// Workflow name used in events and reports
    pub name: String,
    /// Workflow-level environment
    pub env: HashMap<String, String>,
    /// Concurrency limit declared by the document, if any
    pub max_parallel: Option<usize>,
    /// Jobs in declaration order
    nodes: Vec<JobNode>,
    indices: HashMap<String, usize>,
    /// Node indices in topological order
    order: Vec<usize>,
}

/// A job in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub job: Job,
    /// Declaration index
    pub index: usize,
    /// Direct dependencies (declaration indices)
    pub dependencies: Vec<usize>,
    /// Jobs that directly require this one
    pub dependents: Vec<usize>,
    /// Transitive dependencies
    ancestors: BTreeSet<usize>,
}

impl JobNode {
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

impl ExecutionGraph {
    /// Resolve a workflow into an execution graph.
    ///
    /// Fails on duplicate ids, unknown dependencies, cycles and artifact
    /// references to jobs outside the dependency chain. Pure function of the
    /// workflow definition.
    pub fn resolve(workflow: &Workflow) -> Result<Self, DefinitionError> {
        let mut indices = HashMap::with_capacity(workflow.jobs.len());
        for (i, job) in workflow.jobs.iter().enumerate() {
            if indices.insert(job.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateJob {
                    job: job.id.clone(),
                });
            }
        }

        let mut nodes = Vec::with_capacity(workflow.jobs.len());
        for (i, job) in workflow.jobs.iter().enumerate() {
            let mut dependencies = Vec::new();
            for dep in job.requires() {
                let idx = *indices
                    .get(&dep)
                    .ok_or_else(|| DefinitionError::UnknownDependency {
                        job: job.id.clone(),
                        missing: dep.clone(),
                    })?;
                if !dependencies.contains(&idx) {
                    dependencies.push(idx);
                }
            }

            nodes.push(JobNode {
                job: job.clone(),
                index: i,
                dependencies,
                dependents: Vec::new(),
                ancestors: BTreeSet::new(),
            });
        }

        for i in 0..nodes.len() {
            for dep in nodes[i].dependencies.clone() {
                nodes[dep].dependents.push(i);
            }
        }

        if let Some(cycle) = find_cycle(&nodes) {
            return Err(DefinitionError::CycleDetected {
                jobs: cycle.into_iter().map(|i| nodes[i].job.id.clone()).collect(),
            });
        }

        let order = topological_sort(&nodes);

        // Dependencies precede dependents in `order`, so one pass is enough
        for &i in &order {
            let mut ancestors = BTreeSet::new();
            for &dep in &nodes[i].dependencies {
                ancestors.insert(dep);
                ancestors.extend(nodes[dep].ancestors.iter().copied());
            }
            nodes[i].ancestors = ancestors;
        }

        let graph = Self {
            name: workflow.display_name().to_string(),
            env: workflow.env.clone(),
            max_parallel: workflow.max_parallel,
            nodes,
            indices,
            order,
        };

        graph.check_artifact_references()?;
        Ok(graph)
    }

    /// Every interpolated artifact must come from an ancestor of the reader
    fn check_artifact_references(&self) -> Result<(), DefinitionError> {
        for node in &self.nodes {
            for command in &node.job.commands {
                let refs =
                    artifacts::references(&command.run).map_err(|message| {
                        DefinitionError::InvalidJob {
                            job: node.job.id.clone(),
                            message,
                        }
                    })?;

                for reference in refs {
                    if !self.is_ancestor(&reference.producer, &node.job.id) {
                        return Err(DefinitionError::InvalidArtifactReference {
                            job: node.job.id.clone(),
                            producer: reference.producer,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Jobs in declaration order
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &JobNode {
        &self.nodes[index]
    }

    pub fn job(&self, id: &str) -> Option<&JobNode> {
        self.indices.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.indices.get(id).copied()
    }

    /// Jobs in topological order; ties go to the job declared first
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&idx| &self.nodes[idx]).collect()
    }

    /// Whether `ancestor` is a direct or transitive dependency of `job`
    pub fn is_ancestor(&self, ancestor: &str, job: &str) -> bool {
        match (self.indices.get(ancestor), self.indices.get(job)) {
            (Some(a), Some(j)) => self.nodes[*j].ancestors.contains(a),
            _ => false,
        }
    }

    /// Transitive dependencies of `job` in declaration order
    pub fn ancestors(&self, job: &str) -> Vec<&JobNode> {
        self.job(job)
            .map(|node| node.ancestors.iter().map(|&i| &self.nodes[i]).collect())
            .unwrap_or_default()
    }

    /// Group jobs into levels that could run in parallel
    pub fn parallel_levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        let mut assigned = vec![0usize; self.nodes.len()];

        for node in self.topological_order() {
            let level = node
                .dependencies
                .iter()
                .map(|&dep| assigned[dep] + 1)
                .max()
                .unwrap_or(0);
            assigned[node.index] = level;

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(node);
        }

        levels
    }
}

/// Kahn's algorithm with the ready set ordered by declaration index
fn topological_sort(nodes: &[JobNode]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &dependent in &nodes[idx].dependents {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    order
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// DFS over `requires` edges. The returned cycle follows the edges and starts
/// at its earliest-declared job.
fn find_cycle(nodes: &[JobNode]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack = Vec::new();

    for start in 0..nodes.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(mut cycle) = dfs_cycle(nodes, start, &mut marks, &mut stack) {
                if let Some(pos) = cycle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, idx)| **idx)
                    .map(|(pos, _)| pos)
                {
                    cycle.rotate_left(pos);
                }
                return Some(cycle);
            }
        }
    }

    None
}

fn dfs_cycle(
    nodes: &[JobNode],
    idx: usize,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[idx] = Mark::InProgress;
    stack.push(idx);

    for &dep in &nodes[idx].dependencies {
        match marks[dep] {
            Mark::Unvisited => {
                if let Some(cycle) = dfs_cycle(nodes, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::InProgress => {
                let pos = stack.iter().position(|&i| i == dep).unwrap_or(0);
                return Some(stack[pos..].to_vec());
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[idx] = Mark::Done;
    None
}
