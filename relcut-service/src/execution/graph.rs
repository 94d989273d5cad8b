// Stage Graph (DAG) Builder
// Orders a pipeline's stages by their dependencies and groups them into parallel levels

use crate::parser::models::{PipelineSpec, Stage};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to unknown stage
    UnknownDependency,
    /// Two stages share a name
    DuplicateStage,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn duplicate_stage(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateStage,
        }
    }
}

/// The DAG of stages executed once per matrix combination
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in declared order
    pub stages: Vec<StageNode>,
    stage_indices: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub stage: Stage,
    /// Names of stages this stage depends on
    pub dependencies: Vec<String>,
    /// Names of stages depending on this one
    pub dependents: Vec<String>,
}

impl StageNode {
    pub fn name(&self) -> &str {
        &self.stage.name
    }
}

impl StageGraph {
    pub fn from_spec(spec: &PipelineSpec) -> Result<Self, GraphError> {
        Self::from_stages(&spec.stages)
    }

    /// Build and validate a graph (duplicates, unknown dependencies, cycles)
    pub fn from_stages(stages: &[Stage]) -> Result<Self, GraphError> {
        let mut stage_indices = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if stage_indices.insert(stage.name.clone(), i).is_some() {
                return Err(GraphError::duplicate_stage(format!(
                    "stage '{}' is declared more than once",
                    stage.name
                )));
            }
        }

        let mut nodes: Vec<StageNode> = stages
            .iter()
            .map(|stage| StageNode {
                stage: stage.clone(),
                dependencies: dedup(&stage.depends_on),
                dependents: Vec::new(),
            })
            .collect();

        for i in 0..nodes.len() {
            let name = nodes[i].stage.name.clone();
            for dep in nodes[i].dependencies.clone() {
                match stage_indices.get(&dep) {
                    Some(&idx) => nodes[idx].dependents.push(name.clone()),
                    None => {
                        return Err(GraphError::unknown_dependency(format!(
                            "stage '{}' depends on unknown stage '{}'",
                            name, dep
                        )))
                    }
                }
            }
        }

        let graph = Self {
            stages: nodes,
            stage_indices,
        };
        graph.detect_cycles()?;

        Ok(graph)
    }

    /// Detect cycles using DFS
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = Vec::new();

        for node in &self.stages {
            if !visited.contains(node.name()) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected in stages: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &StageNode,
        visited: &mut HashSet<String>,
        rec_stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        let name = node.name().to_string();
        visited.insert(name.clone());
        rec_stack.push(name.clone());

        for dep in &node.dependencies {
            if let Some(pos) = rec_stack.iter().position(|s| s == dep) {
                let mut cycle = rec_stack[pos..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(&idx) = self.stage_indices.get(dep) {
                    if let Some(cycle) = self.dfs_cycle(&self.stages[idx], visited, rec_stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        rec_stack.pop();
        None
    }

    /// Stages in topological order; ties keep declared order
    pub fn topological_order(&self) -> Vec<&StageNode> {
        // Kahn's algorithm
        let mut in_degree: Vec<usize> = self.stages.iter().map(|s| s.dependencies.len()).collect();

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut result = Vec::with_capacity(self.stages.len());

        while let Some(idx) = queue.pop_front() {
            let node = &self.stages[idx];
            result.push(node);

            let mut ready = Vec::new();
            for dependent in &node.dependents {
                if let Some(&dep_idx) = self.stage_indices.get(dependent) {
                    in_degree[dep_idx] -= 1;
                    if in_degree[dep_idx] == 0 {
                        ready.push(dep_idx);
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        result
    }

    /// Stages grouped into levels; every stage's dependencies sit in earlier levels
    pub fn parallel_stages(&self) -> Vec<Vec<&StageNode>> {
        let mut levels: Vec<Vec<&StageNode>> = Vec::new();
        let mut assigned: HashMap<&str, usize> = HashMap::new();

        for node in self.topological_order() {
            let level = node
                .dependencies
                .iter()
                .filter_map(|dep| assigned.get(dep.as_str()))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);

            assigned.insert(node.name(), level);

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(node);
        }

        for level in &mut levels {
            level.sort_by_key(|node| self.stage_indices.get(node.name()).copied());
        }

        levels
    }

    pub fn get_stage(&self, name: &str) -> Option<&StageNode> {
        self.stage_indices.get(name).map(|&idx| &self.stages[idx])
    }

    /// Stages that emit the run artifact
    pub fn producers(&self) -> Vec<&StageNode> {
        self.stages
            .iter()
            .filter(|node| node.stage.is_producer())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(nodes: &[&StageNode]) -> Vec<String> {
        nodes.iter().map(|n| n.name().to_string()).collect()
    }

    #[test]
    fn test_topological_order() {
        let stages = vec![
            Stage::run("package", "tar").depends_on(["build", "assets"]),
            Stage::run("build", "make").depends_on(["configure"]),
            Stage::run("configure", "cmake"),
            Stage::run("assets", "fetch"),
        ];
        let graph = StageGraph::from_stages(&stages).unwrap();
        let order = names(&graph.topological_order());

        assert_eq!(order, vec!["configure", "assets", "build", "package"]);
    }

    #[test]
    fn test_parallel_levels() {
        let stages = vec![
            Stage::run("configure", "cmake"),
            Stage::run("assets", "fetch"),
            Stage::run("build", "make").depends_on(["configure"]),
            Stage::run("package", "tar").depends_on(["build", "assets"]),
        ];
        let graph = StageGraph::from_stages(&stages).unwrap();
        let levels: Vec<Vec<String>> = graph
            .parallel_stages()
            .iter()
            .map(|level| names(level))
            .collect();

        assert_eq!(
            levels,
            vec![
                vec!["configure".to_string(), "assets".to_string()],
                vec!["build".to_string()],
                vec!["package".to_string()],
            ]
        );
    }

    #[test]
    fn test_dependents_recorded() {
        let stages = vec![
            Stage::run("a", "true"),
            Stage::run("b", "true").depends_on(["a"]),
            Stage::run("c", "true").depends_on(["a"]),
        ];
        let graph = StageGraph::from_stages(&stages).unwrap();
        assert_eq!(graph.get_stage("a").unwrap().dependents, vec!["b", "c"]);
        assert!(graph.get_stage("c").unwrap().dependents.is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let stages = vec![
            Stage::run("a", "true").depends_on(["c"]),
            Stage::run("b", "true").depends_on(["a"]),
            Stage::run("c", "true").depends_on(["b"]),
        ];
        let err = StageGraph::from_stages(&stages).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert!(err.message.contains("a -> c -> b -> a"), "{}", err.message);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let stages = vec![Stage::run("a", "true").depends_on(["a"])];
        let err = StageGraph::from_stages(&stages).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
    }

    #[test]
    fn test_unknown_dependency() {
        let stages = vec![Stage::run("build", "make").depends_on(["configure"])];
        let err = StageGraph::from_stages(&stages).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert!(err.message.contains("configure"));
    }

    #[test]
    fn test_duplicate_stage() {
        let stages = vec![Stage::run("build", "make"), Stage::run("build", "ninja")];
        let err = StageGraph::from_stages(&stages).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateStage);
    }

    #[test]
    fn test_producers() {
        let stages = vec![
            Stage::run("build", "make"),
            Stage::run("bundle", "zip").depends_on(["build"]).produces("out.zip"),
        ];
        let graph = StageGraph::from_stages(&stages).unwrap();
        assert_eq!(names(&graph.producers()), vec!["bundle"]);
    }
}
