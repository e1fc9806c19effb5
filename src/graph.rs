use crate::constants::{BASE_UNIT, DEFAULT_BASE_CONTEXT, DEFAULT_DOCKERFILE, DEFAULT_LAYERS_DIR};
use crate::definition::{BuildDefinition, TestDefinition};
use crate::error::{DazzleError, Result};
use crate::runner::assert::Assertion;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub description: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub assertions: Vec<Assertion>,
    pub independent: bool,
}

/// The root image every layer is built on
#[derive(Debug, Clone, PartialEq)]
pub struct BaseSpec {
    pub context: PathBuf,
    pub dockerfile: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub context: PathBuf,
    pub dockerfile: String,
    /// Dependency layer names in declaration order
    pub depends: Vec<String>,
    pub tests: Vec<TestSpec>,
}

/// Validated layer DAG. Layers are kept in declaration order and addressed by
/// their index in `layers`.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    pub base: BaseSpec,
    pub layers: Vec<LayerSpec>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

fn layer_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").expect("layer name pattern is valid")
    })
}

fn test_spec(layer: &str, def: &TestDefinition) -> Result<TestSpec> {
    if def.command.is_empty() {
        return Err(DazzleError::configuration(
            layer,
            format!("test '{}' has an empty command", def.desc),
        ));
    }
    let mut assertions = def
        .assert
        .iter()
        .map(|a| {
            a.parse::<Assertion>().map_err(|e| {
                DazzleError::configuration(layer, format!("test '{}': {}", def.desc, e))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if assertions.is_empty() {
        assertions.push(Assertion::StatusEq(0));
    }
    Ok(TestSpec {
        description: def.desc.clone(),
        command: def.command.clone(),
        env: def.env.clone(),
        assertions,
        independent: def.independent,
    })
}

/// Reads and validates the build definition into a layer DAG
pub fn resolve(context_root: &Path, definition_file: &str) -> Result<LayerGraph> {
    let definition = BuildDefinition::load(context_root, definition_file)?;
    LayerGraph::from_definition(context_root, &definition)
}

impl LayerGraph {
    pub fn from_definition(context_root: &Path, definition: &BuildDefinition) -> Result<Self> {
        let base = BaseSpec {
            context: context_root.join(
                definition
                    .base
                    .context
                    .as_deref()
                    .unwrap_or(DEFAULT_BASE_CONTEXT),
            ),
            dockerfile: definition
                .base
                .dockerfile
                .clone()
                .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string()),
        };

        let mut layers = Vec::with_capacity(definition.layers.len());
        let mut index = HashMap::new();
        for def in &definition.layers {
            if !layer_name_pattern().is_match(&def.name) {
                return Err(DazzleError::configuration(
                    &def.name,
                    "layer names must be lowercase alphanumerics separated by '.', '_' or '-'",
                ));
            }
            if def.name == BASE_UNIT {
                return Err(DazzleError::configuration(&def.name, "'base' names the base image"));
            }
            if index.insert(def.name.clone(), layers.len()).is_some() {
                return Err(DazzleError::configuration(&def.name, "duplicate layer name"));
            }
            let context = match &def.context {
                Some(c) => context_root.join(c),
                None => context_root.join(DEFAULT_LAYERS_DIR).join(&def.name),
            };
            layers.push(LayerSpec {
                name: def.name.clone(),
                context,
                dockerfile: def
                    .dockerfile
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string()),
                depends: def.depends.clone(),
                tests: def
                    .tests
                    .iter()
                    .map(|t| test_spec(&def.name, t))
                    .collect::<Result<Vec<_>>>()?,
            });
        }

        let mut deps = vec![Vec::new(); layers.len()];
        let mut dependents = vec![Vec::new(); layers.len()];
        for (i, layer) in layers.iter().enumerate() {
            for dep in &layer.depends {
                // every layer already sits on the base image
                if dep == BASE_UNIT {
                    continue;
                }
                let Some(&d) = index.get(dep) else {
                    return Err(DazzleError::configuration(
                        &layer.name,
                        format!("unknown dependency '{}'", dep),
                    ));
                };
                if d == i {
                    return Err(DazzleError::configuration(&layer.name, "layer depends on itself"));
                }
                if deps[i].contains(&d) {
                    return Err(DazzleError::configuration(
                        &layer.name,
                        format!("dependency '{}' listed twice", dep),
                    ));
                }
                deps[i].push(d);
                dependents[d].push(i);
            }
        }

        let mut dag = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..layers.len()).map(|i| dag.add_node(i)).collect();
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dag.add_edge(nodes[d], nodes[i], ());
            }
        }
        if let Err(cycle) = toposort(&dag, None) {
            let layer = &layers[dag[cycle.node_id()]].name;
            return Err(DazzleError::configuration(layer, "dependency cycle"));
        }

        let order = stable_topological_order(&deps, &dependents);
        Ok(Self {
            base,
            layers,
            index,
            deps,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct dependencies of a layer, in declaration order
    pub fn deps(&self, layer: usize) -> &[usize] {
        &self.deps[layer]
    }

    /// Layers that directly depend on `layer`
    pub fn dependents(&self, layer: usize) -> &[usize] {
        &self.dependents[layer]
    }

    /// Deterministic topological order: dependencies first, ties broken by
    /// declaration order. This is the composition order.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Every layer reachable through dependent edges, in topological order
    pub fn transitive_dependents(&self, layer: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack = self.dependents[layer].clone();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                stack.extend(self.dependents[i].iter().copied());
            }
        }
        self.order.iter().copied().filter(|&i| seen[i]).collect()
    }

    /// Every layer `layer` depends on, directly or not, in topological order
    pub fn transitive_deps(&self, layer: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack = self.deps[layer].clone();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                stack.extend(self.deps[i].iter().copied());
            }
        }
        self.order.iter().copied().filter(|&i| seen[i]).collect()
    }
}

fn stable_topological_order(deps: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> Result<LayerGraph> {
        let def = BuildDefinition::parse(yaml, "dazzle.yaml")?;
        LayerGraph::from_definition(Path::new("/ctx"), &def)
    }

    #[test]
    fn test_defaults_and_order() {
        let g = graph(
            "layers:\n  - name: app\n    depends: [tools]\n  - name: core\n  - name: tools\n    depends: [base, core]\n",
        )
        .unwrap();
        assert_eq!(g.base.context, PathBuf::from("/ctx/base"));
        assert_eq!(g.layers[0].context, PathBuf::from("/ctx/layers/app"));
        assert_eq!(g.layers[0].dockerfile, "Dockerfile");
        let names: Vec<_> = g
            .topological_order()
            .iter()
            .map(|&i| g.layers[i].name.as_str())
            .collect();
        assert_eq!(names, vec!["core", "tools", "app"]);
        assert_eq!(g.deps(2), &[1]);
    }

    #[test]
    fn test_base_is_reserved() {
        let err = graph("layers:\n  - name: base\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let g = graph("layers:\n  - name: b\n  - name: a\n  - name: c\n    depends: [a]\n").unwrap();
        assert_eq!(g.topological_order(), &[0, 1, 2]);
    }

    #[test]
    fn test_unknown_dependency_names_layer_and_dep() {
        let err = graph("layers:\n  - name: app\n    depends: [tols]\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("app") && msg.contains("tols"), "{}", msg);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = graph("layers:\n  - name: a\n  - name: a\n").unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = graph(
            "layers:\n  - name: a\n    depends: [c]\n  - name: b\n    depends: [a]\n  - name: c\n    depends: [b]\n",
        )
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        assert!(graph("layers:\n  - name: a\n    depends: [a]\n").is_err());
    }

    #[test]
    fn test_bad_assertion_is_configuration_error() {
        let err = graph(
            "layers:\n  - name: a\n    tests:\n      - desc: t\n        command: [\"true\"]\n        assert: [\"exit is 0\"]\n",
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_assertions_default_to_success_status() {
        let g = graph("layers:\n  - name: a\n    tests:\n      - desc: t\n        command: [\"true\"]\n").unwrap();
        assert_eq!(g.layers[0].tests[0].assertions, vec![Assertion::StatusEq(0)]);
    }

    #[test]
    fn test_transitive_closures() {
        let g = graph(
            "layers:\n  - name: core\n  - name: tools\n    depends: [core]\n  - name: app\n    depends: [tools]\n  - name: other\n",
        )
        .unwrap();
        assert_eq!(g.transitive_dependents(0), vec![1, 2]);
        assert_eq!(g.transitive_deps(2), vec![0, 1]);
        assert!(g.transitive_deps(3).is_empty());
    }
}
