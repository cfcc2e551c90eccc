//! Resolves a requested `(target, rule_type)` against the rule set into a
//! DAG of nodes, expanding and re-parsing dependency strings along the way.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use petgraph::{graph::NodeIndex, Direction};
use thiserror::Error;

use mmk_parse::{expand_vars, Matcher, RuleBody, RuleSet, RuleSets, Var};

use crate::deps::parse_deps;

/// `target` or `target:rule_type`, the way nodes are named in diagnostics.
pub fn display_key(target: &str, rule_type: &str) -> String {
    if rule_type.is_empty() {
        target.to_owned()
    } else {
        format!("{}:{}", target, rule_type)
    }
}

/// One concrete `(target, rule_type)` pair. Everything needed at execution
/// time is resolved here, so the finished graph is immutable and shareable
/// across workers.
#[derive(Debug)]
pub struct Node {
    pub target: String,
    pub rule_type: String,
    pub rule: Arc<RuleSet>,
    body: usize,
    /// Submatches of the target against the rule's matcher; index 0 is the
    /// whole match. Empty for literal rules.
    pub captures: Vec<String>,
    /// Snapshot of the global variables at graph-build time.
    pub vars: Arc<Vec<Var>>,
}

impl Node {
    pub fn body(&self) -> &RuleBody {
        &self.rule.bodies[self.body]
    }

    pub fn key(&self) -> String {
        display_key(&self.target, &self.rule_type)
    }
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Found dependency cycle: {0}")]
    Cycle(String),
    #[error("No such target {target} for dependency chain {chain}")]
    NoRule { target: String, chain: String },
}

/// The node arena. Edges point from a node to the dependencies it waits on
/// (`Direction::Outgoing`); dependents are the incoming neighbors.
#[derive(Debug)]
pub struct Graph {
    graph: petgraph::Graph<Node, ()>,
    keys: HashMap<(String, String), NodeIndex>,
}

impl Graph {
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn lookup(&self, target: &str, rule_type: &str) -> Option<NodeIndex> {
        self.keys
            .get(&(target.to_owned(), rule_type.to_owned()))
            .copied()
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    pub fn dependencies(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Outgoing)
    }

    pub fn dependents(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    /// The nodes with no outgoing edges: the true dependency leaves, where
    /// execution starts.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .externals(Direction::Outgoing)
            .collect()
    }

    pub fn has_dependency(&self, idx: NodeIndex, dep: NodeIndex) -> bool {
        self.graph.find_edge(idx, dep).is_some()
    }
}

/// A rule synthesized for a file that exists on disk but has no declared
/// rule, so it can participate as a dependency leaf.
fn file_rule(target: &str) -> RuleSet {
    RuleSet {
        target: Matcher::Literal(target.to_owned()),
        bodies: vec![RuleBody {
            dependencies: Some(Vec::new()),
            ..Default::default()
        }],
    }
}

struct Builder<'a> {
    rules: &'a RuleSets,
    graph: petgraph::Graph<Node, ()>,
    keys: HashMap<(String, String), NodeIndex>,
    vars: Arc<Vec<Var>>,
}

impl<'a> Builder<'a> {
    fn chain_string(chain: &[(String, String)], target: &str, rule_type: &str) -> String {
        let mut names: Vec<String> = chain
            .iter()
            .map(|(t, rt)| display_key(t, rt))
            .collect();
        names.push(display_key(target, rule_type));
        names.join(" -> ")
    }

    fn build(
        &mut self,
        target: &str,
        rule_type: &str,
        chain: &mut Vec<(String, String)>,
    ) -> Result<NodeIndex, GraphError> {
        if chain.iter().any(|(t, rt)| t == target && rt == rule_type) {
            return Err(GraphError::Cycle(Builder::chain_string(
                chain, target, rule_type,
            )));
        }
        // Nodes in the map are fully wired; anything in progress is on the
        // chain and was rejected above.
        if let Some(&idx) = self.keys.get(&(target.to_owned(), rule_type.to_owned())) {
            return Ok(idx);
        }

        let rule = match self.rules.rule_for(target, rule_type) {
            Some(rule) => Arc::new(rule.clone()),
            None => {
                if rule_type.is_empty() && Path::new(target).exists() {
                    Arc::new(file_rule(target))
                } else {
                    return Err(GraphError::NoRule {
                        target: display_key(target, rule_type),
                        chain: Builder::chain_string(chain, target, rule_type),
                    });
                }
            }
        };
        let body = if rule_type.is_empty() {
            0
        } else {
            rule.bodies
                .iter()
                .position(|b| b.rule_type == rule_type)
                .expect("rule_for only returns rules with a matching body")
        };
        let captures = rule.target.captures(target);

        let mut vars = self.rules.var_map();
        for (i, cap) in captures.iter().enumerate() {
            vars.insert(format!("match_{}", i), cap.clone());
        }
        vars.insert("target".to_owned(), target.to_owned());
        let dep_string = rule.bodies[body]
            .dependencies
            .as_ref()
            .map(|d| d.join(" "))
            .unwrap_or_default();
        let deps = parse_deps(&expand_vars(&dep_string, &vars));
        let fail_ok = rule.bodies[body].fail_ok;

        let idx = self.graph.add_node(Node {
            target: target.to_owned(),
            rule_type: rule_type.to_owned(),
            rule,
            body,
            captures,
            vars: self.vars.clone(),
        });
        self.keys
            .insert((target.to_owned(), rule_type.to_owned()), idx);

        chain.push((target.to_owned(), rule_type.to_owned()));
        for dep in deps {
            // The parent's rule-type is inherited unless the dependency
            // named its own.
            let dep_rt = dep.rule_type.as_deref().unwrap_or(rule_type);
            match self.build(&dep.target, dep_rt, chain) {
                Ok(child) => {
                    self.graph.update_edge(idx, child, ());
                }
                Err(err) => {
                    if fail_ok {
                        warn!(
                            "Cannot build dependency {}: {}",
                            display_key(&dep.target, dep_rt),
                            err
                        );
                        warn!(
                            "{} is failok. Skipping {}",
                            display_key(target, rule_type),
                            display_key(&dep.target, dep_rt)
                        );
                        continue;
                    }
                    chain.pop();
                    return Err(err);
                }
            }
        }
        chain.pop();
        Ok(idx)
    }
}

/// Builds the dependency graph rooted at `(target, rule_type)`.
pub fn generate(
    rules: &RuleSets,
    target: &str,
    rule_type: &str,
) -> Result<Graph, GraphError> {
    let mut builder = Builder {
        rules,
        graph: petgraph::Graph::new(),
        keys: HashMap::new(),
        vars: Arc::new(rules.vars.clone()),
    };
    let mut chain = Vec::new();
    builder.build(target, rule_type, &mut chain)?;
    Ok(Graph {
        graph: builder.graph,
        keys: builder.keys,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    struct StrLoader(String);

    impl mmk_parse::Loader for StrLoader {
        fn load(&mut self, _from: Option<&str>, _request: &str) -> io::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn rule_sets(input: &str) -> RuleSets {
        mmk_parse::parse(&mut StrLoader(input.to_owned()), "mmkfile").expect("valid build file")
    }

    #[test]
    fn test_simple_chain() {
        let rules = rule_sets("a : b\n\tbuild a\nb :\n\tbuild b\n");
        let graph = generate(&rules, "a", "").unwrap();
        assert_eq!(graph.node_count(), 2);
        let a = graph.lookup("a", "").unwrap();
        let b = graph.lookup("b", "").unwrap();
        assert!(graph.has_dependency(a, b));
        assert_eq!(graph.roots(), vec![b]);
    }

    #[test]
    fn test_diamond_is_deduplicated() {
        let rules = rule_sets(
            "a : b c\n\t:\nb : d\n\t:\nc : d\n\t:\nd :\n\t:\n",
        );
        let graph = generate(&rules, "a", "").unwrap();
        // One node per (target, rule_type), even though d is reached twice.
        assert_eq!(graph.node_count(), 4);
        let d = graph.lookup("d", "").unwrap();
        assert_eq!(graph.roots(), vec![d]);
        assert_eq!(graph.dependents(d).count(), 2);
    }

    #[test]
    fn test_edges_are_symmetric() {
        let rules = rule_sets("a : b c\n\t:\nb :\n\t:\nc :\n\t:\n");
        let graph = generate(&rules, "a", "").unwrap();
        for idx in graph.indices() {
            for dep in graph.dependencies(idx) {
                assert!(
                    graph.dependents(dep).any(|r| r == idx),
                    "missing reverse edge {} -> {}",
                    graph.node(idx).key(),
                    graph.node(dep).key()
                );
            }
        }
    }

    #[test]
    fn test_cycle_detection() {
        let rules = rule_sets("a : b\n\t:\nb : a\n\t:\n");
        let err = generate(&rules, "a", "").unwrap_err();
        match err {
            GraphError::Cycle(chain) => assert_eq!(chain, "a -> b -> a"),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_self_cycle() {
        let rules = rule_sets("a : a\n\t:\n");
        let err = generate(&rules, "a", "").unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_unknown_target_names_chain() {
        let rules = rule_sets("a : b\n\t:\nb : ghost\n\t:\n");
        let err = generate(&rules, "a", "").unwrap_err();
        match err {
            GraphError::NoRule { target, chain } => {
                assert_eq!(target, "ghost");
                assert_eq!(chain, "a -> b -> ghost");
            }
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_file_dependency_becomes_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.txt");
        std::fs::write(&src, "data").unwrap();
        let src = src.to_str().unwrap();

        let rules = rule_sets(&format!("out : \"{}\"\n\tcp {} out\n", src, src));
        let graph = generate(&rules, "out", "").unwrap();
        let leaf = graph.lookup(src, "").unwrap();
        assert!(graph.node(leaf).body().lines.is_empty());
        assert_eq!(graph.roots(), vec![leaf]);
    }

    #[test]
    fn test_missing_file_dependency_fails() {
        let rules = rule_sets("out : /nonexistent/input.txt\n\tcp in out\n");
        assert!(matches!(
            generate(&rules, "out", "").unwrap_err(),
            GraphError::NoRule { .. }
        ));
    }

    #[test]
    fn test_rule_type_override_in_dependency() {
        let rules = rule_sets(
            "widget : \"parts\":fresh\n\tassemble\nparts :\n\ttouch parts\n  : fresh\n\trefresh-parts\n",
        );
        let graph = generate(&rules, "widget", "").unwrap();
        assert_eq!(graph.node_count(), 2);
        let fresh = graph.lookup("parts", "fresh").unwrap();
        assert_eq!(
            graph.node(fresh).body().lines,
            vec!["refresh-parts".to_owned()]
        );
        assert!(graph.lookup("parts", "").is_none());
    }

    #[test]
    fn test_rule_type_is_inherited_by_dependencies() {
        let rules = rule_sets(
            "app : lib\n\tlink app\n  : debug : lib\n\tlink -g app\nlib :\n\tbuild lib\n  : debug\n\tbuild -g lib\n",
        );
        let graph = generate(&rules, "app", "debug").unwrap();
        let lib = graph.lookup("lib", "debug").expect("debug body chosen");
        assert_eq!(graph.node(lib).body().lines, vec!["build -g lib".to_owned()]);
    }

    #[test]
    fn test_trailing_colon_resets_rule_type() {
        let rules = rule_sets(
            "app : lib:\n\tlink app\n  : debug : lib:\n\tlink -g app\nlib :\n\tbuild lib\n",
        );
        let graph = generate(&rules, "app", "debug").unwrap();
        assert!(graph.lookup("lib", "").is_some());
        assert!(graph.lookup("lib", "debug").is_none());
    }

    #[test]
    fn test_captures_expand_into_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("foo.c");
        std::fs::write(&src, "int main;").unwrap();
        let base = dir.path().to_str().unwrap();

        let rules =
            rule_sets("'(.*)\\.o' : ${match_1}.c\n\tcc -c ${match_1}.c -o ${match_1}.o\n");
        let target = format!("{}/foo.o", base);
        let graph = generate(&rules, &target, "").unwrap();
        let node_idx = graph.lookup(&target, "").unwrap();
        let node = graph.node(node_idx);
        assert_eq!(node.captures[1], format!("{}/foo", base));
        // The expanded dependency resolved to the existing foo.c.
        let dep = graph.lookup(&format!("{}/foo.c", base), "").unwrap();
        assert!(graph.has_dependency(node_idx, dep));
    }

    #[test]
    fn test_fail_ok_skips_unresolvable_dependency() {
        let rules = rule_sets("a : failok : ghost b:\n\tbuild a\nb :\n\tbuild b\n");
        let graph = generate(&rules, "a", "failok").unwrap();
        assert_eq!(graph.node_count(), 2);
        assert!(graph.lookup("ghost", "failok").is_none());
        assert!(graph.lookup("b", "").is_some());
    }

    #[test]
    fn test_unresolvable_dependency_is_fatal_without_failok() {
        let rules = rule_sets("a : ghost\n\tbuild a\n");
        assert!(matches!(
            generate(&rules, "a", "").unwrap_err(),
            GraphError::NoRule { .. }
        ));
    }

    #[test]
    fn test_unknown_variable_expands_to_nothing() {
        let rules = rule_sets("a : b $missing c\n\t:\nb :\n\t:\nc :\n\t:\n");
        let graph = generate(&rules, "a", "").unwrap();
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn test_target_variable_in_dependencies() {
        let rules = rule_sets("'wrap-(.*)' : $match_1\n\twrap it\ninner :\n\tbuild inner\n");
        let graph = generate(&rules, "wrap-inner", "").unwrap();
        assert!(graph.lookup("inner", "").is_some());
    }
}
