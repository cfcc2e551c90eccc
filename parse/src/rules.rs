//! The semantic pass: include splicing, variable evaluation and the
//! flattening of parsed rules into the searchable rule set.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::io;
use std::process::{Command, Stdio};

use log::warn;
use thiserror::Error;

use crate::ast::{Directive, Element, File, RuleSection, RuleTypeDecl, Var};
use crate::matcher::{combine_elements, to_matcher, Matcher};
use crate::parser::{ParseError, Parser};

/// Fetches the contents of build files, so includes can be resolved without
/// tying the resolver to the filesystem.
pub trait Loader {
    /// `from` is the file doing the including, None for the entry point.
    fn load(&mut self, from: Option<&str>, request: &str) -> io::Result<String>;
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("{0}")]
    ParseFailed(#[from] ParseError),
    #[error("cannot read {file}: {source}")]
    ReadFailed { file: String, source: io::Error },
    #[error("In file {file}: <{include}: {source}")]
    IncludeFailed {
        file: String,
        include: String,
        source: io::Error,
    },
    #[error("Duplicate definition for target {0}")]
    DuplicateRuleType(String),
    #[error("invalid regular expression '{pattern}': {source}")]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },
}

/// One rule-type's recipe, dependencies and flags.
///
/// `dependencies` distinguishes "not specified" (None, inherits) from
/// "specified but empty" (Some with no entries). The tokens are kept raw;
/// they are expanded and re-parsed per node at graph-build time.
#[derive(Debug, Clone, Default)]
pub struct RuleBody {
    pub rule_type: String,
    pub fail_ok: bool,
    pub dependencies: Option<Vec<String>>,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub target: Matcher,
    pub bodies: Vec<RuleBody>,
}

impl RuleSet {
    /// The empty rule-type selects the first body, whatever its type.
    pub fn select_body(&self, rule_type: &str) -> Option<&RuleBody> {
        if rule_type.is_empty() {
            return self.bodies.first();
        }
        self.bodies.iter().find(|b| b.rule_type == rule_type)
    }
}

/// All rules of a build tree, ordered for search: later declarations come
/// first, so they shadow earlier ones.
#[derive(Debug)]
pub struct RuleSets {
    pub vars: Vec<Var>,
    pub sets: Vec<RuleSet>,
}

impl RuleSets {
    /// The first matching rule that also has a body of the requested type.
    pub fn rule_for(&self, target: &str, rule_type: &str) -> Option<&RuleSet> {
        self.sets
            .iter()
            .find(|s| s.target.matches(target) && s.select_body(rule_type).is_some())
    }

    pub fn var_map(&self) -> HashMap<String, String> {
        self.vars
            .iter()
            .map(|v| (v.name.clone(), v.joined()))
            .collect()
    }
}

impl Display for RuleSets {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        writeln!(f, "[Vars:")?;
        for v in &self.vars {
            writeln!(f, "\t{}={}", v.name, v.joined())?;
        }
        writeln!(f, "]")?;
        for set in &self.sets {
            writeln!(f, "[Target: {}]", set.target)?;
            for body in &set.bodies {
                let deps = match &body.dependencies {
                    None => "(inherited)".to_owned(),
                    Some(deps) => deps.join(", "),
                };
                writeln!(f, "\t[Type: {}] -> [Deps: {}]:", body.rule_type, deps)?;
                for line in &body.lines {
                    writeln!(f, "\t\t{}", line)?;
                }
            }
        }
        Ok(())
    }
}

/// Parses `start` and everything it includes into the flat rule set.
pub fn parse(loader: &mut dyn Loader, start: &str) -> Result<RuleSets, ProcessingError> {
    let file = load_and_parse(loader, None, start)?;
    let expanded = expand(file, loader)?;
    convert(expanded)
}

fn load_and_parse(
    loader: &mut dyn Loader,
    from: Option<&str>,
    path: &str,
) -> Result<File, ProcessingError> {
    let input = loader.load(from, path).map_err(|source| match from {
        Some(file) => ProcessingError::IncludeFailed {
            file: file.to_owned(),
            include: path.to_owned(),
            source,
        },
        None => ProcessingError::ReadFailed {
            file: path.to_owned(),
            source,
        },
    })?;
    Ok(Parser::new(&input, Some(path.to_owned())).parse()?)
}

/// Rule-type names are compared by their matcher string, so a quoted name
/// and a bareword are the same type.
fn type_name(element: &Element) -> String {
    if element.is_regex() {
        format!("^{}$", element.inner())
    } else {
        element.inner().to_owned()
    }
}

struct Expanded {
    vars: Vec<Var>,
    rule_types: HashMap<String, RuleTypeDecl>,
    rules: Vec<crate::ast::Rule>,
}

/// First pass over the directives: splice includes, evaluate shell-backed
/// variables, register rule-type templates, keep rules for conversion.
fn expand(file: File, loader: &mut dyn Loader) -> Result<Expanded, ProcessingError> {
    let File { source, directives } = file;
    let mut exp = Expanded {
        vars: Vec::new(),
        rule_types: HashMap::new(),
        rules: Vec::new(),
    };
    for directive in directives {
        match directive {
            Directive::Include(path) => {
                let included = load_and_parse(loader, source.as_deref(), &path)?;
                let included = expand(included, loader)?;
                exp.rules.extend(included.rules);
                exp.rule_types.extend(included.rule_types);
                exp.vars.extend(included.vars);
            }
            Directive::Var(mut var) => {
                let joined = var.joined();
                if joined.starts_with("$(") && joined.ends_with(')') {
                    var.value = vec![shell_value(&joined[2..joined.len() - 1])];
                }
                exp.vars.push(var);
            }
            Directive::RuleType(decl) => {
                exp.rule_types.insert(type_name(&decl.name), decl);
            }
            Directive::Rule(rule) => exp.rules.push(rule),
        }
    }
    Ok(exp)
}

/// `$(…)` variable values become the trimmed stdout of the inner command;
/// a failing command yields the empty string with a diagnostic.
fn shell_value(cmd: &str) -> String {
    match Command::new("bash")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
    {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_owned(),
        Ok(out) => {
            warn!("$({}) exited with {}", cmd, out.status);
            String::new()
        }
        Err(err) => {
            warn!("$({}): {}", cmd, err);
            String::new()
        }
    }
}

/// A rule-type template section: the second part is always type names, the
/// optional third part is dependencies.
fn template_body(section: &RuleSection) -> RuleBody {
    let mut rb = RuleBody::default();
    if section.has_third {
        rb.dependencies = Some(section.third.iter().map(|e| e.raw().to_owned()).collect());
    }
    for (i, name) in section.second.iter().map(type_name).enumerate() {
        if i == 0 {
            rb.rule_type = name.clone();
        }
        if name == "failok" {
            rb.fail_ok = true;
        }
    }
    rb.lines = section.lines.clone();
    rb
}

/// Second pass: every retained rule becomes a RuleSet, templates are merged
/// in, and the list is reversed so later rules shadow earlier ones.
fn convert(exp: Expanded) -> Result<RuleSets, ProcessingError> {
    let var_map: HashMap<String, String> = exp
        .vars
        .iter()
        .map(|v| (v.name.clone(), v.joined()))
        .collect();

    let defaults: HashMap<String, Vec<RuleBody>> = exp
        .rule_types
        .iter()
        .map(|(name, decl)| (name.clone(), decl.sections.iter().map(template_body).collect()))
        .collect();

    let mut sets = Vec::new();
    for rule in &exp.rules {
        let target_elem = match combine_elements(&rule.target, &var_map) {
            Some(e) => e,
            None => continue,
        };
        let target = to_matcher(&target_elem).map_err(|source| ProcessingError::BadRegex {
            pattern: target_elem.inner().to_owned(),
            source,
        })?;

        let mut bodies: Vec<RuleBody> = Vec::new();
        let mut types = HashSet::new();
        for (i, section) in rule.sections.iter().enumerate() {
            let mut rb = RuleBody::default();
            if i == 0 && !section.has_third {
                // First section with a single part: it is the dependency
                // list and these lines form the default body.
                if !section.second.is_empty() {
                    rb.dependencies =
                        Some(section.second.iter().map(|e| e.raw().to_owned()).collect());
                }
            } else {
                for (k, name) in section.second.iter().map(type_name).enumerate() {
                    if k == 0 {
                        rb.rule_type = name.clone();
                    }
                    if name == "failok" {
                        rb.fail_ok = true;
                    }
                }
                if section.has_third {
                    rb.dependencies =
                        Some(section.third.iter().map(|e| e.raw().to_owned()).collect());
                } else {
                    // No dependency list: inherit from the first body.
                    rb.dependencies = bodies[0].dependencies.clone();
                }
            }
            rb.lines = section.lines.clone();
            if !types.insert(rb.rule_type.clone()) {
                return Err(ProcessingError::DuplicateRuleType(target.to_string()));
            }
            bodies.push(rb);
        }

        // Merge rule-type templates: a template supplies the recipe for a
        // declared body that has none, and any further template bodies are
        // appended. Template bodies inherit the first body's dependency
        // list when it is specified.
        let first_deps = bodies.first().and_then(|b| b.dependencies.clone());
        let mut additional = Vec::new();
        for i in 0..bodies.len() {
            if let Some(tbodies) = defaults.get(&bodies[i].rule_type) {
                for tb in tbodies {
                    let mut tb = tb.clone();
                    if first_deps.is_some() {
                        tb.dependencies = first_deps.clone();
                    }
                    if bodies[i].lines.is_empty() && tb.rule_type == bodies[i].rule_type {
                        bodies[i] = tb;
                    } else {
                        additional.push(tb);
                    }
                }
            }
        }
        for tb in additional {
            if types.contains(&tb.rule_type) {
                continue;
            }
            types.insert(tb.rule_type.clone());
            bodies.push(tb);
        }

        sets.push(RuleSet { target, bodies });
    }

    // Searched in reverse declaration order.
    sets.reverse();
    Ok(RuleSets {
        vars: exp.vars,
        sets,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    /// In-memory loader; the entry point is always "mmkfile".
    struct MapLoader {
        files: HashMap<String, String>,
    }

    impl MapLoader {
        fn single(input: &str) -> MapLoader {
            let mut files = HashMap::new();
            files.insert("mmkfile".to_owned(), input.to_owned());
            MapLoader { files }
        }
    }

    impl Loader for MapLoader {
        fn load(&mut self, _from: Option<&str>, request: &str) -> io::Result<String> {
            self.files
                .get(request)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, request.to_owned()))
        }
    }

    fn parse_str(input: &str) -> Result<RuleSets, ProcessingError> {
        parse(&mut MapLoader::single(input), "mmkfile")
    }

    #[test]
    fn test_simple_convert() {
        let sets = parse_str("hello : hello.c\n\tcc hello.c -o hello\n").unwrap();
        assert_eq!(sets.sets.len(), 1);
        let rule = sets.rule_for("hello", "").expect("rule");
        let body = rule.select_body("").expect("body");
        assert_eq!(body.rule_type, "");
        assert_eq!(body.dependencies, Some(vec!["hello.c".to_owned()]));
        assert_eq!(body.lines, vec!["cc hello.c -o hello".to_owned()]);
    }

    #[test]
    fn test_last_declared_wins() {
        let sets = parse_str("'x.*' :\n\techo regex\nxyz :\n\techo literal\n").unwrap();
        let rule = sets.rule_for("xyz", "").expect("rule");
        assert_eq!(
            rule.select_body("").unwrap().lines,
            vec!["echo literal".to_owned()]
        );
        // Anything else starting with x still reaches the regex rule.
        let rule = sets.rule_for("xabc", "").expect("rule");
        assert_eq!(
            rule.select_body("").unwrap().lines,
            vec!["echo regex".to_owned()]
        );
    }

    #[test]
    fn test_typed_sections_and_failok() {
        let sets = parse_str("dep1 :\n  : failok\n\tfalse\n").unwrap();
        let rule = sets.rule_for("dep1", "failok").expect("rule");
        let body = rule.select_body("failok").expect("body");
        assert!(body.fail_ok);
        assert_eq!(body.lines, vec!["false".to_owned()]);
        // The default body has no recipe and no dependencies.
        let default = rule.select_body("").expect("default body");
        assert_eq!(default.dependencies, None);
        assert!(default.lines.is_empty());
    }

    #[test]
    fn test_failok_among_type_tokens() {
        let sets = parse_str("a : fetch failok : src\n\tcurl src\n").unwrap();
        let rule = sets.rule_for("a", "fetch").expect("rule");
        let body = rule.select_body("fetch").expect("body");
        assert!(body.fail_ok);
        assert_eq!(body.dependencies, Some(vec!["src".to_owned()]));
    }

    #[test]
    fn test_dependency_inheritance() {
        let sets = parse_str("a : d1 d2\n\tbuild a\n: fresh\n\trefresh a\n").unwrap();
        let rule = sets.rule_for("a", "fresh").expect("rule");
        let body = rule.select_body("fresh").expect("body");
        assert_eq!(body.dependencies, Some(vec!["d1".to_owned(), "d2".to_owned()]));
    }

    #[test]
    fn test_specified_empty_does_not_inherit() {
        let sets = parse_str("a : d1\n\tbuild a\n: fresh :\n\trefresh a\n").unwrap();
        let rule = sets.rule_for("a", "fresh").expect("rule");
        let body = rule.select_body("fresh").expect("body");
        assert_eq!(body.dependencies, Some(vec![]));
    }

    #[test]
    fn test_duplicate_rule_type_rejected() {
        let err = parse_str("a : fresh : d1\n\tone\n: fresh : d2\n\ttwo\n").unwrap_err();
        match err {
            ProcessingError::DuplicateRuleType(target) => assert_eq!(target, "a"),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_duplicate_default_body_rejected() {
        assert!(matches!(
            parse_str("a :\n\tone\n:\n\ttwo\n").unwrap_err(),
            ProcessingError::DuplicateRuleType(_)
        ));
    }

    #[test]
    fn test_variable_in_target() {
        let sets = parse_str("var name = prog\n$name :\n\tbuild it\n").unwrap();
        assert!(sets.rule_for("prog", "").is_some());
        assert!(sets.rule_for("$name", "").is_none());
    }

    #[test]
    fn test_shell_variable() {
        let sets = parse_str("var who = $(echo world)\nmain :\n\techo hi\n").unwrap();
        assert_eq!(sets.var_map().get("who"), Some(&"world".to_owned()));
    }

    #[test]
    fn test_failing_shell_variable_is_empty() {
        let sets = parse_str("var bad = $(exit 3)\nmain :\n\techo hi\n").unwrap();
        assert_eq!(sets.var_map().get("bad"), Some(&"".to_owned()));
    }

    #[test]
    fn test_include_splices() {
        let mut files = HashMap::new();
        files.insert(
            "mmkfile".to_owned(),
            "<lib.mmk\nmain : helper\n\techo main\n".to_owned(),
        );
        files.insert(
            "lib.mmk".to_owned(),
            "var from_lib = yes\nhelper :\n\techo helper\n".to_owned(),
        );
        let mut loader = MapLoader { files };
        let sets = parse(&mut loader, "mmkfile").unwrap();
        assert!(sets.rule_for("helper", "").is_some());
        assert!(sets.rule_for("main", "").is_some());
        assert_eq!(sets.var_map().get("from_lib"), Some(&"yes".to_owned()));
    }

    #[test]
    fn test_missing_include_fails() {
        let err = parse_str("<nope.mmk\n").unwrap_err();
        assert!(matches!(err, ProcessingError::IncludeFailed { .. }));
    }

    #[test]
    fn test_template_supplies_recipe() {
        let input = "ruletype clean\n  : clean\n\trm -f $target\nprog : prog.c\n\tcc prog.c\n: clean\n";
        let sets = parse_str(input).unwrap();
        let rule = sets.rule_for("prog", "clean").expect("rule");
        let body = rule.select_body("clean").expect("body");
        assert_eq!(body.lines, vec!["rm -f $target".to_owned()]);
        // Template bodies inherit the first body's dependency list.
        assert_eq!(body.dependencies, Some(vec!["prog.c".to_owned()]));
    }

    #[test]
    fn test_template_does_not_override_recipe() {
        let input = "ruletype clean\n  : clean\n\trm -f $target\nprog :\n\tcc prog.c\n: clean\n\tscrub prog\n";
        let sets = parse_str(input).unwrap();
        let rule = sets.rule_for("prog", "clean").expect("rule");
        assert_eq!(
            rule.select_body("clean").unwrap().lines,
            vec!["scrub prog".to_owned()]
        );
    }

    #[test]
    fn test_template_appends_extra_bodies() {
        // Declaring `dist` pulls in the template's `upload` body too.
        let input = "ruletype dist\n  : dist\n\ttar cf $target.tar .\n  : upload\n\tscp $target.tar remote:\nrel :\n\tmake rel\n: dist\n";
        let sets = parse_str(input).unwrap();
        let rule = sets.rule_for("rel", "upload").expect("rule");
        assert_eq!(
            rule.select_body("upload").unwrap().lines,
            vec!["scp $target.tar remote:".to_owned()]
        );
    }

    #[test]
    fn test_untyped_rule_gets_no_template() {
        let input = "ruletype clean\n  : clean\n\trm -f $target\nplain :\n\techo plain\n";
        let sets = parse_str(input).unwrap();
        assert!(sets.rule_for("plain", "clean").is_none());
    }

    #[test]
    fn test_bad_regex_target() {
        assert!(matches!(
            parse_str("'(' :\n\techo\n").unwrap_err(),
            ProcessingError::BadRegex { .. }
        ));
    }

    #[test]
    fn test_dump_format() {
        let sets = parse_str("var CC = gcc\nhello : hello.c\n\t$CC hello.c\n").unwrap();
        let dump = format!("{}", sets);
        assert!(dump.contains("CC=gcc"));
        assert!(dump.contains("[Target: hello]"));
        assert!(dump.contains("hello.c"));
    }
}
