//! The raw directive tree produced by the syntactic parser, before includes
//! are spliced, variables evaluated and rules flattened.

/// A token in a target or dependency position.
///
/// `Str` and `Regex` keep their surrounding quotes so that dependency lists
/// can be stored verbatim and re-parsed per node after expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Word(String),
    Str(String),
    Regex(String),
}

impl Element {
    /// The element exactly as written.
    pub fn raw(&self) -> &str {
        match self {
            Element::Word(s) | Element::Str(s) | Element::Regex(s) => s,
        }
    }

    /// The element with one layer of quotes removed.
    pub fn inner(&self) -> &str {
        match self {
            Element::Word(s) => s,
            Element::Str(s) => strip_quotes(s, '"'),
            Element::Regex(s) => strip_quotes(s, '\''),
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Element::Regex(_))
    }
}

fn strip_quotes(s: &str, quote: char) -> &str {
    s.strip_prefix(quote)
        .and_then(|s| s.strip_suffix(quote))
        .unwrap_or(s)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name: String,
    /// Whitespace-joinable value tokens. A single `$(…)` value is replaced
    /// by shell output during the semantic pass.
    pub value: Vec<String>,
}

impl Var {
    pub fn joined(&self) -> String {
        self.value.join(" ")
    }
}

/// One `: SecondPart [: ThirdPart] / recipe…` block of a rule.
///
/// `has_third` distinguishes a dependency list that was specified but empty
/// from one that was not specified at all; the latter inherits.
#[derive(Debug, Clone, Default)]
pub struct RuleSection {
    pub second: Vec<Element>,
    pub has_third: bool,
    pub third: Vec<Element>,
    pub lines: Vec<String>,
}

#[derive(Debug)]
pub struct Rule {
    pub target: Vec<Element>,
    pub sections: Vec<RuleSection>,
}

/// A `ruletype` template declaration: default bodies merged into any rule
/// that declares the named rule-type.
#[derive(Debug)]
pub struct RuleTypeDecl {
    pub name: Element,
    pub sections: Vec<RuleSection>,
}

#[derive(Debug)]
pub enum Directive {
    Include(String),
    Var(Var),
    RuleType(RuleTypeDecl),
    Rule(Rule),
}

#[derive(Debug)]
pub struct File {
    pub source: Option<String>,
    pub directives: Vec<Directive>,
}
