//! Build-file parsing for mmk: a stateful lexer, a recursive-descent parser
//! producing a directive tree, and a semantic pass that flattens everything
//! into the searchable rule set.

pub mod ast;
pub mod expand;
pub mod lexer;
pub mod matcher;
pub mod parser;
pub mod rules;

pub use ast::{Element, Var};
pub use expand::expand_vars;
pub use matcher::Matcher;
pub use parser::{ParseError, Parser};
pub use rules::{parse, Loader, ProcessingError, RuleBody, RuleSet, RuleSets};
