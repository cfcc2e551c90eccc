use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::ast::Element;
use crate::expand::expand_vars;

/// How a rule's target is matched against a requested target string:
/// exact equality for literals, anchored full-string match for regexes.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Regex(regex::Regex),
}

impl Matcher {
    pub fn matches(&self, s: &str) -> bool {
        match self {
            Matcher::Literal(lit) => lit == s,
            Matcher::Regex(re) => re.is_match(s),
        }
    }

    /// Submatches for regex matchers, index 0 being the whole match.
    /// Empty for literals and non-matches; an unmatched group is "".
    pub fn captures(&self, s: &str) -> Vec<String> {
        match self {
            Matcher::Literal(_) => Vec::new(),
            Matcher::Regex(re) => match re.captures(s) {
                None => Vec::new(),
                Some(caps) => caps
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_owned()).unwrap_or_default())
                    .collect(),
            },
        }
    }
}

impl Display for Matcher {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Matcher::Literal(lit) => write!(f, "{}", lit),
            Matcher::Regex(re) => write!(f, "{}", re.as_str()),
        }
    }
}

/// Expands variable references inside an element. Regex elements are left
/// alone; `$` means something else there.
pub fn expand_element(element: &Element, vars: &HashMap<String, String>) -> Element {
    match element {
        Element::Word(s) => Element::Word(expand_vars(s, vars)),
        Element::Str(s) => Element::Str(expand_vars(s, vars)),
        Element::Regex(_) => element.clone(),
    }
}

/// Concatenates two elements. Literal with literal stays literal; as soon as
/// a regex is involved the result is a regex, with any literal side quoted.
pub fn combine(a: &Element, b: &Element) -> Element {
    if !a.is_regex() && !b.is_regex() {
        return Element::Word(format!("{}{}", a.inner(), b.inner()));
    }
    let left = if a.is_regex() {
        a.inner().to_owned()
    } else {
        regex::escape(a.inner())
    };
    let right = if b.is_regex() {
        b.inner().to_owned()
    } else {
        regex::escape(b.inner())
    };
    // Combined regexes carry no quotes; Element::inner only strips a
    // balanced pair, so this round-trips.
    Element::Regex(format!("{}{}", left, right))
}

/// Expands and folds a run of target elements into one.
pub fn combine_elements(elements: &[Element], vars: &HashMap<String, String>) -> Option<Element> {
    let mut iter = elements.iter().map(|e| expand_element(e, vars));
    let first = iter.next()?;
    Some(iter.fold(first, |acc, e| combine(&acc, &e)))
}

/// Converts an element into a matcher, anchoring regexes to the full string.
pub fn to_matcher(element: &Element) -> Result<Matcher, regex::Error> {
    if element.is_regex() {
        Ok(Matcher::Regex(regex::Regex::new(&format!(
            "^{}$",
            element.inner()
        ))?))
    } else {
        Ok(Matcher::Literal(element.inner().to_owned()))
    }
}
