//! The second-stage dependency grammar. Dependency lists are stored raw on
//! rule bodies and re-parsed here per node, after variable and capture
//! substitution, into whitespace-separated `Target[:RuleType]` tokens.

/// One parsed dependency. `rule_type` is None when the token carried no
/// colon, in which case the parent's rule-type is inherited; a trailing
/// colon yields Some("") and forces the default body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dep {
    pub target: String,
    pub rule_type: Option<String>,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    input: &'a str,
    offset: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.offset).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_ascii_whitespace() {
                break;
            }
            self.offset += 1;
        }
    }

    /// A quoted run (quotes stripped) or a bare run up to whitespace/colon.
    fn scan_part(&mut self) -> String {
        if self.peek() == Some(b'"') {
            self.offset += 1;
            let start = self.offset;
            while let Some(c) = self.peek() {
                if c == b'\\' {
                    self.offset += 2;
                    continue;
                }
                if c == b'"' {
                    break;
                }
                self.offset += 1;
            }
            let end = self.offset.min(self.input.len());
            if self.peek() == Some(b'"') {
                self.offset += 1;
            }
            return self.input[start..end].to_owned();
        }
        let start = self.offset;
        while let Some(c) = self.peek() {
            if c == b':' || c.is_ascii_whitespace() {
                break;
            }
            self.offset += 1;
        }
        self.input[start..self.offset].to_owned()
    }
}

pub fn parse_deps(input: &str) -> Vec<Dep> {
    let mut scanner = Scanner {
        bytes: input.as_bytes(),
        input,
        offset: 0,
    };
    let mut deps = Vec::new();
    loop {
        scanner.skip_whitespace();
        if scanner.peek().is_none() {
            break;
        }
        let target = scanner.scan_part();
        let mut rule_type = None;
        if scanner.peek() == Some(b':') {
            scanner.offset += 1;
            rule_type = Some(scanner.scan_part());
        }
        if target.is_empty() && rule_type.is_none() {
            // A stray colon or similar; skip the byte rather than loop.
            scanner.offset += 1;
            continue;
        }
        if target.is_empty() {
            continue;
        }
        deps.push(Dep { target, rule_type });
    }
    deps
}
