//! Recipe execution. Every external effect of the executor funnels through
//! the RecipeRunner trait, so tests can swap the shell for a recorder.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::graph::Node;

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("failed to run bash: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to feed recipe to bash: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("{0}")]
    Failed(std::process::ExitStatus),
}

pub trait RecipeRunner: Sync {
    /// Runs the recipe; output goes to the terminal or nowhere, depending
    /// on verbosity.
    fn run(&self, node: &Node, lines: &[String]) -> Result<(), RecipeError>;

    /// Runs the recipe with stdout captured; used for `build_date` bodies.
    fn run_captured(&self, node: &Node, lines: &[String]) -> Result<String, RecipeError>;
}

/// The header prepended to every recipe. Recipes fail fast, and `mmkecho`
/// writes to FD 3 so they can log to the terminal without polluting
/// captured stdout.
pub fn script_header(verbose: bool) -> String {
    let mut header = String::from(
        "set -o errexit\n\
         set -o nounset\n\
         set -o pipefail\n",
    );
    if verbose {
        header.push_str("set -x\n");
    }
    header.push_str("\nfunction mmkecho {\n\tbuiltin echo \"$@\" 1>&3\n}\n\n");
    header
}

pub struct BashRunner {
    pub verbose: bool,
}

impl BashRunner {
    pub fn new(verbose: bool) -> BashRunner {
        BashRunner { verbose }
    }

    fn run_script(
        &self,
        node: &Node,
        lines: &[String],
        capture: bool,
    ) -> Result<String, RecipeError> {
        let script = format!("{}{}\n", script_header(self.verbose), lines.join("\n"));

        let mut cmd = Command::new("bash");
        cmd.arg("-s");
        for var in node.vars.iter() {
            cmd.env(&var.name, var.joined());
        }
        for (i, cap) in node.captures.iter().enumerate() {
            cmd.env(format!("match_{}", i), cap);
        }
        cmd.env("mmk_ruletype", &node.rule_type);
        cmd.env("target", &node.target);
        cmd.stdin(Stdio::piped());
        if capture {
            cmd.stdout(Stdio::piped());
        } else if self.verbose {
            cmd.stdout(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null());
        }
        if self.verbose {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::null());
        }

        // FD 3 in the recipe is the parent's stderr, whatever the child's
        // own stderr was set to. Duplicate it now so concurrent workers
        // each hand their child a live descriptor.
        let log_fd = unsafe { libc::dup(libc::STDERR_FILENO) };
        if log_fd >= 0 {
            unsafe {
                cmd.pre_exec(move || {
                    if libc::dup2(log_fd, 3) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        let spawned = cmd.spawn();
        if log_fd >= 0 {
            unsafe {
                libc::close(log_fd);
            }
        }
        let mut child = spawned.map_err(RecipeError::Spawn)?;

        {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            if let Err(err) = stdin.write_all(script.as_bytes()) {
                // bash went away early; reap it before reporting.
                let _ = child.wait();
                return Err(RecipeError::Stdin(err));
            }
            // Dropping closes the pipe so bash sees EOF.
        }

        let output = child.wait_with_output().map_err(RecipeError::Spawn)?;
        if !output.status.success() {
            return Err(RecipeError::Failed(output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RecipeRunner for BashRunner {
    fn run(&self, node: &Node, lines: &[String]) -> Result<(), RecipeError> {
        self.run_script(node, lines, false).map(|_| ())
    }

    fn run_captured(&self, node: &Node, lines: &[String]) -> Result<String, RecipeError> {
        self.run_script(node, lines, true)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::{HashMap, HashSet};
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    use super::{RecipeError, RecipeRunner};
    use crate::graph::Node;

    /// Records recipe invocations instead of running them. Keys are node
    /// display keys (`target` or `target:rule_type`).
    #[derive(Default)]
    pub struct RecorderRunner {
        pub log: Mutex<Vec<String>>,
        /// Keys whose recipes report failure.
        pub fail: HashSet<String>,
        /// Canned stdout for run_captured, by key; anything else errors.
        pub captured: HashMap<String, String>,
    }

    impl RecorderRunner {
        pub fn ran(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl RecipeRunner for RecorderRunner {
        fn run(&self, node: &Node, _lines: &[String]) -> Result<(), RecipeError> {
            let key = node.key();
            self.log.lock().unwrap().push(key.clone());
            if self.fail.contains(&key) {
                Err(RecipeError::Failed(ExitStatus::from_raw(256)))
            } else {
                Ok(())
            }
        }

        fn run_captured(&self, node: &Node, _lines: &[String]) -> Result<String, RecipeError> {
            self.captured
                .get(&node.key())
                .cloned()
                .ok_or_else(|| RecipeError::Failed(ExitStatus::from_raw(256)))
        }
    }
}
