use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::info;
use structopt::StructOpt;

use mmk_build::{default_rebuilder, BashRunner};
use mmk_metrics::scoped_metric;
use mmk_parse::Loader;

#[derive(Debug)]
pub struct NumJobs(pub usize);

/*
 * Wrapping usize lets structopt show a dynamic default (CPU count + 1) in
 * the help text: Default supplies the value, Display tacks the description
 * on, and FromStr strips it again when structopt round-trips the default
 * through parsing.
 */
impl NumJobs {
    const SUFFIX: &'static str = ", derived from CPUs available";
}

impl Default for NumJobs {
    fn default() -> NumJobs {
        NumJobs(num_cpus::get() + 1)
    }
}

impl fmt::Display for NumJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0, NumJobs::SUFFIX)
    }
}

impl std::str::FromStr for NumJobs {
    type Err = <usize as std::str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(stripped) = s.strip_suffix(NumJobs::SUFFIX) {
            Ok(NumJobs(usize::from_str(stripped)?))
        } else {
            Ok(NumJobs(usize::from_str(s)?))
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "mmk",
    usage = "mmk [options] [target[:rule_type]...]\n\nWithout targets, builds 'main'."
)]
pub struct Config {
    /// the build file to read and execute
    #[structopt(short = "f", default_value = "mmkfile", name = "FILE")]
    pub file: String,

    /// max number of concurrent jobs
    #[structopt(short = "j", default_value, name = "N")]
    pub jobs: NumJobs,

    /// run verbosely
    #[structopt(short = "v")]
    pub verbose: bool,

    /// dump the parsed rules to stdout
    #[structopt(short = "d")]
    pub dump: bool,

    /// print out all targets available
    #[structopt(short = "t")]
    pub list_targets: bool,

    /// targets to build, each of the form target[:rule_type]
    #[structopt(name = "TARGET")]
    pub targets: Vec<String>,
}

/// Resolves includes relative to the including file.
pub struct FileLoader;

impl Loader for FileLoader {
    fn load(&mut self, from: Option<&str>, request: &str) -> io::Result<String> {
        std::fs::read_to_string(resolve(from, request))
    }
}

fn resolve(from: Option<&str>, request: &str) -> PathBuf {
    let request = Path::new(request);
    if request.is_absolute() {
        return request.to_owned();
    }
    match from.and_then(|f| Path::new(f).parent()) {
        Some(parent) => parent.join(request),
        None => request.to_owned(),
    }
}

/// Splits `target[:rule_type]` at the last colon; a spec that is only a
/// rule-type applies to `main`.
pub fn split_target(spec: &str) -> (String, String) {
    match spec.rfind(':') {
        None => (spec.to_owned(), String::new()),
        Some(i) => {
            let target = if i == 0 { "main" } else { &spec[..i] };
            (target.to_owned(), spec[i + 1..].to_owned())
        }
    }
}

pub fn run(config: Config) -> anyhow::Result<()> {
    let jobs = config.jobs.0;
    anyhow::ensure!(jobs >= 1, "jobs must be >= 1");

    if config.verbose {
        mmk_metrics::enable();
    }
    // Recipes inherit these; set them before any shell runs, including the
    // $(...) variables evaluated during parsing.
    std::env::set_var("mmk_verbose", if config.verbose { "true" } else { "false" });
    std::env::set_var("mmk_njobs", jobs.to_string());

    let rules = {
        scoped_metric!("parse");
        mmk_parse::parse(&mut FileLoader, &config.file)
            .with_context(|| format!("parsing {}", &config.file))?
    };
    std::env::set_var("mmk_file", &config.file);

    if config.dump {
        print!("{}", rules);
        return Ok(());
    }

    if config.list_targets {
        for set in &rules.sets {
            for body in &set.bodies {
                if body.rule_type.is_empty() {
                    println!("{}", set.target);
                } else {
                    println!("{}:{}", set.target, body.rule_type);
                }
            }
        }
        return Ok(());
    }

    let mut targets = config.targets.clone();
    if targets.is_empty() {
        targets.push("main".to_owned());
    }

    let rebuilder = default_rebuilder();
    let runner = BashRunner::new(config.verbose);
    for spec in &targets {
        let (mut target, mut rule_type) = split_target(spec);
        if rules.rule_for(&target, &rule_type).is_none() {
            // The colon may have been part of the target name itself.
            target = spec.clone();
            rule_type = String::new();
            if rules.rule_for(&target, &rule_type).is_none() {
                anyhow::bail!("Could not find target for {}", spec);
            }
        }
        if rule_type.is_empty() {
            info!("Starting {}", target);
        } else {
            info!("Starting {}:{}", target, rule_type);
        }

        let graph = {
            scoped_metric!("graph");
            mmk_build::generate(&rules, &target, &rule_type).with_context(|| {
                format!("Could not construct dependency graph for {}", target)
            })?
        };
        {
            scoped_metric!("build");
            mmk_build::execute(&graph, jobs, &rebuilder, &runner)
                .with_context(|| format!("Failed to build target {}", target))?;
        }
    }

    if config.verbose {
        mmk_metrics::dump();
    }
    Ok(())
}
