//! The staleness oracle: when does a node need its recipe run?

use std::time::SystemTime;

use chrono::DateTime;
use log::warn;
use petgraph::graph::NodeIndex;

use crate::disk_interface::DiskInterface;
use crate::graph::{Graph, Node};
use crate::shell::RecipeRunner;

pub struct MTimeRebuilder<Disk>
where
    Disk: DiskInterface,
{
    disk: Disk,
}

impl<Disk> MTimeRebuilder<Disk>
where
    Disk: DiskInterface,
{
    pub fn new(disk: Disk) -> Self {
        MTimeRebuilder { disk }
    }

    /// A node's timestamp: the output of its `build_date` body parsed as
    /// RFC 1123Z if it declares one, else the target file's mtime, else
    /// unknown. An unparseable or failing probe counts as unknown; a broken
    /// probe must never make a target look fresh.
    pub fn build_date(&self, node: &Node, runner: &dyn RecipeRunner) -> Option<SystemTime> {
        for body in &node.rule.bodies {
            if body.rule_type == "build_date" {
                let output = match runner.run_captured(node, &body.lines) {
                    Ok(output) => output,
                    Err(err) => {
                        warn!("build_date for {} failed: {}", node.key(), err);
                        return None;
                    }
                };
                let trimmed = output.trim();
                return match DateTime::parse_from_rfc2822(trimmed) {
                    Ok(date) => Some(date.into()),
                    Err(err) => {
                        warn!(
                            "Failed to parse date from build_date for {}: {} [Output: {}]",
                            node.target, err, trimmed
                        );
                        None
                    }
                };
            }
        }
        self.disk.modified(std::path::Path::new(&node.target)).ok()
    }

    /// Typed nodes always run. Untyped nodes run when their timestamp is
    /// unknown or any dependency is newer.
    pub fn needs_build(
        &self,
        graph: &Graph,
        idx: NodeIndex,
        runner: &dyn RecipeRunner,
    ) -> bool {
        let node = graph.node(idx);
        if !node.rule_type.is_empty() {
            return true;
        }
        let this_date = match self.build_date(node, runner) {
            None => return true,
            Some(date) => date,
        };
        graph.dependencies(idx).any(|dep| {
            match self.build_date(graph.node(dep), runner) {
                Some(upstream) => upstream > this_date,
                None => false,
            }
        })
    }
}
