// src/topology.rs
//
// =============================================================================
// MINI-SLURM: TOPOLOGY ENGINE (v 0.1)
// =============================================================================
//
// Parses a small SwitchName/Nodes/Switches grammar (modeled on the layout of
// a cluster topology.conf) into a tree of switches, and answers distance and
// node-selection queries against it. When no topology file is configured we
// synthesize one node per CPU grouped 4-per-leaf-switch under a core switch,
// so the rest of the scheduler never has to special-case "no topology."
//
// Grammar (one directive per non-empty, non-comment line):
//
//   SwitchName=<name> Nodes=<node-list>
//   SwitchName=<name> Switches=<name>[,<name>]...
//
// A node-list is a comma-separated sequence of bare names and bracketed
// ranges, e.g. `node[1-4]`, `node[1,3,5]`, `node1,node2`.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::SchedulerError;

#[derive(Debug, Clone)]
struct SwitchNode {
    name: String,
    nodes: Vec<String>,
    child_switches: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    switches: HashMap<String, SwitchNode>,
    roots: Vec<String>,
    node_leaf_switch: HashMap<String, String>,
    all_nodes: Vec<String>,
}

impl Topology {
    /// One node per CPU, grouped 4-per-leaf-switch under a single core
    /// switch (spec.md §4.3's fallback when topology is requested but no
    /// config file exists). `n == 1` still gets a one-node leaf under the
    /// core switch rather than a bare flat node, so distance bookkeeping
    /// behaves the same shape as a real two-level tree.
    pub fn synthesize_default(n_nodes: u32) -> Self {
        const NODES_PER_LEAF: u32 = 4;
        let n_nodes = n_nodes.max(1);
        let nodes: Vec<String> = (1..=n_nodes).map(|i| format!("node{i}")).collect();

        let mut switches = HashMap::new();
        let mut node_leaf_switch = HashMap::new();
        let mut leaf_names = Vec::new();

        let n_leaves = n_nodes.div_ceil(NODES_PER_LEAF);
        for leaf_idx in 0..n_leaves {
            let leaf_name = format!("leaf{}", leaf_idx + 1);
            let start = (leaf_idx * NODES_PER_LEAF) as usize;
            let end = ((leaf_idx + 1) * NODES_PER_LEAF).min(n_nodes) as usize;
            let leaf_nodes = nodes[start..end].to_vec();
            for n in &leaf_nodes {
                node_leaf_switch.insert(n.clone(), leaf_name.clone());
            }
            switches.insert(
                leaf_name.clone(),
                SwitchNode {
                    name: leaf_name.clone(),
                    nodes: leaf_nodes,
                    child_switches: Vec::new(),
                },
            );
            leaf_names.push(leaf_name);
        }

        switches.insert(
            "core".to_string(),
            SwitchNode {
                name: "core".to_string(),
                nodes: Vec::new(),
                child_switches: leaf_names,
            },
        );

        Topology {
            switches,
            roots: vec!["core".to_string()],
            node_leaf_switch,
            all_nodes: nodes,
        }
    }

    pub fn parse(text: &str) -> Result<Self, SchedulerError> {
        let mut switches: HashMap<String, SwitchNode> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut name = None;
            let mut nodes: Vec<String> = Vec::new();
            let mut child_switches: Vec<String> = Vec::new();

            for field in line.split_whitespace() {
                let (key, value) = field.split_once('=').ok_or_else(|| {
                    SchedulerError::TopologyParse {
                        line: line_no,
                        message: format!("expected key=value, got {:?}", field),
                    }
                })?;
                match key {
                    "SwitchName" => name = Some(value.to_string()),
                    "Nodes" => nodes = expand_node_list(value, line_no)?,
                    "Switches" => {
                        child_switches = value.split(',').map(|s| s.to_string()).collect()
                    }
                    other => {
                        return Err(SchedulerError::TopologyParse {
                            line: line_no,
                            message: format!("unknown key {:?}", other),
                        })
                    }
                }
            }

            let name = name.ok_or_else(|| SchedulerError::TopologyParse {
                line: line_no,
                message: "missing SwitchName".to_string(),
            })?;

            if nodes.is_empty() && child_switches.is_empty() {
                return Err(SchedulerError::TopologyParse {
                    line: line_no,
                    message: "switch must declare Nodes or Switches".to_string(),
                });
            }

            order.push(name.clone());
            switches.insert(
                name.clone(),
                SwitchNode {
                    name,
                    nodes,
                    child_switches,
                },
            );
        }

        if switches.is_empty() {
            return Err(SchedulerError::TopologyParse {
                line: 0,
                message: "topology file declares no switches".to_string(),
            });
        }

        let child_of: std::collections::HashSet<&str> = switches
            .values()
            .flat_map(|s| s.child_switches.iter().map(|c| c.as_str()))
            .collect();
        let roots: Vec<String> = order
            .iter()
            .filter(|n| !child_of.contains(n.as_str()))
            .cloned()
            .collect();

        let mut node_leaf_switch = HashMap::new();
        let mut all_nodes = Vec::new();
        for sw in switches.values() {
            for n in &sw.nodes {
                node_leaf_switch.insert(n.clone(), sw.name.clone());
                all_nodes.push(n.clone());
            }
        }
        all_nodes.sort();
        all_nodes.dedup();

        Ok(Topology {
            switches,
            roots,
            node_leaf_switch,
            all_nodes,
        })
    }

    pub fn nodes(&self) -> &[String] {
        &self.all_nodes
    }

    /// Path from a leaf switch up to a root, innermost first.
    fn ancestry(&self, node: &str) -> Vec<String> {
        let mut path = Vec::new();
        let Some(mut cur) = self.node_leaf_switch.get(node).cloned() else {
            return path;
        };
        let mut guard = 0;
        loop {
            path.push(cur.clone());
            guard += 1;
            if guard > self.switches.len() + 1 {
                break; // malformed cycle, bail rather than loop forever
            }
            match self.parent_of(&cur) {
                Some(p) => cur = p,
                None => break,
            }
        }
        path
    }

    fn parent_of(&self, switch: &str) -> Option<String> {
        self.switches
            .values()
            .find(|s| s.child_switches.iter().any(|c| c == switch))
            .map(|s| s.name.clone())
    }

    /// `2 * (depth of LCA - 1)`, counting depth from the leaf switch (depth
    /// 1) upward. Same node is distance 0; two nodes on the same leaf switch
    /// are distance 0 (their LCA *is* that leaf, depth 1); sharing only a
    /// grandparent switch is distance 4. Unrelated trees have no defined
    /// distance and fall back to a large constant so placement still
    /// terminates.
    pub fn distance(&self, a: &str, b: &str) -> u32 {
        if a == b {
            return 0;
        }
        let pa = self.ancestry(a);
        let pb = self.ancestry(b);
        if pa.is_empty() || pb.is_empty() {
            return u32::MAX / 2;
        }
        for (ia, sa) in pa.iter().enumerate() {
            if pb.iter().any(|sb| sb == sa) {
                return ia as u32 * 2;
            }
        }
        u32::MAX / 2
    }

    /// Picks `count` nodes minimizing the maximum pairwise distance among the
    /// chosen set. §4.3: if a single leaf switch has enough free nodes, take
    /// them from there (preferring the leaf with the most free nodes, ties
    /// broken by switch name); otherwise run a greedy minimax starting from
    /// the leaf with the most free nodes, repeatedly adding the node that
    /// minimizes the resulting max pairwise distance, breaking ties by
    /// distance to the current centroid, then by name. This is bookkeeping
    /// used for job placement locality, not an enforced constraint: the
    /// scheduler still admits a job whose best grouping spans switches.
    pub fn select_nodes(&self, count: usize, available: &[String]) -> Vec<String> {
        if count == 0 {
            return Vec::new();
        }

        let mut by_switch: HashMap<&str, Vec<&str>> = HashMap::new();
        for n in available {
            if let Some(sw) = self.node_leaf_switch.get(n) {
                by_switch.entry(sw.as_str()).or_default().push(n.as_str());
            }
        }
        for nodes in by_switch.values_mut() {
            nodes.sort_unstable();
        }

        let mut leaves: Vec<(&str, &Vec<&str>)> = by_switch.iter().map(|(k, v)| (*k, v)).collect();
        leaves.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

        if let Some((_, nodes)) = leaves.iter().find(|(_, nodes)| nodes.len() >= count) {
            return nodes.iter().take(count).map(|s| s.to_string()).collect();
        }

        let Some((_, seed_leaf)) = leaves.first() else {
            return Vec::new();
        };
        let Some(&seed) = seed_leaf.first() else {
            return Vec::new();
        };

        let mut picked: Vec<String> = vec![seed.to_string()];
        let mut remaining: Vec<&str> = available
            .iter()
            .map(|s| s.as_str())
            .filter(|&n| n != seed)
            .collect();
        remaining.sort_unstable();

        while picked.len() < count && !remaining.is_empty() {
            let mut best: Option<(u32, u32, &str)> = None;
            for &cand in &remaining {
                let max_dist = picked
                    .iter()
                    .map(|p| self.distance(p, cand))
                    .max()
                    .unwrap_or(0);
                let dist_to_centroid: u32 = picked.iter().map(|p| self.distance(p, cand)).sum();
                let key = (max_dist, dist_to_centroid, cand);
                if best.as_ref().map_or(true, |b| key < *b) {
                    best = Some(key);
                }
            }
            let Some((_, _, chosen)) = best else { break };
            picked.push(chosen.to_string());
            remaining.retain(|&n| n != chosen);
        }

        picked
    }

    /// Re-emits the parsed topology in its own grammar. Used for tests and
    /// for `mini-slurm topology dump`.
    pub fn to_config_text(&self) -> String {
        let mut out = String::new();
        let mut names: Vec<&String> = self.switches.keys().collect();
        names.sort();
        for name in names {
            let sw = &self.switches[name];
            if !sw.nodes.is_empty() {
                let _ = writeln!(
                    out,
                    "SwitchName={} Nodes={}",
                    sw.name,
                    sw.nodes.join(",")
                );
            }
            if !sw.child_switches.is_empty() {
                let _ = writeln!(
                    out,
                    "SwitchName={} Switches={}",
                    sw.name,
                    sw.child_switches.join(",")
                );
            }
        }
        out
    }
}

/// Expands `node[1-4]`, `node[1,3,5]`, and bare comma lists into individual
/// node names.
fn expand_node_list(spec: &str, line_no: usize) -> Result<Vec<String>, SchedulerError> {
    let mut out = Vec::new();
    for token in spec.split(',') {
        if let Some(bracket_start) = token.find('[') {
            let prefix = &token[..bracket_start];
            let rest = token[bracket_start + 1..].trim_end_matches(']');
            if !token.ends_with(']') {
                return Err(SchedulerError::TopologyParse {
                    line: line_no,
                    message: format!("unterminated range in {:?}", token),
                });
            }
            for part in rest.split(',') {
                if let Some((lo, hi)) = part.split_once('-') {
                    let lo: u32 = lo.parse().map_err(|_| SchedulerError::TopologyParse {
                        line: line_no,
                        message: format!("bad range start in {:?}", token),
                    })?;
                    let hi: u32 = hi.parse().map_err(|_| SchedulerError::TopologyParse {
                        line: line_no,
                        message: format!("bad range end in {:?}", token),
                    })?;
                    if lo > hi {
                        return Err(SchedulerError::TopologyParse {
                            line: line_no,
                            message: format!("descending range in {:?}", token),
                        });
                    }
                    for i in lo..=hi {
                        out.push(format!("{prefix}{i}"));
                    }
                } else {
                    let i: u32 = part.parse().map_err(|_| SchedulerError::TopologyParse {
                        line: line_no,
                        message: format!("bad index in {:?}", token),
                    })?;
                    out.push(format!("{prefix}{i}"));
                }
            }
        } else if !token.is_empty() {
            out.push(token.to_string());
        }
    }
    Ok(out)
}
