//! Work scheduler.
//!
//! Each pass picks a maximal set of (agent, item) pairs such that no two
//! selected items share a file path, every dependency is satisfied, and
//! each agent covers its item's tier. That is a maximum independent set
//! on the path-conflict graph; the pass runs a deterministic greedy
//! selection and, for small eligible sets, a deadline-bounded exact
//! search that can only improve the priority sum.
//!
//! The pass itself is pure: it reads a snapshot and returns assignments.
//! The hub performs the store claim and lease acquisition, undoing both
//! on any partial failure.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use mergeflow_types::{AgentInfo, ColdState, Priority, Tier, WorkItem};

use crate::graph::DependencyGraph;
use crate::leases::PairingTable;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Every K-th pass selects by plan age instead of priority so
    /// low-priority items cannot starve. 0 disables.
    pub aging_interval: u64,
    /// Exact refinement only runs when the eligible set is at most this
    /// large.
    pub exact_search_limit: usize,
    /// Wall-clock budget for the exact refinement. Zero disables it,
    /// which also makes passes fully deterministic.
    pub exact_search_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aging_interval: 8,
            exact_search_limit: 64,
            exact_search_timeout: Duration::from_millis(25),
        }
    }
}

impl SchedulerConfig {
    /// Greedy-only configuration; identical inputs give identical passes.
    pub fn deterministic() -> Self {
        Self {
            exact_search_timeout: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Immutable view of the world for one pass.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSnapshot {
    /// Plan order matters: position is the item's age.
    pub items: Vec<WorkItem>,
    pub agents: Vec<AgentInfo>,
    /// Paths currently under lease by running work.
    pub held_paths: HashSet<String>,
}

/// One dispatch decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub agent_id: String,
    pub pr_id: String,
    /// Cold state the claim must CAS away from (ready or broken).
    pub claim_from: ColdState,
    /// Pair-expanded paths to lease, in canonical order.
    pub paths: Vec<String>,
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct SchedulePass {
    pub pass_index: u64,
    pub assignments: Vec<Assignment>,
    /// Dependency cycles found this pass; members were excluded.
    pub cycles: Vec<Vec<String>>,
    /// Selected items that found no fitting agent.
    pub skipped_no_agent: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    broken: u8,
    key: RankKey,
    id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum RankKey {
    /// (priority class, complexity score, off-critical-path)
    Priority(Priority, u8, u8),
    /// Plan position, for aging passes.
    Age(usize),
}

/// The MIS-based work scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    pairings: PairingTable,
    reverse_pairings: HashMap<String, String>,
    passes: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, pairings: PairingTable) -> Self {
        let reverse_pairings = pairings
            .iter()
            .map(|(s, t)| (t.clone(), s.clone()))
            .collect();
        Self {
            config,
            pairings,
            reverse_pairings,
            passes: 0,
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn expand_item_paths(&self, item: &WorkItem) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        for file in &item.estimated_files {
            paths.insert(file.path.clone());
            if let Some(test) = self.pairings.get(&file.path) {
                paths.insert(test.clone());
            }
            if let Some(source) = self.reverse_pairings.get(&file.path) {
                paths.insert(source.clone());
            }
        }
        paths
    }

    /// Run one pass over the snapshot.
    pub fn plan_pass(&mut self, snapshot: &SchedulerSnapshot) -> SchedulePass {
        let pass_index = self.passes;
        self.passes += 1;

        let graph = DependencyGraph::build(&snapshot.items);
        if graph.has_cycles() {
            tracing::error!(cycles = ?graph.cycles(), "dependency cycles in plan");
        }

        let cold_of: HashMap<String, ColdState> = snapshot
            .items
            .iter()
            .map(|i| (i.id.clone(), i.cold_state))
            .collect();
        let position: HashMap<&str, usize> = snapshot
            .items
            .iter()
            .enumerate()
            .map(|(idx, i)| (i.id.as_str(), idx))
            .collect();

        let aging_pass = self.config.aging_interval > 0
            && (pass_index + 1) % self.config.aging_interval == 0;

        // Eligible set: schedulable, acyclic, satisfied dependencies, and
        // not blocked by an existing lease. A broken item skips no
        // dependency check; fixing it never un-completes its parents.
        let mut eligible: Vec<&WorkItem> = Vec::new();
        let mut item_paths: HashMap<&str, BTreeSet<String>> = HashMap::new();
        for item in &snapshot.items {
            if !item.cold_state.is_schedulable()
                || graph.in_cycle(&item.id)
                || !graph.deps_satisfied(item, &cold_of)
            {
                continue;
            }
            let paths = self.expand_item_paths(item);
            if paths.iter().any(|p| snapshot.held_paths.contains(p)) {
                continue;
            }
            item_paths.insert(item.id.as_str(), paths);
            eligible.push(item);
        }

        // Conflict adjacency via an inverted path index.
        let mut by_path: HashMap<&str, Vec<&str>> = HashMap::new();
        for item in &eligible {
            for path in &item_paths[item.id.as_str()] {
                by_path
                    .entry(path.as_str())
                    .or_default()
                    .push(item.id.as_str());
            }
        }
        let mut neighbors: HashMap<&str, HashSet<&str>> = HashMap::new();
        for owners in by_path.values() {
            for &a in owners {
                for &b in owners {
                    if a != b {
                        neighbors.entry(a).or_default().insert(b);
                    }
                }
            }
        }

        let mut ranked: Vec<(Rank, &WorkItem)> = eligible
            .iter()
            .map(|item| {
                let key = if aging_pass {
                    RankKey::Age(*position.get(item.id.as_str()).unwrap_or(&usize::MAX))
                } else {
                    RankKey::Priority(
                        item.priority,
                        item.complexity.score,
                        u8::from(!graph.on_critical_path(&item.id)),
                    )
                };
                (
                    Rank {
                        broken: u8::from(item.cold_state != ColdState::Broken),
                        key,
                        id: item.id.clone(),
                    },
                    *item,
                )
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));

        // Greedy maximal selection in rank order.
        let mut selected: Vec<&WorkItem> = Vec::new();
        let mut selected_ids: HashSet<&str> = HashSet::new();
        for (_, item) in &ranked {
            let conflicted = neighbors
                .get(item.id.as_str())
                .map(|ns| ns.iter().any(|n| selected_ids.contains(n)))
                .unwrap_or(false);
            if !conflicted {
                selected.push(*item);
                selected_ids.insert(item.id.as_str());
            }
        }

        // Bounded exact refinement for small sets; only replaces the
        // greedy pick when it strictly improves the priority sum.
        if !aging_pass
            && selected.len() > 1
            && ranked.len() <= self.config.exact_search_limit
            && !self.config.exact_search_timeout.is_zero()
        {
            let order: Vec<&WorkItem> = ranked.iter().map(|(_, i)| *i).collect();
            let adjacency: Vec<HashSet<usize>> = order
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    order
                        .iter()
                        .enumerate()
                        .filter(|(other_idx, other)| {
                            *other_idx != idx
                                && neighbors
                                    .get(item.id.as_str())
                                    .map(|ns| ns.contains(other.id.as_str()))
                                    .unwrap_or(false)
                        })
                        .map(|(other_idx, _)| other_idx)
                        .collect()
                })
                .collect();
            if let Some(better) = exact_search(
                &order,
                &adjacency,
                &graph,
                self.config.exact_search_timeout,
                selection_weight(&selected, &graph),
            ) {
                tracing::debug!(
                    greedy = selected.len(),
                    exact = better.len(),
                    "exact search improved selection"
                );
                selected = better;
            }
        }

        // Agent matching: suggested tier first, then nearer-lower, then
        // higher; oldest-idle wins ties.
        let mut pool: Vec<&AgentInfo> = snapshot
            .agents
            .iter()
            .filter(|a| a.is_idle() && a.capabilities.can_implement)
            .collect();
        pool.sort_by(|a, b| a.idle_since.cmp(&b.idle_since).then(a.id.cmp(&b.id)));

        let mut pass = SchedulePass {
            pass_index,
            cycles: graph.cycles().to_vec(),
            ..SchedulePass::default()
        };

        for item in selected {
            match take_agent(&mut pool, item.complexity.suggested_tier) {
                Some(agent) => {
                    pass.assignments.push(Assignment {
                        agent_id: agent.id.clone(),
                        pr_id: item.id.clone(),
                        claim_from: item.cold_state,
                        paths: item_paths[item.id.as_str()].iter().cloned().collect(),
                    });
                }
                None => pass.skipped_no_agent.push(item.id.clone()),
            }
        }

        tracing::debug!(
            pass = pass.pass_index,
            eligible = ranked.len(),
            assigned = pass.assignments.len(),
            aging = aging_pass,
            "scheduling pass complete"
        );
        pass
    }
}

fn tier_preference(suggested: Tier) -> [Tier; 3] {
    match suggested {
        Tier::Low => [Tier::Low, Tier::Mid, Tier::High],
        Tier::Mid => [Tier::Mid, Tier::Low, Tier::High],
        Tier::High => [Tier::High, Tier::Mid, Tier::Low],
    }
}

fn take_agent<'a>(pool: &mut Vec<&'a AgentInfo>, suggested: Tier) -> Option<&'a AgentInfo> {
    for tier in tier_preference(suggested) {
        if let Some(pos) = pool.iter().position(|a| a.tier() == tier) {
            return Some(pool.remove(pos));
        }
    }
    None
}

fn item_weight(item: &WorkItem, graph: &DependencyGraph) -> u64 {
    let mut weight = if item.cold_state == ColdState::Broken {
        10_000
    } else {
        match item.priority {
            Priority::Critical => 4_000,
            Priority::High => 3_000,
            Priority::Medium => 2_000,
            Priority::Low => 1_000,
        }
    };
    if graph.on_critical_path(&item.id) {
        weight += 500;
    }
    weight + u64::from(10u8.saturating_sub(item.complexity.score))
}

fn selection_weight(selection: &[&WorkItem], graph: &DependencyGraph) -> u64 {
    selection.iter().map(|i| item_weight(i, graph)).sum()
}

/// Branch-and-bound over the ranked item order. Returns a selection only
/// when its weight strictly beats `greedy_weight` within the deadline.
fn exact_search<'a>(
    order: &[&'a WorkItem],
    adjacency: &[HashSet<usize>],
    graph: &DependencyGraph,
    budget: Duration,
    greedy_weight: u64,
) -> Option<Vec<&'a WorkItem>> {
    let deadline = Instant::now() + budget;
    let weights: Vec<u64> = order.iter().map(|i| item_weight(i, graph)).collect();

    // Suffix sums for the bound.
    let mut suffix = vec![0u64; order.len() + 1];
    for idx in (0..order.len()).rev() {
        suffix[idx] = suffix[idx + 1] + weights[idx];
    }

    struct Search<'s> {
        weights: &'s [u64],
        suffix: &'s [u64],
        adjacency: &'s [HashSet<usize>],
        deadline: Instant,
        best_weight: u64,
        best: Option<Vec<usize>>,
        expired: bool,
    }

    impl Search<'_> {
        fn visit(&mut self, idx: usize, chosen: &mut Vec<usize>, weight: u64) {
            if self.expired {
                return;
            }
            if Instant::now() >= self.deadline {
                self.expired = true;
                return;
            }
            if idx == self.weights.len() {
                if weight > self.best_weight {
                    self.best_weight = weight;
                    self.best = Some(chosen.clone());
                }
                return;
            }
            if weight + self.suffix[idx] <= self.best_weight {
                return;
            }

            let conflicted = chosen.iter().any(|&c| self.adjacency[idx].contains(&c));
            if !conflicted {
                chosen.push(idx);
                self.visit(idx + 1, chosen, weight + self.weights[idx]);
                chosen.pop();
            }
            self.visit(idx + 1, chosen, weight);
        }
    }

    let mut search = Search {
        weights: &weights,
        suffix: &suffix,
        adjacency,
        deadline,
        best_weight: greedy_weight,
        best: None,
        expired: false,
    };
    let mut chosen = Vec::new();
    search.visit(0, &mut chosen, 0);

    if search.expired {
        // Partial exploration is not trustworthy; keep the greedy pick.
        return None;
    }
    search
        .best
        .map(|ids| ids.into_iter().map(|i| order[i]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mergeflow_types::{AgentType, Complexity, FileAction, PlannedFile};

    fn item(id: &str, files: &[&str]) -> WorkItem {
        WorkItem::new(id, id).with_state(ColdState::Ready).with_files(
            files
                .iter()
                .map(|f| PlannedFile::new(*f, FileAction::Modify))
                .collect(),
        )
    }

    fn worker(id: &str, tier: Tier, idle_for_secs: i64) -> AgentInfo {
        let now = Utc::now();
        let mut agent = AgentInfo::new(id, AgentType::Worker, tier, now);
        agent.idle_since = now - chrono::Duration::seconds(idle_for_secs);
        agent
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::deterministic(), PairingTable::new())
    }

    #[test]
    fn test_disjoint_items_both_assigned() {
        let snapshot = SchedulerSnapshot {
            items: vec![item("A", &["x.txt", "y.txt"]), item("B", &["z.txt"])],
            agents: vec![worker("w1", Tier::Low, 20), worker("w2", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };

        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.assignments.len(), 2);

        // A ranks first (id tie-break) and takes the longest-idle agent.
        assert_eq!(pass.assignments[0].pr_id, "A");
        assert_eq!(pass.assignments[0].agent_id, "w1");
        assert_eq!(
            pass.assignments[0].paths,
            vec!["x.txt".to_string(), "y.txt".to_string()]
        );
        assert_eq!(pass.assignments[1].pr_id, "B");
        assert_eq!(pass.assignments[1].agent_id, "w2");
    }

    #[test]
    fn test_conflicting_items_pick_higher_rank() {
        let mut a = item("A", &["x.txt", "y.txt"]);
        a.complexity = Complexity {
            score: 2,
            ..Complexity::default()
        };
        let mut c = item("C", &["y.txt"]);
        c.complexity = Complexity {
            score: 5,
            ..Complexity::default()
        };

        let snapshot = SchedulerSnapshot {
            items: vec![a, c],
            agents: vec![worker("w1", Tier::Low, 20), worker("w2", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };

        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.assignments.len(), 1);
        assert_eq!(pass.assignments[0].pr_id, "A");
    }

    #[test]
    fn test_dependencies_gate_scheduling() {
        let a = item("A", &["a.txt"]);
        let b = item("B", &["b.txt"]).with_dependencies(vec!["A".to_string()]);
        let c = item("C", &["c.txt"]).with_dependencies(vec!["A".to_string()]);

        let agents = vec![
            worker("w1", Tier::Low, 30),
            worker("w2", Tier::Low, 20),
            worker("w3", Tier::Low, 10),
        ];

        // Pass 1: only A is eligible.
        let snapshot = SchedulerSnapshot {
            items: vec![a.clone(), b.clone(), c.clone()],
            agents: agents.clone(),
            held_paths: HashSet::new(),
        };
        let mut sched = scheduler();
        let pass = sched.plan_pass(&snapshot);
        assert_eq!(pass.assignments.len(), 1);
        assert_eq!(pass.assignments[0].pr_id, "A");

        // Pass 2 after A completes: B and C are file-disjoint, both go.
        let snapshot = SchedulerSnapshot {
            items: vec![a.with_state(ColdState::Completed), b, c],
            agents,
            held_paths: HashSet::new(),
        };
        let pass = sched.plan_pass(&snapshot);
        let mut ids: Vec<_> = pass.assignments.iter().map(|a| a.pr_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_cycle_members_excluded_others_scheduled() {
        let a = item("A", &["a.txt"]).with_dependencies(vec!["B".to_string()]);
        let b = item("B", &["b.txt"]).with_dependencies(vec!["A".to_string()]);
        let c = item("C", &["c.txt"]);

        let snapshot = SchedulerSnapshot {
            items: vec![a, b, c],
            agents: vec![worker("w1", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };

        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.cycles, vec![vec!["A".to_string(), "B".to_string()]]);
        assert_eq!(pass.assignments.len(), 1);
        assert_eq!(pass.assignments[0].pr_id, "C");
    }

    #[test]
    fn test_broken_outranks_critical_but_needs_deps() {
        let mut fix = item("FIX", &["x.txt"]).with_state(ColdState::Broken);
        fix.priority = Priority::Low;
        let mut urgent = item("URGENT", &["x.txt"]);
        urgent.priority = Priority::Critical;

        let snapshot = SchedulerSnapshot {
            items: vec![urgent, fix],
            agents: vec![worker("w1", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.assignments[0].pr_id, "FIX");
        assert_eq!(pass.assignments[0].claim_from, ColdState::Broken);

        // A broken item with an unmet dependency stays out.
        let blocked_fix = item("FIX2", &["y.txt"])
            .with_state(ColdState::Broken)
            .with_dependencies(vec!["PENDING".to_string()]);
        let pending = item("PENDING", &["p.txt"]).with_state(ColdState::InProgress);
        let snapshot = SchedulerSnapshot {
            items: vec![blocked_fix, pending],
            agents: vec![worker("w1", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert!(pass.assignments.is_empty());
    }

    #[test]
    fn test_held_paths_exclude_item_without_blocking_neighbors() {
        // A holds x.txt via an active lease; B conflicts with A but is
        // free to run because A is not selectable.
        let a = item("A", &["x.txt"]);
        let b = item("B", &["x.txt", "y.txt"]);

        let snapshot = SchedulerSnapshot {
            items: vec![a, b],
            agents: vec![worker("w1", Tier::Low, 10)],
            held_paths: HashSet::from(["x.txt".to_string()]),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert!(pass.assignments.is_empty());

        // Only y.txt leased: A runs.
        let snapshot = SchedulerSnapshot {
            items: vec![item("A", &["x.txt"]), item("B", &["x.txt", "y.txt"])],
            agents: vec![worker("w1", Tier::Low, 10)],
            held_paths: HashSet::from(["y.txt".to_string()]),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.assignments.len(), 1);
        assert_eq!(pass.assignments[0].pr_id, "A");
    }

    #[test]
    fn test_tier_fallback_down_then_up() {
        let mut mid_item = item("M", &["m.txt"]);
        mid_item.complexity.suggested_tier = Tier::Mid;

        // No mid agent: falls to low before high.
        let snapshot = SchedulerSnapshot {
            items: vec![mid_item.clone()],
            agents: vec![worker("w-high", Tier::High, 10), worker("w-low", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.assignments[0].agent_id, "w-low");

        // Only high available: still assigned.
        let snapshot = SchedulerSnapshot {
            items: vec![mid_item],
            agents: vec![worker("w-high", Tier::High, 10)],
            held_paths: HashSet::new(),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert_eq!(pass.assignments[0].agent_id, "w-high");
    }

    #[test]
    fn test_no_agent_skips_item() {
        let snapshot = SchedulerSnapshot {
            items: vec![item("A", &["a.txt"])],
            agents: Vec::new(),
            held_paths: HashSet::new(),
        };
        let pass = scheduler().plan_pass(&snapshot);
        assert!(pass.assignments.is_empty());
        assert_eq!(pass.skipped_no_agent, vec!["A".to_string()]);
    }

    #[test]
    fn test_empty_plan_is_quiet() {
        let pass = scheduler().plan_pass(&SchedulerSnapshot::default());
        assert!(pass.assignments.is_empty());
        assert!(pass.cycles.is_empty());
    }

    #[test]
    fn test_aging_pass_selects_by_plan_position() {
        let mut old_low = item("OLD", &["shared.txt"]);
        old_low.priority = Priority::Low;
        let mut new_critical = item("NEW", &["shared.txt"]);
        new_critical.priority = Priority::Critical;

        let snapshot = SchedulerSnapshot {
            items: vec![old_low, new_critical],
            agents: vec![worker("w1", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };

        // aging_interval = 1 makes every pass an aging pass.
        let mut sched = Scheduler::new(
            SchedulerConfig {
                aging_interval: 1,
                ..SchedulerConfig::deterministic()
            },
            PairingTable::new(),
        );
        let pass = sched.plan_pass(&snapshot);
        assert_eq!(pass.assignments[0].pr_id, "OLD");

        // On a normal pass the critical item wins.
        let mut sched = scheduler();
        let pass = sched.plan_pass(&snapshot);
        assert_eq!(pass.assignments[0].pr_id, "NEW");
    }

    #[test]
    fn test_pairing_expands_conflicts() {
        let pairings = PairingTable::from([(
            "src/parse.rs".to_string(),
            "tests/parse.rs".to_string(),
        )]);
        let mut sched = Scheduler::new(SchedulerConfig::deterministic(), pairings);

        // A touches the source, B touches the test: they conflict through
        // the pairing even though the raw path sets are disjoint.
        let snapshot = SchedulerSnapshot {
            items: vec![item("A", &["src/parse.rs"]), item("B", &["tests/parse.rs"])],
            agents: vec![worker("w1", Tier::Low, 20), worker("w2", Tier::Low, 10)],
            held_paths: HashSet::new(),
        };
        let pass = sched.plan_pass(&snapshot);
        assert_eq!(pass.assignments.len(), 1);
        assert_eq!(pass.assignments[0].pr_id, "A");
        assert_eq!(
            pass.assignments[0].paths,
            vec!["src/parse.rs".to_string(), "tests/parse.rs".to_string()]
        );
    }

    #[test]
    fn test_exact_search_beats_greedy_star() {
        // CENTER conflicts with both leaves; greedy takes CENTER
        // (critical beats high), the exact pass takes both leaves.
        let mut center = item("CENTER", &["l.txt", "r.txt"]);
        center.priority = Priority::Critical;
        let mut left = item("LEFT", &["l.txt"]);
        left.priority = Priority::High;
        let mut right = item("RIGHT", &["r.txt"]);
        right.priority = Priority::High;

        let snapshot = SchedulerSnapshot {
            items: vec![center, left, right],
            agents: vec![worker("w1", Tier::Low, 30), worker("w2", Tier::Low, 20)],
            held_paths: HashSet::new(),
        };

        let mut greedy_only = scheduler();
        let pass = greedy_only.plan_pass(&snapshot);
        assert_eq!(pass.assignments.len(), 1);
        assert_eq!(pass.assignments[0].pr_id, "CENTER");

        let mut with_exact = Scheduler::new(
            SchedulerConfig {
                exact_search_timeout: Duration::from_millis(250),
                ..SchedulerConfig::default()
            },
            PairingTable::new(),
        );
        let pass = with_exact.plan_pass(&snapshot);
        let mut ids: Vec<_> = pass.assignments.iter().map(|a| a.pr_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["LEFT".to_string(), "RIGHT".to_string()]);
    }
}
