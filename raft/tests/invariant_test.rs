use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use raftsim_raft::{LogEntry, Mode, NodeId, SimConfig, Simulation, Term};

/// Safety properties checked after every tick while random faults are
/// injected.

const SEEDS: u64 = 24;
const TICKS: usize = 1500;

/// Applies one random operator action. Rejections are expected and ignored.
/// Log truncation is an operator override of replication, so it is only
/// mixed in when `truncate` is set.
fn random_fault(sim: &mut Simulation, rng: &mut StdRng, round: usize, truncate: bool) {
    let node_count = sim.config().node_count;
    let id: NodeId = rng.gen_range(1..=node_count);
    let action = if truncate {
        rng.gen_range(0..10)
    } else {
        rng.gen_range(0..9)
    };
    let _ = match action {
        0 => sim.crash(id),
        1 | 2 => sim.recover(id),
        3 => sim.partition(id),
        4 => sim.heal(id),
        5 => sim.force_timeout(id),
        6 => sim.set_loss_probability(Some(id), rng.gen_range(0.0..0.5)),
        7 => sim.set_loss_probability(None, rng.gen_range(0.0..0.2)),
        9 => sim.drop_latest_log(id).map(|_| ()),
        _ => sim.client_command(format!("cmd-{round}"), None).map(|_| ()),
    };
}

#[derive(Default)]
struct History {
    ledger: Vec<LogEntry>,
    terms: BTreeMap<NodeId, Term>,
    /// Leaders seen so far, by (term, id)
    leaders: BTreeSet<(Term, NodeId)>,
    /// Also check log matching and leader completeness
    strict: bool,
}

impl History {
    fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

impl History {
    fn check(&mut self, sim: &Simulation, seed: u64, tick: usize) {
        if sim.mode() == Mode::Static {
            // A reset starts a fresh cluster.
            *self = History {
                strict: self.strict,
                ..History::default()
            };
            return;
        }

        // Election safety
        let mut leaders: BTreeMap<Term, NodeId> = BTreeMap::new();
        for node in sim.nodes().filter(|n| n.is_alive() && n.is_leader()) {
            if let Some(other) = leaders.insert(node.term(), node.id()) {
                panic!(
                    "seed {seed} tick {tick}: nodes {other} and {} both lead term {}",
                    node.id(),
                    node.term()
                );
            }
        }
        assert!(
            sim.nodes().filter(|n| n.is_crashed()).all(|n| !n.is_leader()),
            "seed {seed} tick {tick}: crashed leader"
        );

        // Commit monotonicity
        let ledger = sim.ledger().entries();
        assert!(
            ledger.starts_with(&self.ledger),
            "seed {seed} tick {tick}: ledger rewritten"
        );
        self.ledger = ledger.to_vec();
        assert_eq!(sim.snapshot().committed, self.ledger);

        // Terms never go backwards
        for node in sim.nodes() {
            let seen = self.terms.entry(node.id()).or_insert(node.term());
            assert!(
                node.term() >= *seen,
                "seed {seed} tick {tick}: node {} term went from {} to {}",
                node.id(),
                *seen,
                node.term()
            );
            *seen = node.term();

            assert!(node.commit_idx() <= node.last_log_idx());
            assert!(node.last_applied() <= node.commit_idx());
        }

        if self.strict {
            self.check_log_matching(sim, seed, tick);
            self.check_leader_completeness(sim, seed, tick);
        }
    }

    /// Two logs that agree on the term at some index agree on everything
    /// up to it.
    fn check_log_matching(&self, sim: &Simulation, seed: u64, tick: usize) {
        let nodes: Vec<_> = sim.nodes().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let (la, lb) = (a.entries(), b.entries());
                let shared = la.len().min(lb.len());
                // Matching at the highest such index covers every lower one.
                let Some(idx) = (0..shared).rev().find(|&k| la[k].term == lb[k].term) else {
                    continue;
                };
                assert_eq!(
                    la[..=idx],
                    lb[..=idx],
                    "seed {seed} tick {tick}: nodes {} and {} share term {} at index {} \
                     but not the entries before it",
                    a.id(),
                    b.id(),
                    la[idx].term,
                    idx + 1
                );
            }
        }
    }

    /// A leader holds every committed entry from the moment it is installed.
    fn check_leader_completeness(&mut self, sim: &Simulation, seed: u64, tick: usize) {
        for leader in sim.nodes().filter(|n| n.is_alive() && n.is_leader()) {
            if self.leaders.insert((leader.term(), leader.id())) {
                assert!(
                    sim.ledger().is_prefix_of(leader),
                    "seed {seed} tick {tick}: node {} leads term {} without the committed ledger",
                    leader.id(),
                    leader.term()
                );
            }
        }
    }
}

fn run_random_faults(seed: u64, truncate: bool, mut history: History) {
    let mut sim = Simulation::new(SimConfig::with_seed(seed)).unwrap();
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    for tick in 0..TICKS {
        if rng.gen_bool(0.05) {
            random_fault(&mut sim, &mut rng, tick, truncate);
        }
        sim.tick();
        history.check(&sim, seed, tick);
    }
}

#[test]
fn safety_holds_under_random_faults() {
    for seed in 0..SEEDS {
        run_random_faults(seed, true, History::default());
    }
}

#[test]
fn logs_match_and_leaders_are_complete() {
    for seed in 0..SEEDS {
        run_random_faults(seed, false, History::strict());
    }
}

#[test]
fn committed_entries_survive_follower_churn() {
    for seed in 0..8 {
        let mut sim = Simulation::new(SimConfig::with_seed(seed)).unwrap();
        sim.force_timeout(1).unwrap();
        let mut history = History::strict();
        for tick in 0..1200 {
            // Keep at most one follower down so a majority stays up.
            match tick % 200 {
                20 => {
                    let _ = sim.client_command(format!("w{tick}"), None);
                }
                60 => {
                    let _ = sim.crash(2 + (tick / 200) % 4);
                }
                140 => {
                    let _ = sim.recover(2 + (tick / 200) % 4);
                }
                _ => {}
            }
            sim.tick();
            history.check(&sim, seed, tick);
        }
        assert_ne!(sim.mode(), Mode::Static);
        assert!(!sim.ledger().is_empty(), "seed {seed}: nothing committed");
    }
}

#[test]
fn same_seed_same_run() {
    let run = |seed: u64| {
        let mut sim = Simulation::new(SimConfig::with_seed(seed)).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let mut snapshots = Vec::new();
        for tick in 0..600 {
            if rng.gen_bool(0.05) {
                random_fault(&mut sim, &mut rng, tick, true);
            }
            snapshots.push(sim.tick());
        }
        snapshots
    };
    assert_eq!(run(42), run(42));
}
