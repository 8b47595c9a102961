use raftsim_raft::msg::{MsgKind, NodeStatus};
use raftsim_raft::{LogEntry, Mode, NodeId, Role, SimConfig, SimError, Simulation};

/// Cluster-wide scenarios driven tick by tick on the logical clock.

fn sim(seed: u64) -> Simulation {
    Simulation::new(SimConfig::with_seed(seed)).unwrap()
}

/// Ticks until `pred` holds, failing after `max_ticks`.
fn tick_until(sim: &mut Simulation, max_ticks: usize, pred: impl Fn(&Simulation) -> bool) {
    for _ in 0..max_ticks {
        if pred(sim) {
            return;
        }
        sim.tick();
    }
    assert!(pred(sim), "condition not reached in {max_ticks} ticks");
}

/// Node 1 stands for election from the all-follower start and wins.
fn elected(seed: u64) -> Simulation {
    let mut s = sim(seed);
    s.force_timeout(1).unwrap();
    tick_until(&mut s, 100, |s| s.current_leader().is_some());
    s
}

fn commit(s: &mut Simulation, command: &str) {
    let before = s.ledger().len();
    s.client_command(command, None).unwrap();
    tick_until(s, 200, |s| s.ledger().len() > before);
}

#[test]
fn single_candidate_wins_with_all_votes() {
    let mut s = sim(1);
    assert_eq!(s.mode(), Mode::Static);
    s.force_timeout(1).unwrap();
    assert_eq!(s.node(1).unwrap().role(), Role::Candidate);
    assert_eq!(s.node(1).unwrap().term(), 2);
    assert_eq!(s.node(1).unwrap().votes(), 1);

    tick_until(&mut s, 100, |s| s.current_leader().is_some());
    assert_eq!(s.current_leader(), Some(1));
    assert_eq!(s.mode(), Mode::Dynamic);
    for node in s.nodes() {
        assert_eq!(node.term(), 2);
        assert_eq!(node.voted_for(), Some(1));
    }
    assert!(s.ledger().is_empty());

    // Heartbeats keep the leader in place.
    for _ in 0..150 {
        s.tick();
    }
    assert_eq!(s.current_leader(), Some(1));
    assert!(s.nodes().all(|n| n.term() == 2));
    assert_eq!(s.snapshot().leaders().len(), 1);
}

#[test]
fn command_commits_once_replicated() {
    let mut s = elected(2);
    let idx = s.client_command("x=1", None).unwrap();
    assert_eq!(idx, 1);
    assert!(s.ledger().is_empty());

    tick_until(&mut s, 100, |s| s.ledger().len() == 1);
    assert_eq!(s.ledger().entries(), &[LogEntry::new(2, "x=1")]);

    // Every follower ends up with the entry.
    tick_until(&mut s, 100, |s| s.nodes().all(|n| n.entries().len() == 1));
    tick_until(&mut s, 100, |s| s.node(1).unwrap().commit_idx() == 1);
    assert_eq!(s.node(1).unwrap().entries(), s.node(3).unwrap().entries());
    tick_until(&mut s, 100, |s| {
        (2..=5).all(|peer| s.node(1).unwrap().match_idx(peer) == Some(1))
    });
    assert_eq!(s.node(1).unwrap().votes(), 0);
    assert_eq!(s.node(2).unwrap().match_idx(1), None);
}

#[test]
fn leader_crash_preserves_ledger() {
    let mut s = elected(3);
    commit(&mut s, "x=1");
    commit(&mut s, "y=2");
    tick_until(&mut s, 100, |s| s.nodes().all(|n| n.entries().len() == 2));
    let ledger = s.ledger().entries().to_vec();
    let leader_log = s.node(1).unwrap().entries().to_vec();

    s.crash(1).unwrap();
    assert_eq!(s.mode(), Mode::Election);
    assert!(s.node(1).unwrap().is_crashed());

    tick_until(&mut s, 200, |s| s.current_leader().is_some());
    let new_leader = s.current_leader().unwrap();
    assert_ne!(new_leader, 1);
    assert_eq!(s.mode(), Mode::Dynamic);
    assert_eq!(s.node(new_leader).unwrap().entries(), leader_log.as_slice());
    assert!(s.node(new_leader).unwrap().term() > 2);
    assert_eq!(s.ledger().entries(), ledger.as_slice());

    // The new leader keeps extending the same ledger.
    commit(&mut s, "z=3");
    assert_eq!(&s.ledger().entries()[..2], ledger.as_slice());
}

#[test]
fn too_few_live_nodes_resets() {
    let mut s = elected(4);
    s.crash(2).unwrap();
    s.crash(3).unwrap();
    s.crash(4).unwrap();
    assert_eq!(s.alive_count(), 2);

    let snapshot = s.tick();
    assert_eq!(snapshot.mode, Mode::Static);
    assert_eq!(snapshot.step, 0);
    assert!(snapshot.committed.is_empty());
    let alert = snapshot.alert.expect("reset leaves an alert");
    assert!(alert.contains("Only 2 of 5"));
    assert_eq!(s.nodes().count(), 0);

    // Any later live operation clears the alert.
    s.force_timeout(1).unwrap();
    assert!(s.alert().is_none());
}

#[test]
fn lossy_leader_never_reaches_followers() {
    let mut s = elected(5);
    s.set_loss_probability(Some(1), 1.0).unwrap();
    assert_eq!(s.node(1).unwrap().loss_pct(), 1.0);
    s.client_command("lost", None).unwrap();

    let mut seen = 0;
    for _ in 0..40 {
        let snapshot = s.tick();
        for m in s.in_flight().iter().filter(|m| m.from == 1) {
            if m.kind() == MsgKind::AppendEntries {
                assert!(m.dropped);
                seen += 1;
            }
        }
        assert!(snapshot
            .messages
            .iter()
            .filter(|m| m.from_id == 1 && m.kind == MsgKind::AppendEntries)
            .all(|m| m.dropped));
        for id in 2..=5 {
            assert!(s.node(id).unwrap().entries().is_empty());
        }
    }
    assert!(seen > 0);
    assert!(s.ledger().is_empty());
}

#[test]
fn lossy_leader_is_replaced_by_timeouts() {
    let mut s = elected(6);
    s.set_loss_probability(Some(1), 1.0).unwrap();
    tick_until(&mut s, 400, |s| s.current_leader().is_some_and(|l| l != 1));
    assert!(!s.node(1).unwrap().is_leader());
    assert!(s.node(s.current_leader().unwrap()).unwrap().term() > 2);
}

#[test]
fn partitioned_leader_steps_down_after_heal() {
    let mut s = elected(7);
    commit(&mut s, "a");
    s.partition(1).unwrap();
    assert_eq!(s.node(1).unwrap().status(), NodeStatus::Partitioned);
    // Still alive for quorum purposes.
    assert_eq!(s.alive_count(), 5);

    tick_until(&mut s, 400, |s| {
        s.nodes()
            .any(|n| n.id() != 1 && n.is_leader() && n.term() > 2)
    });
    // Cut off, the old leader never hears of the new term.
    let old = s.node(1).unwrap();
    assert!(old.is_leader());
    assert_eq!(old.term(), 2);

    s.heal(1).unwrap();
    tick_until(&mut s, 200, |s| !s.node(1).unwrap().is_leader());
    assert!(s.node(1).unwrap().term() > 2);
    tick_until(&mut s, 400, |s| s.current_leader().is_some());
    assert_eq!(s.snapshot().leaders().len(), 1);
    assert_eq!(s.ledger().entries()[0], LogEntry::new(2, "a"));
}

#[test]
fn healed_follower_catches_up() {
    let mut s = elected(8);
    s.partition(5).unwrap();
    for cmd in ["a", "b", "c"] {
        commit(&mut s, cmd);
    }
    assert!(s.node(5).unwrap().entries().is_empty());

    s.heal(5).unwrap();
    tick_until(&mut s, 800, |s| {
        s.node(5).unwrap().entries() == s.ledger().entries()
    });
    let commands: Vec<_> = s.ledger().entries().iter().map(|e| e.command.as_str()).collect();
    assert_eq!(commands, ["a", "b", "c"]);
}

#[test]
fn recovered_node_rejoins_as_follower() {
    let mut s = elected(9);
    commit(&mut s, "a");
    s.crash(3).unwrap();
    // A follower crash does not disturb the leader.
    assert_eq!(s.mode(), Mode::Dynamic);
    commit(&mut s, "b");

    s.recover(3).unwrap();
    let node = s.node(3).unwrap();
    assert_eq!(node.role(), Role::Follower);
    assert!(node.is_alive());
    tick_until(&mut s, 400, |s| s.node(3).unwrap().entries().len() == 2);
    assert_eq!(s.node(3).unwrap().entries(), s.ledger().entries());
}

#[test]
fn forced_timeout_takes_over() {
    let mut s = elected(10);
    commit(&mut s, "a");
    tick_until(&mut s, 100, |s| s.nodes().all(|n| n.entries().len() == 1));

    s.force_timeout(2).unwrap();
    let candidate = s.node(2).unwrap();
    assert_eq!(candidate.role(), Role::Candidate);
    assert_eq!(candidate.term(), 3);

    tick_until(&mut s, 100, |s| s.current_leader() == Some(2));
    assert!(!s.node(1).unwrap().is_leader());
    assert_eq!(s.node(1).unwrap().term(), 3);
}

#[test]
fn client_command_is_redirected_to_leader() {
    let mut s = elected(11);
    let idx = s.client_command("via-follower", Some(4)).unwrap();
    assert_eq!(idx, 1);
    assert_eq!(s.node(1).unwrap().entries()[0].command, "via-follower");
    assert!(s.node(4).unwrap().entries().is_empty());
}

#[test]
fn drop_latest_log_spares_committed_entries() {
    let mut s = elected(12);
    commit(&mut s, "kept");
    assert_eq!(
        s.drop_latest_log(1),
        Err(SimError::NothingToDrop { id: 1 })
    );

    s.client_command("doomed", None).unwrap();
    let dropped = s.drop_latest_log(1).unwrap();
    assert_eq!(dropped, LogEntry::new(2, "doomed"));
    assert_eq!(s.node(1).unwrap().entries(), &[LogEntry::new(2, "kept")]);
}

#[test]
fn rejected_operations_leave_state_alone() {
    let mut s = sim(13);
    assert_eq!(s.crash(9), Err(SimError::UnknownNode { id: 9 }));
    assert_eq!(s.mode(), Mode::Static);
    assert_eq!(s.nodes().count(), 0);

    // Rejections during playback keep the playback frame.
    let before = s.snapshot();
    assert_eq!(s.client_command("x", None), Err(SimError::NoLeader));
    assert_eq!(s.drop_latest_log(2), Err(SimError::NothingToDrop { id: 2 }));
    assert_eq!(s.snapshot(), before);
    assert_eq!(s.nodes().count(), 0);
    assert!(s.drain_events().is_empty());

    // At the frame where node 1 leads, it is not a follower.
    s.advance_step();
    s.advance_step();
    let before = s.snapshot();
    assert_eq!(
        s.force_timeout(1),
        Err(SimError::NotFollower {
            id: 1,
            role: Role::Leader
        })
    );
    assert_eq!(s.snapshot(), before);
    assert_eq!(s.mode(), Mode::Static);

    // An accepted call from the same frame does go live.
    assert_eq!(s.client_command("x", None), Ok(1));
    assert_eq!(s.mode(), Mode::Dynamic);

    let mut s = elected(14);
    assert_eq!(
        s.force_timeout(1),
        Err(SimError::NotFollower {
            id: 1,
            role: Role::Leader
        })
    );
    s.crash(2).unwrap();
    assert_eq!(s.force_timeout(2), Err(SimError::NodeUnavailable { id: 2 }));
    assert_eq!(
        s.client_command("x", Some(2)),
        Err(SimError::NodeUnavailable { id: 2 })
    );
    assert_eq!(s.node(1).unwrap().entries().len(), 0);
    // Crashing twice is harmless.
    s.crash(2).unwrap();
}

#[test]
fn loss_probability_is_clamped() {
    let mut s = sim(15);
    s.set_loss_probability(None, 1.5).unwrap();
    assert_eq!(s.drop_rate(), 1.0);
    s.set_loss_probability(None, f64::NAN).unwrap();
    assert_eq!(s.drop_rate(), 0.0);
    s.set_loss_probability(Some(3), -0.2).unwrap();
    assert_eq!(s.node(3).unwrap().loss_pct(), 0.0);
    assert_eq!(
        s.set_loss_probability(Some(0), 0.5),
        Err(SimError::UnknownNode { id: 0 })
    );
}

#[test]
fn global_drop_rate_applies_to_every_sender() {
    let mut s = elected(16);
    s.set_loss_probability(None, 1.0).unwrap();
    for _ in 0..30 {
        s.tick();
    }
    assert!(!s.in_flight().is_empty());
    assert!(s.in_flight().iter().all(|m| m.dropped));
}

#[test]
fn quorum_follows_alive_count() {
    assert_eq!(SimConfig::quorum(5), 3);
    assert_eq!(SimConfig::quorum(4), 3);
    assert_eq!(SimConfig::quorum(3), 2);
    assert_eq!(SimConfig::quorum(1), 1);

    // With one node down the remaining four still elect a leader.
    let mut s = sim(17);
    s.crash(5).unwrap();
    s.force_timeout(1).unwrap();
    tick_until(&mut s, 100, |s| s.current_leader() == Some(1));
}

#[test]
fn playback_cycles_through_frames() {
    let mut s = sim(18);
    let first = s.snapshot();
    assert!(first.nodes.iter().all(|n| n.role == Role::Follower && n.term == 1));
    assert!(first.messages.is_empty());

    let roles = |s: &Simulation| -> Vec<(NodeId, Role)> {
        s.snapshot()
            .nodes
            .iter()
            .filter(|n| n.role != Role::Follower)
            .map(|n| (n.id, n.role))
            .collect()
    };
    s.advance_step();
    assert_eq!(roles(&s), [(1, Role::Candidate)]);
    assert_eq!(s.snapshot().messages.len(), 2);
    s.advance_step();
    assert_eq!(roles(&s), [(1, Role::Leader)]);
    s.advance_step();
    assert_eq!(
        roles(&s),
        [(1, Role::Leader), (2, Role::Candidate), (4, Role::Candidate)]
    );
    s.advance_step();
    assert_eq!(roles(&s), [(4, Role::Leader)]);
    assert!(s.snapshot().nodes.iter().all(|n| n.term == 3));

    let wrapped = s.advance_step();
    assert_eq!(wrapped.step, 5);
    assert_eq!(wrapped.nodes, first.nodes);
}

#[test]
fn going_live_keeps_the_frame() {
    let mut s = sim(19);
    s.advance_step();
    s.advance_step();
    s.set_loss_probability(None, 0.0).unwrap();
    assert_eq!(s.mode(), Mode::Dynamic);
    assert_eq!(s.current_leader(), Some(1));
    assert!(s.nodes().all(|n| n.term() == 2));

    // Live mode is paced by ticks, not by the step button.
    let step = s.step();
    assert_eq!(s.advance_step().step, step);
    assert_eq!(s.tick().step, step + 1);
}

#[test]
fn reset_returns_to_playback() {
    let mut s = elected(20);
    commit(&mut s, "a");
    s.reset();
    let snapshot = s.snapshot();
    assert_eq!(snapshot.mode, Mode::Static);
    assert_eq!(snapshot.step, 0);
    assert!(snapshot.committed.is_empty());
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.drop_rate, 0.0);
    assert!(s.in_flight().is_empty());
}
