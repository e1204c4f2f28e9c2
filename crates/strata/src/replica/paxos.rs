// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-leader Paxos-like ordering.
//!
//! Three roles: the leader proposes, one acceptor decides and assigns
//! indices, every replica learns. Steady state:
//!
//! 1. client REQUEST -> leader; the leader queues the entry, tags it
//!    ACCEPT under its term and sends it to the acceptor
//! 2. the acceptor, unless the term is stale, assigns the next index and
//!    broadcasts LEARN to every replica (applying locally as well)
//! 3. replicas apply LEARNs in index order (gaps stall in a buffer);
//!    the leader releases the client response on its own LEARN
//!
//! Liveness: the leader pings the acceptor and every other replica pings
//! the leader once per timeout period (plus a per-replica randomized
//! backoff that damps election contention). A leader that suspects its
//! acceptor polls IS_LEADER confirmations and, at majority, promotes the
//! next live replica with CHANGE_ACCEPTOR and replays its last accepted
//! entry as a fresh ACCEPT under the bumped term. A replica that
//! suspects the leader collects GET_ACCEPTOR votes (one per replica per
//! term), and at majority promotes itself with CHANGE_LEADER, prepares
//! the elected acceptor and replays the last accepted entry. Request-id
//! deduplication makes both replays idempotent.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use crate::affinity::BackoffRng;
use crate::message::{Message, Tag};
use crate::replica::{Level, ReplicaBase};
use crate::transport::shm::ring::Spinner;

/// Liveness ping period in milliseconds.
const TIMEOUT_MS: u64 = 350;
/// Upper bound of the per-replica randomized backoff.
const MAX_BACKOFF_MS: u64 = 150;

pub struct PaxosReplica {
    base: ReplicaBase,

    current_leader: u8,
    current_acceptor: u8,
    current_term: u64,
    highest_proposal_seen: u64,

    /// Next index to apply locally; doubles as the next index the
    /// acceptor assigns.
    index: u64,
    proposal_index: u64,
    /// Uncommitted proposals, leader only.
    pending: VecDeque<Message>,
    /// Last entry accepted; replayed across leader/acceptor changes.
    last_entry: Option<Message>,
    /// Out-of-order LEARNs parked until the gap fills.
    learn_buffer: BTreeMap<u64, Message>,

    // liveness and election state
    leader_timeout: bool,
    acceptor_timeout: bool,
    change: bool,
    voted: bool,
    is_dead: Vec<bool>,
    num_success: u16,
    acceptor_votes: Vec<u16>,
    last_tick: Instant,
    backoff_ms: u64,
}

impl PaxosReplica {
    pub(crate) fn new(base: ReplicaBase) -> PaxosReplica {
        let n = base.spec.replicas.len();
        let mut rng = BackoffRng::new();
        PaxosReplica {
            current_leader: 0,
            current_acceptor: 1,
            current_term: 1,
            highest_proposal_seen: 0,
            index: 0,
            proposal_index: 0,
            pending: VecDeque::new(),
            last_entry: None,
            learn_buffer: BTreeMap::new(),
            leader_timeout: false,
            acceptor_timeout: false,
            change: false,
            voted: false,
            is_dead: vec![false; n],
            num_success: 0,
            acceptor_votes: vec![0; n],
            last_tick: Instant::now(),
            backoff_ms: rng.backoff_ms(MAX_BACKOFF_MS),
            base,
        }
    }

    fn id(&self) -> u8 {
        self.base.spec.id
    }

    fn is_leader(&self) -> bool {
        self.id() == self.current_leader
    }

    /// Majority of the peers (the caller's own vote is implicit).
    fn majority(&self) -> u16 {
        let n = self.base.num_replicas() as u16;
        if n % 2 == 0 {
            (n - 1) / 2 + 1
        } else {
            (n - 1) / 2
        }
    }

    fn send_to_replica(&mut self, id: u8, msg: &Message) {
        if self.is_dead[id as usize] {
            return;
        }
        self.base.forward_to(id, msg);
    }

    fn broadcast_others(&mut self, msg: &Message) {
        for id in 0..self.base.num_replicas() as u8 {
            if id != self.id() {
                self.send_to_replica(id, msg);
            }
        }
    }

    pub(crate) fn handle(&mut self, msg: Message) {
        match msg.tag() {
            Some(Tag::Setup) => self.base.handle_setup(&msg),
            Some(Tag::Request) => self.handle_request(msg),
            Some(Tag::Prepare) => self.handle_prepare(msg),
            Some(Tag::PrepareResp) => self.handle_prepare_resp(&msg),
            Some(Tag::Accept) => self.handle_accept(msg),
            Some(Tag::Learn) => self.handle_learn(msg),
            Some(Tag::Abandon) => self.handle_abandon(&msg),
            Some(Tag::IsAlive) => self.handle_is_alive(&msg),
            Some(Tag::IsAliveResp) => self.handle_is_alive_resp(&msg),
            Some(Tag::IsLeader) => self.handle_is_leader(&msg),
            Some(Tag::IsLeaderResp) => self.handle_is_leader_resp(&msg),
            Some(Tag::GetAcceptor) => self.handle_get_acceptor(&msg),
            Some(Tag::GetAcceptorResp) => self.handle_get_acceptor_resp(&msg),
            Some(Tag::ChangeLeader) => self.handle_change_leader(&msg),
            Some(Tag::ChangeAcceptor) => self.handle_change_acceptor(&msg),
            _ => self.base.violation("unexpected message", &msg),
        }
    }

    fn handle_request(&mut self, mut msg: Message) {
        if !self.is_leader() {
            let leader = self.current_leader;
            self.base.forward_to(leader, &msg);
            return;
        }
        self.pending.push_back(msg);
        msg.set_tag(Tag::Accept);
        msg.set_term(self.current_term);
        msg.set_origin(self.id());
        let acceptor = self.current_acceptor;
        self.send_to_replica(acceptor, &msg);
        self.proposal_index += 1;
    }

    /// Acceptor: decide, assign the index, let everyone learn.
    fn handle_accept(&mut self, mut msg: Message) {
        if msg.term() < self.highest_proposal_seen {
            log::warn!(
                "replica {}: stale ACCEPT term {} (seen {}), abandoning",
                self.id(),
                msg.term(),
                self.highest_proposal_seen
            );
            let mut abandon = msg;
            abandon.set_tag(Tag::Abandon);
            abandon.set_origin(self.id());
            let leader = self.current_leader;
            self.send_to_replica(leader, &abandon);
            return;
        }
        self.highest_proposal_seen = msg.term();
        self.last_entry = Some(msg);

        msg.set_tag(Tag::Learn);
        msg.set_index(self.index);
        self.broadcast_others(&msg);
        self.deliver_learn(msg);
    }

    fn handle_learn(&mut self, msg: Message) {
        self.voted = false;
        self.change = false;
        self.deliver_learn(msg);
    }

    /// Apply LEARNs in index order; park anything ahead of the gap.
    fn deliver_learn(&mut self, msg: Message) {
        let idx = msg.index();
        if idx < self.index {
            // replay of an already-applied slot after a change; the rid
            // filter would suppress it anyway
            return;
        }
        self.learn_buffer.insert(idx, msg);

        while let Some(next) = self.learn_buffer.remove(&self.index) {
            let success = self.base.execute(&next);
            self.base.forward_below(&next);
            self.index += 1;

            if self.is_leader() {
                self.pending.pop_front();
                if success {
                    self.base.respond(&next);
                }
            }
        }
    }

    fn handle_abandon(&mut self, msg: &Message) {
        if msg.origin() == self.id() || !self.is_leader() {
            return;
        }
        log::warn!(
            "replica {}: acceptor abandoned proposal (term {})",
            self.id(),
            msg.term()
        );
    }

    /*
     * Liveness: periodic pings plus the two change protocols.
     */

    fn tick(&mut self) {
        if self.base.spec.level != Level::Node {
            return;
        }
        let period = TIMEOUT_MS + if self.is_leader() { 0 } else { self.backoff_ms };
        if self.last_tick.elapsed().as_millis() < period as u128 {
            return;
        }
        self.last_tick = Instant::now();

        if self.is_leader() {
            if self.acceptor_timeout && !self.change {
                log::info!("replica {}: assuming acceptor dead", self.id());
                self.start_acceptor_change();
            }
            let mut ping = Message::new(Tag::IsAlive);
            ping.set_origin(self.id());
            let acceptor = self.current_acceptor;
            self.send_to_replica(acceptor, &ping);
            self.acceptor_timeout = true;
        } else if self.id() != self.current_acceptor {
            if self.leader_timeout && !self.change {
                log::info!("replica {}: trying to become leader", self.id());
                self.start_leader_takeover();
            }
            let mut ping = Message::new(Tag::IsAlive);
            ping.set_origin(self.id());
            let leader = self.current_leader;
            self.send_to_replica(leader, &ping);
            self.leader_timeout = true;
        }
    }

    fn handle_is_alive(&mut self, msg: &Message) {
        let mut reply = Message::new(Tag::IsAliveResp);
        reply.set_origin(self.id());
        self.send_to_replica(msg.origin(), &reply);
    }

    fn handle_is_alive_resp(&mut self, msg: &Message) {
        if msg.origin() == self.current_leader {
            self.leader_timeout = false;
        } else if msg.origin() == self.current_acceptor {
            self.acceptor_timeout = false;
        }
    }

    /// Leader suspects the acceptor: confirm leadership with the peers.
    fn start_acceptor_change(&mut self) {
        self.change = true;
        self.num_success = 0;
        let mut query = Message::new(Tag::IsLeader);
        query.set_origin(self.id());
        for id in 0..self.base.num_replicas() as u8 {
            if id != self.id() && id != self.current_acceptor {
                self.send_to_replica(id, &query);
            }
        }
    }

    fn handle_is_leader(&mut self, msg: &Message) {
        let mut reply = Message::new(Tag::IsLeaderResp);
        reply.set_payload([(msg.origin() == self.current_leader) as u64, 0, 0]);
        reply.set_origin(self.id());
        self.send_to_replica(msg.origin(), &reply);
    }

    fn handle_is_leader_resp(&mut self, msg: &Message) {
        if msg.payload()[0] != 1 {
            return;
        }
        self.num_success += 1;
        if self.num_success < self.majority() {
            return;
        }
        // confirmed leader with a dead acceptor: promote the next one
        self.is_dead[self.current_acceptor as usize] = true;
        let Some(next) = self.next_acceptor_id() else {
            log::error!(
                "replica {}: not enough live replicas for a new acceptor",
                self.id()
            );
            return;
        };
        self.current_acceptor = next;
        self.current_term += 1;
        self.num_success = 0;
        self.change = false;

        let mut announce = Message::new(Tag::ChangeAcceptor);
        announce.set_origin(self.id());
        announce.set_index(next as u64);
        self.broadcast_others(&announce);
        log::info!("replica {}: acceptor changed to {next}", self.id());

        if let Some(mut entry) = self.last_entry {
            entry.set_tag(Tag::Accept);
            entry.set_term(self.current_term);
            entry.set_origin(self.id());
            self.send_to_replica(next, &entry);
        }
    }

    /// Replica suspects the leader: gather acceptor votes.
    fn start_leader_takeover(&mut self) {
        self.change = true;
        self.acceptor_votes.iter_mut().for_each(|v| *v = 0);
        let mut query = Message::new(Tag::GetAcceptor);
        query.set_origin(self.id());
        for id in 0..self.base.num_replicas() as u8 {
            if id != self.id() {
                self.send_to_replica(id, &query);
            }
        }
    }

    fn handle_get_acceptor(&mut self, msg: &Message) {
        // one vote per term
        if self.voted {
            return;
        }
        self.voted = true;
        self.change = true;
        let mut reply = Message::new(Tag::GetAcceptorResp);
        reply.set_index(self.current_acceptor as u64);
        reply.set_origin(self.id());
        self.send_to_replica(msg.origin(), &reply);
    }

    fn handle_get_acceptor_resp(&mut self, msg: &Message) {
        let candidate = msg.index() as usize;
        if candidate >= self.acceptor_votes.len() {
            return;
        }
        self.acceptor_votes[candidate] += 1;
        if self.acceptor_votes[candidate] < self.majority() {
            return;
        }
        // majority agrees on the acceptor: take over as leader
        self.is_dead[self.current_leader as usize] = true;
        self.current_acceptor = candidate as u8;
        self.current_term += 1;
        self.current_leader = self.id();
        self.acceptor_votes.iter_mut().for_each(|v| *v = 0);
        log::info!("replica {}: taking over as leader", self.id());

        let mut announce = Message::new(Tag::ChangeLeader);
        announce.set_origin(self.id());
        self.broadcast_others(&announce);

        let mut prepare = self.last_entry.unwrap_or_default();
        prepare.set_tag(Tag::Prepare);
        prepare.set_term(self.current_term);
        prepare.set_origin(self.id());
        let acceptor = self.current_acceptor;
        self.send_to_replica(acceptor, &prepare);
    }

    fn handle_prepare(&mut self, msg: Message) {
        if msg.term() <= self.highest_proposal_seen {
            return;
        }
        self.highest_proposal_seen = msg.term();
        self.current_leader = msg.origin();
        self.leader_timeout = false;
        let mut reply = Message::new(Tag::PrepareResp);
        reply.set_term(msg.term());
        reply.set_origin(self.id());
        self.send_to_replica(msg.origin(), &reply);
    }

    /// The elected acceptor answered: replay what the old regime may have
    /// lost. Deduplication by request id keeps the replay harmless.
    fn handle_prepare_resp(&mut self, _msg: &Message) {
        self.change = false;
        if !self.pending.is_empty() {
            let pending: Vec<Message> = self.pending.iter().copied().collect();
            for mut entry in pending {
                entry.set_tag(Tag::Accept);
                entry.set_term(self.current_term);
                entry.set_origin(self.id());
                let acceptor = self.current_acceptor;
                self.send_to_replica(acceptor, &entry);
            }
        } else if let Some(mut entry) = self.last_entry {
            entry.set_tag(Tag::Accept);
            entry.set_term(self.current_term);
            entry.set_origin(self.id());
            let acceptor = self.current_acceptor;
            self.send_to_replica(acceptor, &entry);
        }
    }

    fn handle_change_leader(&mut self, msg: &Message) {
        if msg.origin() != self.current_leader {
            self.is_dead[self.current_leader as usize] = true;
            self.current_leader = msg.origin();
            self.leader_timeout = false;
            self.voted = false;
            self.change = false;
        }
    }

    fn handle_change_acceptor(&mut self, msg: &Message) {
        if msg.origin() == self.current_leader {
            self.is_dead[self.current_acceptor as usize] = true;
            self.current_acceptor = msg.index() as u8;
            self.acceptor_timeout = false;
            self.change = false;
        }
    }

    /// Next live replica that is neither the leader nor a known corpse.
    fn next_acceptor_id(&self) -> Option<u8> {
        for id in self.current_acceptor + 1..self.base.num_replicas() as u8 {
            if id != self.current_leader && !self.is_dead[id as usize] {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn run(&mut self) {
        let replicas = self.base.spec.replicas.clone();
        let clients = self.base.spec.clients.clone();
        let own_core = self.base.spec.core;
        let mut spin = Spinner::new();

        while !self.base.should_stop() {
            let mut worked = false;
            for &core in &replicas {
                if core == own_core {
                    continue;
                }
                if let Some(msg) = self.base.port.try_recv(core) {
                    self.handle(msg);
                    worked = true;
                }
            }
            if self.is_leader() {
                for &client in &clients {
                    if let Some(msg) = self.base.port.try_recv(client) {
                        self.handle(msg);
                        worked = true;
                    }
                }
            }
            self.tick();
            if worked {
                spin.reset();
            } else {
                spin.idle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::tests::{base_on, test_base};
    use crate::transport::mesh::Mesh;

    // Drive leader (id 0, core 0), acceptor (id 1, core 1) and learner
    // (id 2, core 2) by hand, shuttling messages between their ports.

    #[test]
    fn test_steady_state_commit_flow() {
        let mesh = Mesh::new(16);
        let (base, leader_store) = base_on(&mesh, 0, 0, 1);
        let mut leader = PaxosReplica::new(base);

        let (abase, acceptor_store) = base_on(&mesh, 1, 1, 1);
        let mut acceptor = PaxosReplica::new(abase);

        let (lbase, learner_store) = base_on(&mesh, 2, 2, 1);
        let mut learner = PaxosReplica::new(lbase);

        let mut client = mesh.port(10);

        // client request reaches the leader
        leader.handle(Message::request(0, 1, [5, 77, 22]));

        // leader sent ACCEPT to the acceptor core
        let accept = acceptor.base.port.recv(0);
        assert_eq!(accept.tag(), Some(Tag::Accept));
        acceptor.handle(accept);
        assert_eq!(acceptor_store.get(5).unwrap(), (77, 22));

        // acceptor broadcast LEARN with index 0 to leader and learner
        let learn_l = leader.base.port.recv(1);
        assert_eq!(learn_l.tag(), Some(Tag::Learn));
        assert_eq!(learn_l.index(), 0);
        leader.handle(learn_l);
        assert_eq!(leader_store.get(5).unwrap(), (77, 22));

        let learn_f = learner.base.port.recv(1);
        learner.handle(learn_f);
        assert_eq!(learner_store.get(5).unwrap(), (77, 22));

        // leader released the response after its own LEARN
        let resp = client.recv(0);
        assert_eq!(resp.tag(), Some(Tag::Response));
        assert_eq!(resp.request_id(), 1);
    }

    #[test]
    fn test_replayed_accept_applies_once() {
        let mesh = Mesh::new(16);
        let (abase, store) = base_on(&mesh, 1, 1, 1);
        let _leader_port = mesh.port(0);
        let _learner_port = mesh.port(2);
        let mut acceptor = PaxosReplica::new(abase);

        let mut accept = Message::request(0, 7, [4, 1, 2]);
        accept.set_tag(Tag::Accept);
        accept.set_term(1);
        acceptor.handle(accept);
        assert_eq!(store.get(4).unwrap(), (1, 2));

        // the new leader replays the same entry under a higher term
        let mut replay = Message::request(0, 7, [4, 9, 9]);
        replay.set_tag(Tag::Accept);
        replay.set_term(2);
        acceptor.handle(replay);

        // accepted (no abandon) but not applied a second time
        assert_eq!(store.get(4).unwrap(), (1, 2));
        assert_eq!(acceptor.index, 2);
    }

    #[test]
    fn test_stale_term_accept_is_abandoned() {
        let mesh = Mesh::new(16);
        let (abase, store) = base_on(&mesh, 1, 1, 1);
        let mut leader_port = mesh.port(0);
        let _learner_port = mesh.port(2);
        let mut acceptor = PaxosReplica::new(abase);

        let mut first = Message::request(0, 1, [1, 1, 1]);
        first.set_tag(Tag::Accept);
        first.set_term(5);
        acceptor.handle(first);
        leader_port.recv(1); // LEARN

        let mut stale = Message::request(0, 2, [2, 2, 2]);
        stale.set_tag(Tag::Accept);
        stale.set_term(4);
        acceptor.handle(stale);

        assert_eq!(leader_port.recv(1).tag(), Some(Tag::Abandon));
        assert_eq!(store.get(2).unwrap(), (0, 0));
    }

    #[test]
    fn test_acceptor_change_on_majority() {
        // 3 replicas: leader (self), acceptor 1 presumed dead, peer 2
        let (base, _) = test_base(1);
        let mesh = base.port_mesh_for_tests();
        let _acceptor_sink = mesh.port(1);
        let mut peer2 = mesh.port(2);
        let mut leader = PaxosReplica::new(base);
        leader.last_entry = {
            let mut e = Message::request(0, 3, [1, 2, 3]);
            e.set_tag(Tag::Accept);
            Some(e)
        };

        leader.start_acceptor_change();
        assert_eq!(peer2.recv(0).tag(), Some(Tag::IsLeader));

        // peer 2 confirms our leadership: with n=3 one vote is majority
        let mut confirm = Message::new(Tag::IsLeaderResp);
        confirm.set_payload([1, 0, 0]);
        confirm.set_origin(2);
        leader.handle(confirm);

        assert_eq!(leader.current_acceptor, 2);
        assert_eq!(leader.current_term, 2);
        assert!(leader.is_dead[1]);

        // peer 2 was announced the change and got the replayed entry
        let announce = peer2.recv(0);
        assert_eq!(announce.tag(), Some(Tag::ChangeAcceptor));
        assert_eq!(announce.index(), 2);
        let replay = peer2.recv(0);
        assert_eq!(replay.tag(), Some(Tag::Accept));
        assert_eq!(replay.term(), 2);
        assert_eq!(replay.request_id(), 3);
    }

    #[test]
    fn test_leader_takeover_on_majority() {
        // replica 2 suspects leader 0; acceptor candidate from votes is 1
        let mesh = Mesh::new(16);
        let (base, _) = base_on(&mesh, 2, 2, 1);
        let _leader_port = mesh.port(0);
        let mut acceptor_port = mesh.port(1);
        let mut replica = PaxosReplica::new(base);

        replica.start_leader_takeover();
        assert!(replica.change);

        let mut vote = Message::new(Tag::GetAcceptorResp);
        vote.set_index(1);
        vote.set_origin(1);
        replica.handle(vote);

        assert_eq!(replica.current_leader, 2);
        assert_eq!(replica.current_term, 2);
        assert!(replica.is_dead[0]);

        // the elected acceptor saw the announcement, then PREPARE under
        // the new term
        assert_eq!(acceptor_port.recv(2).tag(), Some(Tag::ChangeLeader));
        let prep = acceptor_port.recv(2);
        assert_eq!(prep.tag(), Some(Tag::Prepare));
        assert_eq!(prep.term(), 2);
    }

    #[test]
    fn test_one_get_acceptor_vote_per_term() {
        let (base, _) = test_base(1);
        let mesh = base.port_mesh_for_tests();
        let mut candidate = mesh.port(2);
        let mut replica = PaxosReplica::new(base);

        let mut query = Message::new(Tag::GetAcceptor);
        query.set_origin(2);
        replica.handle(query);
        assert_eq!(candidate.recv(0).tag(), Some(Tag::GetAcceptorResp));

        // second query in the same term gets nothing
        replica.handle(query);
        assert!(candidate.try_recv(0).is_none());

        // a LEARN resets the vote for the next term
        let mut learn = Message::request(0, 1, [1, 1, 1]);
        learn.set_tag(Tag::Learn);
        learn.set_index(0);
        replica.handle(learn);
        replica.handle(query);
        assert_eq!(candidate.recv(0).tag(), Some(Tag::GetAcceptorResp));
    }

    #[test]
    fn test_next_acceptor_skips_leader_and_dead() {
        let (base, _) = test_base(1);
        let mut replica = PaxosReplica::new(base);
        // acceptor 1 dead; replica 2 is next
        replica.is_dead[1] = true;
        assert_eq!(replica.next_acceptor_id(), Some(2));
        replica.is_dead[2] = true;
        assert_eq!(replica.next_acceptor_id(), None);
    }
}
