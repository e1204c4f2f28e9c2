// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raft-style leader-driven log replication.
//!
//! The leader appends every REQUEST to its log and fans out APPEND
//! entries carrying `(term, prev_index, commit_index, payload)`.
//! Followers reject an APPEND whose `prev_index` they do not hold,
//! answering with their `last_log_index` so the leader can back up
//! `next_index` in one step. The leader advances `commit_index` once a
//! majority of `match_index` covers an entry of the current term, applies
//! in index order and releases responses.
//!
//! Heartbeats (empty APPENDs every 50 ms) keep followers from electing;
//! a follower that hears nothing for its randomized election timeout in
//! `[200, 350)` ms becomes a candidate, and votes follow the standard
//! rules: one vote per term, candidate log at least as up to date as the
//! voter's (compared by last log term, then last log index).

use std::time::{Duration, Instant};

use crate::affinity::BackoffRng;
use crate::message::{Message, Payload, Tag};
use crate::replica::ReplicaBase;
use crate::transport::shm::ring::Spinner;

const HEARTBEAT_TIMEOUT_MS: u64 = 50;
const ELECTION_TIMEOUT_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
struct LogEntry {
    index: u64,
    term: u64,
    /// Original request header word (client id + request id).
    header: u64,
    payload: Payload,
    /// Replicas known to hold this entry; bookkeeping only.
    exec_count: u8,
}

pub struct RaftReplica {
    base: ReplicaBase,

    current_term: u64,
    current_leader: u8,
    voted_for: Option<u8>,
    role: Role,

    /// Entries indexed from 1; `log[i - 1]` holds index `i`.
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,

    // leader bookkeeping
    next_index: Vec<u64>,
    match_index: Vec<u64>,

    // election bookkeeping
    num_votes: u16,
    num_rejects: u16,

    rng: BackoffRng,
    election_timeout: Duration,
    last_contact: Instant,
    last_heartbeat: Instant,
}

impl RaftReplica {
    pub(crate) fn new(base: ReplicaBase) -> RaftReplica {
        let n = base.spec.replicas.len();
        let is_initial_leader = base.spec.id == 0;
        let mut rng = BackoffRng::new();
        let election_timeout =
            Duration::from_millis(ELECTION_TIMEOUT_MS + rng.backoff_ms(BACKOFF_MAX_MS));
        RaftReplica {
            current_term: 1,
            current_leader: 0,
            voted_for: None,
            role: if is_initial_leader {
                Role::Leader
            } else {
                Role::Follower
            },
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            next_index: vec![1; n],
            match_index: vec![0; n],
            num_votes: 0,
            num_rejects: 0,
            rng,
            election_timeout,
            last_contact: Instant::now(),
            last_heartbeat: Instant::now(),
            base,
        }
    }

    fn id(&self) -> u8 {
        self.base.spec.id
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    fn majority_count(&self) -> usize {
        self.base.num_replicas() / 2 + 1
    }

    /// A higher term (or any term while we are candidate) demotes us.
    fn update_state(&mut self, term: u64, leader: u8) {
        if term > self.current_term || (self.role == Role::Candidate && term >= self.current_term) {
            self.current_term = term;
            self.current_leader = leader;
            self.voted_for = None;
            self.role = Role::Follower;
        }
    }

    pub(crate) fn handle(&mut self, msg: Message) {
        match msg.tag() {
            Some(Tag::Setup) => self.base.handle_setup(&msg),
            Some(Tag::Request) => self.handle_request(msg),
            Some(Tag::Append) => self.handle_append(msg),
            Some(Tag::AppendEmpty) => self.handle_append_empty(&msg),
            Some(Tag::AppendResp) => self.handle_append_resp(&msg),
            Some(Tag::RequestVote) => self.handle_vote(&msg),
            Some(Tag::RequestVoteResp) => self.handle_vote_resp(&msg),
            _ => self.base.violation("unexpected message", &msg),
        }
    }

    fn handle_request(&mut self, msg: Message) {
        if self.role != Role::Leader {
            let leader = self.current_leader;
            self.base.forward_to(leader, &msg);
            return;
        }
        self.last_log_index += 1;
        let index = self.last_log_index;
        self.log.push(LogEntry {
            index,
            term: self.current_term,
            header: msg.words[0],
            payload: msg.payload(),
            exec_count: 1,
        });
        let self_id = self.id() as usize;
        self.match_index[self_id] = index;

        for id in 0..self.base.num_replicas() as u8 {
            if id != self.id() {
                self.send_append_to(id, index);
            }
        }
        // single-replica cluster commits immediately
        self.update_commit_index();
        self.update_applied();
    }

    /// Ship the entry at `index` to one follower.
    fn send_append_to(&mut self, follower: u8, index: u64) {
        let entry = &self.log[index as usize - 1];
        let mut msg = Message { words: [0; 7] };
        msg.words[0] = entry.header;
        msg.set_tag(Tag::Append);
        msg.set_index(index - 1); // prev_index
        msg.set_term(self.current_term);
        msg.set_origin(self.id());
        msg.words[3] = self.commit_index;
        msg.set_payload(entry.payload);
        self.base.forward_to(follower, &msg);
    }

    fn handle_append(&mut self, msg: Message) {
        self.last_contact = Instant::now();
        let term = msg.term();
        let leader = msg.origin();
        let prev_index = msg.index();
        let leader_commit = msg.words[3];

        if leader == self.id() {
            self.base.violation("leader received append", &msg);
            return;
        }
        if term < self.current_term {
            self.send_append_resp(leader, prev_index, false);
            return;
        }
        self.update_state(term, leader);
        self.current_leader = leader;

        // log must already hold prev_index
        if prev_index > self.last_log_index {
            let last = self.last_log_index;
            self.send_append_resp(leader, last, false);
            return;
        }

        // conflict: drop prev_index+1 and everything after it
        if self.last_log_index > prev_index {
            self.log.truncate(prev_index as usize);
            self.last_log_index = prev_index;
        }

        self.log.push(LogEntry {
            index: prev_index + 1,
            term,
            header: msg.words[0],
            payload: msg.payload(),
            exec_count: 1,
        });
        self.last_log_index = prev_index + 1;

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.last_log_index);
        }

        let matched = self.last_log_index;
        self.send_append_resp(leader, matched, true);
        self.update_applied();
    }

    fn send_append_resp(&mut self, leader: u8, index: u64, success: bool) {
        let mut resp = Message::new(Tag::AppendResp);
        resp.set_index(index);
        resp.set_term(self.current_term);
        resp.set_origin(self.id());
        resp.set_payload([success as u64, 0, 0]);
        self.base.forward_to(leader, &resp);
    }

    fn handle_append_empty(&mut self, msg: &Message) {
        self.last_contact = Instant::now();
        self.update_state(msg.term(), msg.origin());
        let leader_commit = msg.words[3];
        if leader_commit >= self.commit_index {
            self.commit_index = leader_commit.min(self.last_log_index);
            self.update_applied();
        }
    }

    fn handle_append_resp(&mut self, msg: &Message) {
        if msg.term() > self.current_term {
            self.update_state(msg.term(), msg.origin());
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        let follower = msg.origin() as usize;
        let last_index = msg.index();
        let success = msg.payload()[0] == 1;
        let full = self.base.num_replicas() as u8;

        if success {
            self.next_index[follower] = last_index + 1;
            if last_index > self.match_index[follower] {
                self.match_index[follower] = last_index;
                if let Some(entry) = self.log.get_mut(last_index as usize - 1) {
                    entry.exec_count += 1;
                    if entry.exec_count == full {
                        log::debug!("entry {last_index} held by every replica");
                    }
                }
            }
            self.update_commit_index();
            // stream any outstanding entries
            if self.last_log_index >= self.next_index[follower] {
                let next = self.next_index[follower];
                self.send_append_to(follower as u8, next);
            }
        } else {
            if last_index < self.match_index[follower] {
                return; // stale rejection
            }
            // follower told us its last index: back up in one step
            self.next_index[follower] = last_index + 1;
            if self.next_index[follower] <= self.last_log_index {
                let next = self.next_index[follower];
                self.send_append_to(follower as u8, next);
            }
        }
        self.update_applied();
    }

    /// Find the highest N with a current-term entry covered by a
    /// majority of match indices.
    fn update_commit_index(&mut self) {
        for n in self.commit_index + 1..=self.last_log_index {
            let covering = self
                .match_index
                .iter()
                .filter(|&&m| m >= n)
                .count();
            if covering >= self.majority_count() && self.log[n as usize - 1].term == self.current_term
            {
                self.commit_index = n;
            }
        }
    }

    fn update_applied(&mut self) {
        while self.commit_index > self.last_applied {
            self.last_applied += 1;
            let entry = &self.log[self.last_applied as usize - 1];
            let mut msg = Message { words: [0; 7] };
            msg.words[0] = entry.header;
            msg.set_index(entry.index);
            msg.set_payload(entry.payload);

            let success = self.base.execute(&msg);
            self.base.forward_below(&msg);

            if self.role == Role::Leader && success {
                self.base.respond(&msg);
            }
        }
    }

    /*
     * Elections and heartbeats.
     */

    fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                if self.last_heartbeat.elapsed().as_millis() >= HEARTBEAT_TIMEOUT_MS as u128 {
                    self.last_heartbeat = Instant::now();
                    self.update_commit_index();
                    self.update_applied();
                    self.send_heartbeats();
                }
            }
            Role::Follower | Role::Candidate => {
                if self.last_contact.elapsed() >= self.election_timeout {
                    self.start_election();
                }
            }
        }
    }

    fn send_heartbeats(&mut self) {
        let mut beat = Message::new(Tag::AppendEmpty);
        beat.set_term(self.current_term);
        beat.set_origin(self.id());
        beat.words[3] = self.commit_index;
        for id in 0..self.base.num_replicas() as u8 {
            if id != self.id() {
                self.base.forward_to(id, &beat);
            }
        }
    }

    fn start_election(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id());
        self.num_votes = 1;
        self.num_rejects = 0;
        self.last_contact = Instant::now();
        self.election_timeout =
            Duration::from_millis(ELECTION_TIMEOUT_MS + self.rng.backoff_ms(BACKOFF_MAX_MS));
        log::info!(
            "replica {}: election for term {}",
            self.id(),
            self.current_term
        );

        let mut ballot = Message::new(Tag::RequestVote);
        ballot.set_term(self.current_term);
        ballot.set_origin(self.id());
        ballot.set_index(self.last_log_index);
        ballot.words[3] = self.last_log_term();
        for id in 0..self.base.num_replicas() as u8 {
            if id != self.id() {
                self.base.forward_to(id, &ballot);
            }
        }
        // single-replica cluster: already elected
        if self.base.num_replicas() == 1 {
            self.become_leader();
        }
    }

    fn handle_vote(&mut self, msg: &Message) {
        let term = msg.term();
        let candidate = msg.origin();
        let cand_last_index = msg.index();
        let cand_last_term = msg.words[3];

        if term > self.current_term {
            self.update_state(term, self.current_leader);
        }

        let up_to_date = cand_last_term > self.last_log_term()
            || (cand_last_term == self.last_log_term() && cand_last_index >= self.last_log_index);
        let granted = term >= self.current_term
            && self.voted_for.map_or(true, |v| v == candidate)
            && up_to_date;

        if granted {
            self.voted_for = Some(candidate);
            self.last_contact = Instant::now();
        }

        let mut reply = Message::new(Tag::RequestVoteResp);
        reply.set_term(self.current_term);
        reply.set_origin(self.id());
        reply.set_payload([granted as u64, 0, 0]);
        self.base.forward_to(candidate, &reply);
    }

    fn handle_vote_resp(&mut self, msg: &Message) {
        if self.role != Role::Candidate {
            return;
        }
        if msg.term() > self.current_term {
            self.update_state(msg.term(), self.current_leader);
            return;
        }
        if msg.payload()[0] == 1 {
            self.num_votes += 1;
        } else {
            self.num_rejects += 1;
        }

        if self.num_votes as usize >= self.majority_count() {
            self.become_leader();
        } else if self.num_rejects as usize >= self.base.num_replicas() / 2 {
            // rejected by half the cluster: stand down with the longest
            // timeout so the winner can establish itself
            self.role = Role::Follower;
            self.voted_for = None;
            self.num_votes = 0;
            self.num_rejects = 0;
            self.last_contact = Instant::now();
            self.election_timeout = Duration::from_millis(ELECTION_TIMEOUT_MS + BACKOFF_MAX_MS);
        }
    }

    fn become_leader(&mut self) {
        log::info!(
            "replica {}: leader for term {}",
            self.id(),
            self.current_term
        );
        self.role = Role::Leader;
        self.current_leader = self.id();
        self.num_votes = 0;
        self.num_rejects = 0;
        self.voted_for = None;
        for id in 0..self.base.num_replicas() {
            self.next_index[id] = self.last_log_index + 1;
            self.match_index[id] = 0;
        }
        let self_id = self.id() as usize;
        self.match_index[self_id] = self.last_log_index;
        self.update_commit_index();
        self.last_heartbeat = Instant::now();
        self.send_heartbeats();
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
            if self.role == Role::Leader {
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
    use crate::replica::tests::base_on;
    use crate::transport::mesh::Mesh;

    fn follower(mesh: &std::sync::Arc<Mesh>, id: u8) -> RaftReplica {
        let (base, _) = base_on(mesh, id, id, 1);
        let mut r = RaftReplica::new(base);
        assert_eq!(r.role, Role::Follower);
        // keep elections out of handler-level tests
        r.election_timeout = Duration::from_secs(3600);
        r
    }

    #[test]
    fn test_follower_rejects_append_past_its_log() {
        let mesh = Mesh::new(16);
        let mut leader_port = mesh.port(0);
        let mut f = follower(&mesh, 1);

        // prev_index 5 but the follower log is empty
        let mut append = Message::request(0, 1, [1, 2, 3]);
        append.set_tag(Tag::Append);
        append.set_index(5);
        append.set_term(1);
        append.set_origin(0);
        append.words[3] = 0;
        f.handle(append);

        let resp = leader_port.recv(1);
        assert_eq!(resp.tag(), Some(Tag::AppendResp));
        assert_eq!(resp.payload()[0], 0, "must reject");
        assert_eq!(resp.index(), 0, "carries last_log_index");
        assert_eq!(resp.term(), 1);
    }

    #[test]
    fn test_append_then_commit_on_leader_heartbeat() {
        let mesh = Mesh::new(16);
        let mut leader_port = mesh.port(0);
        let (mut f, store) = {
            let (base, store) = base_on(&mesh, 1, 1, 1);
            let mut r = RaftReplica::new(base);
            r.election_timeout = Duration::from_secs(3600);
            (r, store)
        };

        let mut append = Message::request(0, 1, [6, 60, 61]);
        append.set_tag(Tag::Append);
        append.set_index(0); // prev
        append.set_term(1);
        append.set_origin(0);
        append.words[3] = 0; // nothing committed yet
        f.handle(append);

        let resp = leader_port.recv(1);
        assert_eq!(resp.payload()[0], 1);
        assert_eq!(resp.index(), 1);
        // appended but not applied before the commit index moves
        assert_eq!(store.get(6).unwrap(), (0, 0));

        let mut beat = Message::new(Tag::AppendEmpty);
        beat.set_term(1);
        beat.set_origin(0);
        beat.words[3] = 1;
        f.handle(beat);
        assert_eq!(store.get(6).unwrap(), (60, 61));
    }

    #[test]
    fn test_leader_commits_at_majority() {
        let mesh = Mesh::new(16);
        let (base, store) = base_on(&mesh, 0, 0, 1);
        let mut f1 = mesh.port(1);
        let _f2 = mesh.port(2);
        let mut client = mesh.port(10);
        let mut leader = RaftReplica::new(base);

        leader.handle(Message::request(0, 1, [2, 20, 21]));
        assert_eq!(f1.recv(0).tag(), Some(Tag::Append));
        // nothing committed with only the leader holding the entry
        assert_eq!(leader.commit_index, 0);

        // one follower response makes 2 of 3: commit, apply, respond
        let mut resp = Message::new(Tag::AppendResp);
        resp.set_index(1);
        resp.set_term(1);
        resp.set_origin(1);
        resp.set_payload([1, 0, 0]);
        leader.handle(resp);

        assert_eq!(leader.commit_index, 1);
        assert_eq!(store.get(2).unwrap(), (20, 21));
        assert_eq!(client.recv(0).tag(), Some(Tag::Response));
    }

    #[test]
    fn test_truncate_on_conflicting_append() {
        let mesh = Mesh::new(16);
        let mut leader_port = mesh.port(0);
        let mut f = follower(&mesh, 1);

        for i in 0..3u64 {
            let mut append = Message::request(0, i as u32 + 1, [i, i, i]);
            append.set_tag(Tag::Append);
            append.set_index(i);
            append.set_term(1);
            append.set_origin(0);
            f.handle(append);
            leader_port.recv(1);
        }
        assert_eq!(f.last_log_index, 3);

        // new leader overwrites from index 2
        let mut append = Message::request(0, 9, [9, 9, 9]);
        append.set_tag(Tag::Append);
        append.set_index(1);
        append.set_term(2);
        append.set_origin(2);
        f.handle(append);

        assert_eq!(f.last_log_index, 2);
        assert_eq!(f.log[1].term, 2);
        assert_eq!(f.current_term, 2);
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mesh = Mesh::new(16);
        let mut cand1 = mesh.port(1);
        let mut cand2 = mesh.port(2);
        let (base, _) = base_on(&mesh, 0, 0, 1);
        let mut voter = RaftReplica::new(base);
        voter.role = Role::Follower;

        let mut ballot = Message::new(Tag::RequestVote);
        ballot.set_term(2);
        ballot.set_origin(1);
        ballot.set_index(0);
        ballot.words[3] = 0;
        voter.handle(ballot);
        assert_eq!(cand1.recv(0).payload()[0], 1, "first vote granted");

        let mut rival = ballot;
        rival.set_origin(2);
        voter.handle(rival);
        assert_eq!(cand2.recv(0).payload()[0], 0, "second vote denied");
    }

    #[test]
    fn test_vote_denied_to_stale_log() {
        let mesh = Mesh::new(16);
        let mut cand = mesh.port(2);
        let mut voter = follower(&mesh, 1);
        let mut lport = mesh.port(0);

        // voter holds one entry of term 1
        let mut append = Message::request(0, 1, [1, 1, 1]);
        append.set_tag(Tag::Append);
        append.set_index(0);
        append.set_term(1);
        append.set_origin(0);
        voter.handle(append);
        lport.recv(1);

        // candidate with an empty log loses
        let mut ballot = Message::new(Tag::RequestVote);
        ballot.set_term(2);
        ballot.set_origin(2);
        ballot.set_index(0);
        ballot.words[3] = 0;
        voter.handle(ballot);
        assert_eq!(cand.recv(1).payload()[0], 0);
    }

    #[test]
    fn test_candidate_becomes_leader_on_majority() {
        let mesh = Mesh::new(16);
        let mut peer1 = mesh.port(0);
        let mut peer2 = mesh.port(2);
        let mut f = follower(&mesh, 1);

        f.start_election();
        assert_eq!(f.role, Role::Candidate);
        assert_eq!(f.current_term, 2);
        assert_eq!(peer1.recv(1).tag(), Some(Tag::RequestVote));
        assert_eq!(peer2.recv(1).tag(), Some(Tag::RequestVote));

        let mut grant = Message::new(Tag::RequestVoteResp);
        grant.set_term(2);
        grant.set_origin(0);
        grant.set_payload([1, 0, 0]);
        f.handle(grant);

        assert_eq!(f.role, Role::Leader);
        // the new leader announces itself immediately
        assert_eq!(peer1.recv(1).tag(), Some(Tag::AppendEmpty));
        assert_eq!(peer2.recv(1).tag(), Some(Tag::AppendEmpty));
    }
}
