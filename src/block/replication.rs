//! The replication protocol, one method per role.
//!
//! `owner_*` methods run on the owning node, `master_*` on the node holding
//! the master replica, `copy_*` and `invalid_*` on the others. Messages a
//! role sends are pushed as [`Effect::Send`]; the node delivers them after
//! the block lock is released, including the ones addressed to itself.

use core::mem;

use tracing::trace;

use super::{AccessMode, BlockMessage, DataBlock, Effect, ReplicaState};
use crate::{
    error::Error,
    id::{GlobalId, NodeId},
};

/// Where the owner wants mastership to go next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    /// Mastership is being collected to destroy the block.
    Destroy,
}

/// What the master replica is currently busy with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MasterActivity {
    #[default]
    Idle,
    Writing,
    Invalidating,
    WritingAndInvalidating,
}

type Effects = Vec<Effect>;

impl DataBlock {
    fn send(&self, fx: &mut Effects, to: NodeId, msg: BlockMessage) {
        trace!(block = %self.id, from = self.me, to, ?msg, "replication");
        fx.push(Effect::Send { to, msg });
    }

    fn violation(&self, what: &'static str) -> Error {
        Error::ProtocolViolation { id: self.id, what }
    }

    fn check_owner(&self) -> Result<(), Error> {
        if self.me != self.owner {
            return Err(Error::NotOwner(self.id));
        }
        Ok(())
    }

    fn contents(&self) -> Result<Vec<u8>, Error> {
        self.buffer
            .as_ref()
            .map(|b| b.to_vec())
            .ok_or_else(|| self.violation("replica holds no data"))
    }

    fn take_contents(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if data.len() as u64 != self.len {
            return Err(self.violation("data length differs from block length"));
        }
        self.buffer = Some(super::Buffer::from_vec(data));
        Ok(())
    }

    /// Tries to lock the block for `task`. A task that cannot have the lock
    /// right away is queued and gets an [`Effect::Granted`] later; missing
    /// replication levels are requested from the owner.
    pub fn try_lock(&mut self, task: GlobalId, mode: AccessMode, fx: &mut Effects) -> bool {
        use AccessMode::*;
        if mode.writes() && self.state != ReplicaState::Master {
            let me = self.me;
            self.send(fx, self.owner, BlockMessage::ElevationRequest { node: me, level: ReplicaState::Master });
            self.waitlist.push_back((task, mode));
            return false;
        }
        if matches!(mode, Const | Ro) && self.state == ReplicaState::Invalid {
            let me = self.me;
            self.send(fx, self.owner, BlockMessage::ElevationRequest { node: me, level: ReplicaState::Copy });
            self.waitlist.push_back((task, mode));
            return false;
        }
        let locks = &mut self.locks;
        let granted = match mode {
            Null => true,
            Rw if locks.exclusive == 0 => {
                locks.shared_write += 1;
                true
            }
            Ro if locks.exclusive == 0 => {
                locks.shared_read += 1;
                true
            }
            Const if locks.shared_read == 0 && locks.shared_write == 0 && !locks.exclusive_write => {
                locks.exclusive += 1;
                true
            }
            Ew if locks.is_free() => {
                locks.exclusive += 1;
                locks.exclusive_write = true;
                true
            }
            _ => false,
        };
        if !granted {
            self.waitlist.push_back((task, mode));
        }
        granted
    }

    /// Releases one lock of `mode` and hands the block to waiting tasks.
    pub fn unlock(&mut self, mode: AccessMode, fx: &mut Effects) -> Result<(), Error> {
        let locks = &mut self.locks;
        let counter = match mode {
            AccessMode::Null => return Ok(()),
            AccessMode::Ro => &mut locks.shared_read,
            AccessMode::Rw => &mut locks.shared_write,
            AccessMode::Const | AccessMode::Ew => &mut locks.exclusive,
        };
        *counter = counter.checked_sub(1).ok_or(Error::LockNotHeld(self.id))?;
        if mode == AccessMode::Ew {
            locks.exclusive_write = false;
        }
        self.update_master_state(fx);
        self.grant_locks(fx);
        Ok(())
    }

    /// Removes the oldest waiter of `modes` and retries it. `None` when no
    /// such waiter exists, otherwise whether it got the lock.
    fn retry_waiter(&mut self, from: usize, modes: &[AccessMode], fx: &mut Effects) -> Option<(usize, bool)> {
        let pos = (from..self.waitlist.len()).find(|&i| modes.contains(&self.waitlist[i].1))?;
        let (task, mode) = self.waitlist.remove(pos)?;
        let granted = self.try_lock(task, mode, fx);
        if granted {
            fx.push(Effect::Granted { task, buffer: self.buffer.clone() });
        }
        Some((pos, granted))
    }

    fn grant_locks(&mut self, fx: &mut Effects) {
        use AccessMode::*;
        if self.locks.is_free() && self.retry_waiter(0, &[Ew], fx).is_some() {
            return;
        }
        if self.locks.shared_read == 0 && self.locks.shared_write == 0 && !self.locks.exclusive_write {
            let mut any = false;
            let mut from = 0;
            while let Some((pos, granted)) = self.retry_waiter(from, &[Const], fx) {
                if !granted {
                    return;
                }
                any = true;
                from = pos;
            }
            if any {
                return;
            }
        }
        if self.locks.exclusive == 0 {
            let mut from = 0;
            while let Some((pos, granted)) = self.retry_waiter(from, &[Rw, Ro], fx) {
                if !granted {
                    return;
                }
                from = pos;
            }
        }
    }

    fn can_provide_copies(&self) -> bool {
        self.master_data.pending_invalidations == 0 && !self.locks.has_writers()
    }

    fn update_master_state(&mut self, fx: &mut Effects) {
        let mastering = self.state == ReplicaState::Master
            || (self.state == ReplicaState::Copy && self.has_copylist);
        if !mastering {
            return;
        }
        let writing = self.locks.has_writers();
        let activity = match (writing, self.master_data.pending_invalidations > 0) {
            (false, false) => MasterActivity::Idle,
            (true, false) => MasterActivity::Writing,
            (false, true) => MasterActivity::Invalidating,
            (true, true) => MasterActivity::WritingAndInvalidating,
        };
        if activity == MasterActivity::Idle && self.master_data.activity != MasterActivity::Idle {
            while let Some(node) = self.master_data.copy_waitlist.pop_front() {
                if self.copylist.contains(&node) {
                    continue;
                }
                match self.contents() {
                    Ok(data) => {
                        self.master_data.pending_copies += 1;
                        self.send(fx, node, BlockMessage::DataCopy(data));
                        self.copylist.push(node);
                    }
                    Err(_) => break,
                }
            }
        }
        if activity == MasterActivity::Idle
            && self.state == ReplicaState::Copy
            && self.master_data.pending_copies == 0
        {
            self.release_copylist(fx);
        }
        self.master_data.activity = activity;
    }

    fn release_copylist(&mut self, fx: &mut Effects) {
        let mut copylist = mem::take(&mut self.copylist);
        copylist.push(self.me);
        self.send(fx, self.owner, BlockMessage::CopylistReleased(copylist));
        self.has_copylist = false;
    }

    /// Called when a writing task finishes. Returns whether its update is
    /// already visible everywhere; otherwise an [`Effect::RemoteUpdated`]
    /// follows once every copy is invalidated.
    pub fn writer_finished(&mut self, task: GlobalId, fx: &mut Effects) -> bool {
        if !self.has_copylist {
            return true;
        }
        if self.copylist.is_empty() && self.master_data.pending_invalidations == 0 {
            self.update_master_state(fx);
            return true;
        }
        if self.master_data.tasks_waiting_for_invalidation.is_empty() {
            self.master_data.pending_invalidations = self.copylist.len() as u32;
            for node in self.copylist.clone() {
                self.send(fx, node, BlockMessage::InvalidateCopy);
            }
        }
        self.master_data.tasks_waiting_for_invalidation.push(task);
        self.copylist.clear();
        self.update_master_state(fx);
        false
    }

    /// Applies one replication message sent by `from`.
    pub fn handle(&mut self, from: NodeId, msg: BlockMessage, fx: &mut Effects) -> Result<(), Error> {
        use BlockMessage::*;
        match msg {
            ElevationRequest { node, level } => self.owner_request_elevation(Target::Node(node), level, fx),
            ReleaseMasterRequest => self.master_release(fx),
            CopylistReleased(copylist) => self.owner_master_released(copylist, fx),
            TakeMaster(copylist) => self.copy_take_master(copylist, fx),
            TransferDataToNewMaster { recipient } => self.copy_transfer_to_new_master(recipient, fx),
            TransferDataToCopy { recipient } => self.master_transfer_to_copy(recipient, fx),
            Data(data) => self.invalid_become_master(data, fx),
            DataCopy(data) => self.become_copy(from, data, fx),
            CopyReceived => self.master_copy_received(fx),
            IsMaster => self.owner_new_master_ready(from, fx),
            InvalidateCopy => self.copy_invalidate(from, fx),
            CopyInvalidated => self.master_invalidated(fx),
        }
    }

    /// Collects mastership on the owner and destroys every replica.
    pub fn destroy(&mut self, fx: &mut Effects) -> Result<(), Error> {
        self.owner_request_elevation(Target::Destroy, ReplicaState::Master, fx)
    }

    fn owner_request_elevation(&mut self, node: Target, level: ReplicaState, fx: &mut Effects) -> Result<(), Error> {
        self.check_owner()?;
        if self.destroyed || self.owner_data.target == Target::Destroy {
            return Err(Error::BlockDestroyed(self.id));
        }
        match level {
            ReplicaState::Master => {
                if self.owner_data.master_waitlist.is_empty() {
                    let master = self.current_master()?;
                    self.owner_data.target = node;
                    self.owner_data.master_waitlist.push_back(node);
                    self.owner_data.master = None;
                    self.send(fx, master, BlockMessage::ReleaseMasterRequest);
                } else if self.owner_data.master_waitlist.back() != Some(&node) {
                    self.owner_data.master_waitlist.push_back(node);
                }
            }
            ReplicaState::Copy => {
                let Target::Node(recipient) = node else {
                    return Err(self.violation("copy requested for a non-node"));
                };
                if self.owner_data.master == Some(node) {
                    return Ok(());
                }
                match self.owner_data.master {
                    Some(Target::Node(master)) if self.owner_data.master == Some(self.owner_data.target) => {
                        self.send(fx, master, BlockMessage::TransferDataToCopy { recipient });
                    }
                    _ => self.owner_data.copy_waitlist.push_back(recipient),
                }
            }
            ReplicaState::Invalid => return Err(self.violation("elevation to invalid")),
        }
        Ok(())
    }

    fn current_master(&self) -> Result<NodeId, Error> {
        match self.owner_data.master {
            Some(Target::Node(node)) => Ok(node),
            _ => Err(self.violation("no stable master")),
        }
    }

    fn owner_master_released(&mut self, copylist: Vec<NodeId>, fx: &mut Effects) -> Result<(), Error> {
        self.check_owner()?;
        match self.owner_data.target {
            Target::Destroy => {
                for node in copylist {
                    self.send(fx, node, BlockMessage::InvalidateCopy);
                }
                self.destroyed = true;
                self.owner_data.master = Some(Target::Destroy);
            }
            Target::Node(target) => self.send(fx, target, BlockMessage::TakeMaster(copylist)),
        }
        Ok(())
    }

    fn owner_new_master_ready(&mut self, sender: NodeId, fx: &mut Effects) -> Result<(), Error> {
        self.check_owner()?;
        if self.owner_data.target != Target::Node(sender) {
            return Err(self.violation("unexpected node became master"));
        }
        self.owner_data.master_waitlist.pop_front();
        self.owner_data.master = Some(Target::Node(sender));
        while let Some(node) = self.owner_data.copy_waitlist.pop_front() {
            if node != sender {
                self.send(fx, sender, BlockMessage::TransferDataToCopy { recipient: node });
            }
        }
        if let Some(&next) = self.owner_data.master_waitlist.front() {
            self.owner_data.target = next;
            self.owner_data.master = None;
            self.send(fx, sender, BlockMessage::ReleaseMasterRequest);
        }
        Ok(())
    }

    fn master_release(&mut self, fx: &mut Effects) -> Result<(), Error> {
        if self.state != ReplicaState::Master {
            return Err(self.violation("release requested from a non-master"));
        }
        self.state = ReplicaState::Copy;
        self.update_master_state(fx);
        Ok(())
    }

    fn master_copy_received(&mut self, fx: &mut Effects) -> Result<(), Error> {
        let pending = &mut self.master_data.pending_copies;
        *pending = pending
            .checked_sub(1)
            .ok_or(Error::ProtocolViolation { id: self.id, what: "unexpected copy acknowledgement" })?;
        if *pending == 0 {
            self.update_master_state(fx);
        }
        Ok(())
    }

    fn master_transfer_to_copy(&mut self, recipient: NodeId, fx: &mut Effects) -> Result<(), Error> {
        if !self.has_copylist {
            return Err(self.violation("copy requested from a replica without copy list"));
        }
        if self.copylist.contains(&recipient) {
            return Ok(());
        }
        if self.can_provide_copies() {
            let data = self.contents()?;
            self.master_data.pending_copies += 1;
            self.send(fx, recipient, BlockMessage::DataCopy(data));
            self.copylist.push(recipient);
        } else {
            self.master_data.copy_waitlist.push_back(recipient);
        }
        self.update_master_state(fx);
        Ok(())
    }

    fn master_invalidated(&mut self, fx: &mut Effects) -> Result<(), Error> {
        if self.is_owner() && self.owner_data.master == Some(Target::Destroy) {
            return Ok(());
        }
        if !self.has_copylist {
            return Err(self.violation("invalidation acknowledged to a replica without copy list"));
        }
        let pending = &mut self.master_data.pending_invalidations;
        *pending = pending
            .checked_sub(1)
            .ok_or(Error::ProtocolViolation { id: self.id, what: "unexpected invalidation acknowledgement" })?;
        if *pending == 0 {
            let tasks = mem::take(&mut self.master_data.tasks_waiting_for_invalidation);
            self.update_master_state(fx);
            fx.extend(tasks.into_iter().map(Effect::RemoteUpdated));
        }
        Ok(())
    }

    fn copy_transfer_to_new_master(&mut self, recipient: NodeId, fx: &mut Effects) -> Result<(), Error> {
        if self.state != ReplicaState::Copy {
            return Err(self.violation("data requested from a replica that is not a copy"));
        }
        let data = self.contents()?;
        self.send(fx, recipient, BlockMessage::Data(data));
        Ok(())
    }

    fn copy_take_master(&mut self, mut copylist: Vec<NodeId>, fx: &mut Effects) -> Result<(), Error> {
        self.has_copylist = true;
        if let Some(pos) = copylist.iter().position(|&n| n == self.me) {
            if self.state != ReplicaState::Copy {
                return Err(self.violation("listed as copy without data"));
            }
            copylist.remove(pos);
            self.copylist = copylist;
            self.state = ReplicaState::Master;
            self.send(fx, self.owner, BlockMessage::IsMaster);
            self.grant_locks(fx);
        } else {
            if self.state != ReplicaState::Invalid {
                return Err(self.violation("unlisted replica holds data"));
            }
            let Some(&source) = copylist.first() else {
                return Err(self.violation("mastership handed over without copies"));
            };
            self.copylist = copylist;
            let me = self.me;
            self.send(fx, source, BlockMessage::TransferDataToNewMaster { recipient: me });
        }
        Ok(())
    }

    fn invalid_become_master(&mut self, data: Vec<u8>, fx: &mut Effects) -> Result<(), Error> {
        if self.state != ReplicaState::Invalid || !self.has_copylist {
            return Err(self.violation("master data sent to a replica not taking over"));
        }
        self.take_contents(data)?;
        self.state = ReplicaState::Master;
        self.send(fx, self.owner, BlockMessage::IsMaster);
        self.grant_locks(fx);
        Ok(())
    }

    fn become_copy(&mut self, sender: NodeId, data: Vec<u8>, fx: &mut Effects) -> Result<(), Error> {
        self.take_contents(data)?;
        self.state = ReplicaState::Copy;
        self.send(fx, sender, BlockMessage::CopyReceived);
        self.grant_locks(fx);
        Ok(())
    }

    fn copy_invalidate(&mut self, master: NodeId, fx: &mut Effects) -> Result<(), Error> {
        if self.state != ReplicaState::Copy {
            return Err(self.violation("invalidated a replica that is not a copy"));
        }
        self.state = ReplicaState::Invalid;
        self.buffer = None;
        self.send(fx, master, BlockMessage::CopyInvalidated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use AccessMode::*;

    const OWNER: NodeId = 0;

    /// Every node's replica of one block plus the messages in flight.
    struct Net {
        replicas: Vec<DataBlock>,
        wire: VecDeque<(NodeId, NodeId, BlockMessage)>,
        granted: Vec<(NodeId, GlobalId)>,
        updated: Vec<GlobalId>,
    }

    impl Net {
        fn new(nodes: u32, len: u64) -> Self {
            let id = GlobalId::direct(OWNER, 5);
            let replicas = (0..nodes)
                .map(|n| {
                    if n == OWNER {
                        DataBlock::new(id, n, OWNER, len, 0, 0)
                    } else {
                        DataBlock::invalid(id, n, OWNER, len, 0, OWNER)
                    }
                })
                .collect();
            Self { replicas, wire: VecDeque::new(), granted: Vec::new(), updated: Vec::new() }
        }

        fn absorb(&mut self, node: NodeId, fx: Effects) {
            for effect in fx {
                match effect {
                    Effect::Send { to, msg } => self.wire.push_back((node, to, msg)),
                    Effect::Granted { task, .. } => self.granted.push((node, task)),
                    Effect::RemoteUpdated(task) => self.updated.push(task),
                }
            }
        }

        fn lock(&mut self, node: NodeId, task: GlobalId, mode: AccessMode) -> bool {
            let mut fx = Vec::new();
            let granted = self.replicas[node as usize].try_lock(task, mode, &mut fx);
            self.absorb(node, fx);
            granted
        }

        fn unlock(&mut self, node: NodeId, mode: AccessMode) {
            let mut fx = Vec::new();
            self.replicas[node as usize].unlock(mode, &mut fx).unwrap();
            self.absorb(node, fx);
        }

        fn finish_writer(&mut self, node: NodeId, task: GlobalId) -> bool {
            let mut fx = Vec::new();
            let done = self.replicas[node as usize].writer_finished(task, &mut fx);
            self.absorb(node, fx);
            done
        }

        fn run(&mut self) {
            while let Some((from, to, msg)) = self.wire.pop_front() {
                let mut fx = Vec::new();
                self.replicas[to as usize].handle(from, msg, &mut fx).unwrap();
                self.absorb(to, fx);
                assert!(self.masters() <= 1, "two masters after a message to node {}", to);
            }
        }

        fn masters(&self) -> usize {
            self.replicas
                .iter()
                .filter(|r| r.state == ReplicaState::Master)
                .count()
        }

        fn state(&self, node: NodeId) -> ReplicaState {
            self.replicas[node as usize].state
        }
    }

    fn task(n: u32) -> GlobalId {
        GlobalId::direct(0, 100 + n)
    }

    #[test]
    fn test_ew_waits_for_shared_writer() {
        let mut net = Net::new(1, 8);
        assert!(net.lock(0, task(1), Rw));
        assert!(!net.lock(0, task(2), Ew));
        assert!(net.granted.is_empty());
        net.unlock(0, Rw);
        assert_eq!(net.granted, vec![(0, task(2))]);
        assert!(net.replicas[0].locks.exclusive_write);
    }

    #[test]
    fn test_const_waiters_are_granted_together() {
        let mut net = Net::new(1, 8);
        assert!(net.lock(0, task(1), Rw));
        assert!(!net.lock(0, task(2), Const));
        assert!(!net.lock(0, task(3), Const));
        assert!(net.lock(0, task(4), Rw));
        net.unlock(0, Rw);
        assert!(net.granted.is_empty());
        net.unlock(0, Rw);
        assert_eq!(net.granted, vec![(0, task(2)), (0, task(3))]);
        assert_eq!(net.replicas[0].locks.exclusive, 2);
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let mut net = Net::new(1, 8);
        let mut fx = Vec::new();
        assert!(matches!(
            net.replicas[0].unlock(Ro, &mut fx),
            Err(Error::LockNotHeld(_))
        ));
    }

    #[test]
    fn test_remote_writer_takes_mastership() {
        let mut net = Net::new(3, 4);
        net.replicas[0].buffer.as_ref().unwrap().write()[0] = 7;
        assert!(!net.lock(2, task(1), Rw));
        net.run();
        assert_eq!(net.granted, vec![(2, task(1))]);
        assert_eq!(net.state(2), ReplicaState::Master);
        assert_eq!(net.state(0), ReplicaState::Copy);
        assert_eq!(net.replicas[0].owner_data.master, Some(Target::Node(2)));
        assert_eq!(net.replicas[2].buffer.as_ref().unwrap().to_vec(), vec![7, 0, 0, 0]);
        assert_eq!(net.replicas[2].copylist, vec![0]);
        assert_eq!(net.masters(), 1);
    }

    #[test]
    fn test_writer_waits_for_invalidation_of_copies() {
        let mut net = Net::new(2, 4);
        assert!(!net.lock(1, task(1), Ro));
        net.run();
        assert_eq!(net.granted, vec![(1, task(1))]);
        assert_eq!(net.state(1), ReplicaState::Copy);
        assert_eq!(net.replicas[0].copylist, vec![1]);
        net.unlock(1, Ro);

        assert!(net.lock(0, task(2), Rw));
        assert!(!net.finish_writer(0, task(2)));
        net.unlock(0, Rw);
        assert!(net.updated.is_empty());
        net.run();
        assert_eq!(net.updated, vec![task(2)]);
        assert_eq!(net.state(1), ReplicaState::Invalid);
        assert!(net.replicas[1].buffer.is_none());
        assert!(net.finish_writer(0, task(3)));
    }

    #[test]
    fn test_copy_request_waits_for_writer() {
        let mut net = Net::new(2, 4);
        assert!(net.lock(0, task(1), Ew));
        assert!(!net.lock(1, task(2), Ro));
        net.run();
        assert!(net.granted.is_empty());
        assert_eq!(net.replicas[0].master_data.copy_waitlist, VecDeque::from([1]));
        net.replicas[0].buffer.as_ref().unwrap().write()[1] = 3;
        assert!(net.finish_writer(0, task(1)));
        net.unlock(0, Ew);
        net.run();
        assert_eq!(net.granted, vec![(1, task(2))]);
        assert_eq!(net.replicas[1].buffer.as_ref().unwrap().to_vec(), vec![0, 3, 0, 0]);
    }

    #[test]
    fn test_mastership_returns_to_owner() {
        let mut net = Net::new(2, 4);
        assert!(!net.lock(1, task(1), Ew));
        net.run();
        net.replicas[1].buffer.as_ref().unwrap().write()[3] = 9;
        // The owner kept a copy when it handed mastership over.
        assert!(!net.finish_writer(1, task(1)));
        net.unlock(1, Ew);
        assert!(!net.lock(0, task(2), Rw));
        net.run();
        assert_eq!(net.updated, vec![task(1)]);
        assert_eq!(net.granted, vec![(1, task(1)), (0, task(2))]);
        assert_eq!(net.state(0), ReplicaState::Master);
        assert_eq!(net.replicas[0].buffer.as_ref().unwrap().to_vec(), vec![0, 0, 0, 9]);
        assert_eq!(net.masters(), 1);
    }

    #[test]
    fn test_destroy_invalidates_every_replica() {
        let mut net = Net::new(3, 4);
        net.lock(1, task(1), Ro);
        net.lock(2, task(2), Ro);
        net.run();
        net.unlock(1, Ro);
        net.unlock(2, Ro);
        let mut fx = Vec::new();
        net.replicas[0].destroy(&mut fx).unwrap();
        net.absorb(0, fx);
        net.run();
        assert!(net.replicas[0].destroyed);
        for node in 0..3 {
            assert_eq!(net.state(node), ReplicaState::Invalid);
        }
        let mut fx = Vec::new();
        assert!(matches!(
            net.replicas[0].handle(1, BlockMessage::ElevationRequest { node: 1, level: ReplicaState::Copy }, &mut fx),
            Err(Error::BlockDestroyed(_))
        ));
    }

    #[test]
    fn test_elevation_is_owner_only() {
        let mut net = Net::new(2, 4);
        let mut fx = Vec::new();
        assert!(matches!(
            net.replicas[1].handle(0, BlockMessage::ElevationRequest { node: 0, level: ReplicaState::Master }, &mut fx),
            Err(Error::NotOwner(_))
        ));
    }
}
