use std::collections::VecDeque;

use super::{Postslot, Preslot, Signal, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
use crate::{
    block::AccessMode,
    checkpoint::{Checkpoint, Reader, Writer},
    error::Error,
    id::GlobalId,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Fires once and is destroyed.
    Once = 0,
    /// Fires once; later satisfactions are ignored.
    Idempotent = 1,
    /// Fires once and stays; satisfying it again is an error.
    Sticky = 2,
    /// Fires when its counter drops to zero.
    Latch = 3,
    /// Pairs every satisfaction with one waiting post-slot, in order.
    Channel = 4,
}

impl TryFrom<u8> for EventKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventKind::Once),
            1 => Ok(EventKind::Idempotent),
            2 => Ok(EventKind::Sticky),
            3 => Ok(EventKind::Latch),
            4 => Ok(EventKind::Channel),
            _ => Err(Error::MalformedMessage("unknown event kind")),
        }
    }
}

/// What a satisfaction or new post-slot set in motion.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fire {
    pub signals: Vec<Signal>,
    /// The event triggered with this call.
    pub fired: bool,
    /// The event destroyed itself with this call.
    pub destroyed: bool,
}

#[derive(Debug)]
pub struct Event {
    pub(crate) id: GlobalId,
    pub(crate) kind: EventKind,
    pub(crate) takes_arg: bool,
    pub(crate) preslot: Preslot,
    pub(crate) postslots: Vec<Postslot>,
    pub(crate) triggered: bool,
    pub(crate) destroyed: bool,
    pub(crate) latch: i64,
    pub(crate) data: GlobalId,
    pub(crate) channel_in: VecDeque<GlobalId>,
    pub(crate) channel_out: VecDeque<Postslot>,
}

impl Event {
    pub fn new(id: GlobalId, kind: EventKind, takes_arg: bool, latch_initial: u64) -> Self {
        Self {
            id,
            kind,
            takes_arg,
            preslot: Preslot::default(),
            postslots: Vec::new(),
            triggered: false,
            destroyed: false,
            latch: latch_initial as i64,
            data: GlobalId::NULL,
            channel_in: VecDeque::new(),
            channel_out: VecDeque::new(),
        }
    }

    pub fn id(&self) -> GlobalId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn takes_arg(&self) -> bool {
        self.takes_arg
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn latch_count(&self) -> i64 {
        self.latch
    }

    /// Events wait for their sources to signal; only a null source
    /// satisfies the slot right away.
    pub fn add_preslot(
        &mut self,
        source: GlobalId,
        _mode: AccessMode,
        slot: u32,
    ) -> Result<Fire, Error> {
        if source.is_null() {
            return self.satisfy(slot, source);
        }
        Ok(Fire::default())
    }

    pub fn satisfy(&mut self, slot: u32, data: GlobalId) -> Result<Fire, Error> {
        match self.kind {
            EventKind::Channel => self.channel_put(slot, data),
            EventKind::Latch => self.latch_satisfy(slot),
            _ => self.trigger(slot, data),
        }
    }

    fn channel_put(&mut self, slot: u32, data: GlobalId) -> Result<Fire, Error> {
        self.check_slot(slot, 1)?;
        if self.destroyed {
            return Err(Error::EventDestroyed(self.id));
        }
        let mut fire = Fire::default();
        match self.channel_out.pop_front() {
            Some(waiting) => fire.signals.push(waiting.signal(data)),
            None => self.channel_in.push_back(data),
        }
        Ok(fire)
    }

    fn latch_satisfy(&mut self, slot: u32) -> Result<Fire, Error> {
        self.check_slot(slot, 2)?;
        if slot == LATCH_INCR_SLOT {
            if self.triggered {
                return Err(Error::LatchIncrementAfterFire(self.id));
            }
            self.latch += 1;
            return Ok(Fire::default());
        }
        debug_assert_eq!(slot, LATCH_DECR_SLOT);
        if self.triggered || self.latch <= 0 {
            return Err(Error::LatchUnderflow(self.id));
        }
        self.latch -= 1;
        if self.latch > 0 {
            return Ok(Fire::default());
        }
        self.triggered = true;
        self.destroyed = true;
        Ok(self.fire(GlobalId::NULL, true))
    }

    fn trigger(&mut self, slot: u32, data: GlobalId) -> Result<Fire, Error> {
        self.check_slot(slot, 1)?;
        if self.triggered {
            return match self.kind {
                EventKind::Idempotent => Ok(Fire::default()),
                _ => Err(Error::EventAlreadyFired(self.id)),
            };
        }
        if self.destroyed {
            return Err(Error::EventDestroyed(self.id));
        }
        self.preslot = Preslot { satisfied: true, data, mode: self.preslot.mode };
        self.triggered = true;
        let destroyed = self.kind == EventKind::Once;
        self.destroyed |= destroyed;
        Ok(self.fire(data, destroyed))
    }

    fn fire(&mut self, data: GlobalId, destroyed: bool) -> Fire {
        self.data = data;
        Fire {
            signals: self.postslots.iter().map(|p| p.signal(data)).collect(),
            fired: true,
            destroyed,
        }
    }

    pub fn add_postslot(&mut self, postslot: Postslot) -> Result<Fire, Error> {
        let mut fire = Fire::default();
        if self.kind == EventKind::Channel {
            if self.destroyed {
                return Err(Error::EventDestroyed(self.id));
            }
            match self.channel_in.pop_front() {
                Some(data) => fire.signals.push(postslot.signal(data)),
                None => self.channel_out.push_back(postslot),
            }
            return Ok(fire);
        }
        if self.destroyed && !self.triggered {
            return Err(Error::EventDestroyed(self.id));
        }
        self.postslots.push(postslot);
        if self.triggered {
            fire.signals.push(postslot.signal(self.data));
        }
        Ok(fire)
    }

    /// Explicit destruction. Returns false when the event was already gone.
    pub fn destroy(&mut self) -> bool {
        !std::mem::replace(&mut self.destroyed, true)
    }

    fn check_slot(&self, slot: u32, count: u32) -> Result<(), Error> {
        if slot >= count {
            return Err(Error::SlotOutOfRange { id: self.id, slot });
        }
        Ok(())
    }
}

impl Checkpoint for Event {
    fn save<W: Writer>(&self, w: &mut W) {
        self.id.save(w);
        w.write_value("kind", self.kind as u64);
        w.write_value("takes_arg", self.takes_arg as u64);
        self.preslot.save(w);
        w.write_sequence("postslots", &self.postslots);
        w.write_value("triggered", self.triggered as u64);
        w.write_value("destroyed", self.destroyed as u64);
        w.write_value("latch", self.latch as u64);
        self.data.save(w);
        w.write_sequence("channel_in", &self.channel_in);
        w.write_sequence("channel_out", &self.channel_out);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            id: GlobalId::load(r)?,
            kind: EventKind::try_from(r.read_value("kind")? as u8)?,
            takes_arg: r.read_bool("takes_arg")?,
            preslot: Preslot::load(r)?,
            postslots: r.read_sequence("postslots")?,
            triggered: r.read_bool("triggered")?,
            destroyed: r.read_bool("destroyed")?,
            latch: r.read_value("latch")? as i64,
            data: GlobalId::load(r)?,
            channel_in: r.read_sequence::<GlobalId>("channel_in")?.into(),
            channel_out: r.read_sequence::<Postslot>("channel_out")?.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postslot(n: u32) -> Postslot {
        Postslot { destination: GlobalId::direct(1, 100 + n), slot: n }
    }

    fn data(n: u32) -> GlobalId {
        GlobalId::direct(0, 50 + n)
    }

    #[test]
    fn test_once_fires_all_postslots_and_destroys_itself() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Once, true, 0);
        e.add_postslot(postslot(0)).unwrap();
        e.add_postslot(postslot(1)).unwrap();
        let fire = e.satisfy(0, data(1)).unwrap();
        assert!(fire.fired && fire.destroyed);
        assert_eq!(fire.signals, vec![postslot(0).signal(data(1)), postslot(1).signal(data(1))]);
        assert!(matches!(e.satisfy(0, data(2)), Err(Error::EventAlreadyFired(_))));
    }

    #[test]
    fn test_postslot_after_trigger_is_satisfied_at_once() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Sticky, true, 0);
        e.satisfy(0, data(3)).unwrap();
        let fire = e.add_postslot(postslot(2)).unwrap();
        assert_eq!(fire.signals, vec![postslot(2).signal(data(3))]);
        assert!(!fire.fired);
    }

    #[test]
    fn test_idempotent_ignores_later_satisfactions() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Idempotent, true, 0);
        e.add_postslot(postslot(0)).unwrap();
        assert!(e.satisfy(0, data(1)).unwrap().fired);
        assert_eq!(e.satisfy(0, data(2)).unwrap(), Fire::default());
        assert!(!e.is_destroyed());
    }

    #[test]
    fn test_latch_counts_down_to_zero() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Latch, false, 2);
        e.add_postslot(postslot(0)).unwrap();
        assert!(!e.satisfy(LATCH_INCR_SLOT, GlobalId::NULL).unwrap().fired);
        assert!(!e.satisfy(LATCH_DECR_SLOT, GlobalId::NULL).unwrap().fired);
        assert!(!e.satisfy(LATCH_DECR_SLOT, GlobalId::NULL).unwrap().fired);
        let fire = e.satisfy(LATCH_DECR_SLOT, GlobalId::NULL).unwrap();
        assert!(fire.fired && fire.destroyed);
        assert_eq!(fire.signals.len(), 1);
        assert!(matches!(
            e.satisfy(LATCH_DECR_SLOT, GlobalId::NULL),
            Err(Error::LatchUnderflow(_))
        ));
        assert!(matches!(
            e.satisfy(LATCH_INCR_SLOT, GlobalId::NULL),
            Err(Error::LatchIncrementAfterFire(_))
        ));
    }

    #[test]
    fn test_latch_decrement_below_zero_is_fatal() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Latch, false, 0);
        assert!(matches!(
            e.satisfy(LATCH_DECR_SLOT, GlobalId::NULL),
            Err(Error::LatchUnderflow(_))
        ));
        assert!(matches!(e.satisfy(2, GlobalId::NULL), Err(Error::SlotOutOfRange { slot: 2, .. })));
    }

    #[test]
    fn test_channel_pairs_values_with_waiters_in_order() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Channel, true, 0);
        assert!(e.satisfy(0, data(1)).unwrap().signals.is_empty());
        assert!(e.satisfy(0, data(2)).unwrap().signals.is_empty());
        assert_eq!(e.add_postslot(postslot(0)).unwrap().signals, vec![postslot(0).signal(data(1))]);
        assert_eq!(e.add_postslot(postslot(1)).unwrap().signals, vec![postslot(1).signal(data(2))]);
        assert!(e.add_postslot(postslot(2)).unwrap().signals.is_empty());
        assert_eq!(e.satisfy(0, data(3)).unwrap().signals, vec![postslot(2).signal(data(3))]);
    }

    #[test]
    fn test_null_source_satisfies_immediately() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Sticky, false, 0);
        assert!(!e.add_preslot(data(1), AccessMode::Ro, 0).unwrap().fired);
        assert!(e.add_preslot(GlobalId::NULL, AccessMode::Ro, 0).unwrap().fired);
    }

    #[test]
    fn test_destroyed_event_rejects_new_postslots() {
        let mut e = Event::new(GlobalId::direct(0, 4), EventKind::Sticky, false, 0);
        assert!(e.destroy());
        assert!(!e.destroy());
        assert!(matches!(e.add_postslot(postslot(0)), Err(Error::EventDestroyed(_))));
    }
}
