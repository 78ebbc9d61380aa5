//! Model of one direction of a block channel: a pool of block ids, the
//! transfer ring, the local leases, and the peer's held set. Exercised to
//! show that the block multiset is conserved by every verb and that
//! recovery returns exactly the non-leased blocks to the pool.

use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    Get,
    Put,
    Send,
    Receive,
    Release,
    Recover,
}

impl TransportOp {
    pub fn decode(selector: u8) -> TransportOp {
        match selector % 6 {
            0 => TransportOp::Get,
            1 => TransportOp::Put,
            2 => TransportOp::Send,
            3 => TransportOp::Receive,
            4 => TransportOp::Release,
            _ => TransportOp::Recover,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportModel {
    total: usize,
    pool: VecDeque<usize>,
    ring: VecDeque<usize>,
    /// Blocks leased to a local caller (PENDING in the ownership table).
    leased: BTreeSet<usize>,
    /// Blocks the peer received and has not released.
    peer_held: BTreeSet<usize>,
}

impl TransportModel {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            pool: (0..total).collect(),
            ring: VecDeque::new(),
            leased: BTreeSet::new(),
            peer_held: BTreeSet::new(),
        }
    }

    pub fn apply(&mut self, op: TransportOp) -> bool {
        match op {
            TransportOp::Get => match self.pool.pop_front() {
                Some(b) => self.leased.insert(b),
                None => false,
            },
            TransportOp::Put => match self.leased.pop_first() {
                // put() retreats the taker counter: the block re-enters at
                // the front.
                Some(b) => {
                    self.pool.push_front(b);
                    true
                }
                None => false,
            },
            TransportOp::Send => match self.leased.pop_first() {
                Some(b) => {
                    self.ring.push_back(b);
                    true
                }
                None => false,
            },
            TransportOp::Receive => match self.ring.pop_front() {
                Some(b) => self.peer_held.insert(b),
                None => false,
            },
            TransportOp::Release => match self.peer_held.pop_first() {
                Some(b) => {
                    self.pool.push_back(b);
                    true
                }
                None => false,
            },
            TransportOp::Recover => {
                // Peer reboot: in-flight and peer-held blocks were DONE in
                // the local table, so they all return to the pool; leased
                // blocks stay out until put().
                let mut pool: BTreeSet<usize> = self.pool.iter().copied().collect();
                pool.extend(self.ring.drain(..));
                pool.extend(std::mem::take(&mut self.peer_held));
                self.pool = pool.into_iter().collect();
                true
            }
        }
    }

    /// Every block is in exactly one place and the totals add up.
    pub fn verify(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        let places = self
            .pool
            .iter()
            .chain(self.ring.iter())
            .chain(self.leased.iter())
            .chain(self.peer_held.iter());
        let mut n = 0usize;
        for &b in places {
            if b >= self.total {
                return Err(format!("unknown block id {b}"));
            }
            if !seen.insert(b) {
                return Err(format!("block {b} appears twice"));
            }
            n += 1;
        }
        if n != self.total {
            return Err(format!("{n} blocks accounted for, expected {}", self.total));
        }
        Ok(())
    }

    pub fn execute_and_verify(&mut self, selectors: &[u8]) -> Result<(), String> {
        for &s in selectors {
            let op = TransportOp::decode(s);
            self.apply(op);
            self.verify()?;

            if op == TransportOp::Recover {
                // Idempotent: a second pass changes nothing.
                let snapshot = self.clone();
                self.apply(TransportOp::Recover);
                if *self != snapshot {
                    return Err("recovery is not idempotent".to_owned());
                }
                // Exactly the leased blocks stay out of the pool.
                if self.pool.len() + self.leased.len() != self.total {
                    return Err("recovery lost or duplicated blocks".to_owned());
                }
                if !self.ring.is_empty() || !self.peer_held.is_empty() {
                    return Err("recovery left blocks in flight".to_owned());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_verb_conserves_the_multiset() {
        let mut m = TransportModel::new(4);
        for op in [
            TransportOp::Get,
            TransportOp::Send,
            TransportOp::Receive,
            TransportOp::Release,
            TransportOp::Get,
            TransportOp::Put,
        ] {
            assert!(m.apply(op));
            m.verify().unwrap();
        }
        assert_eq!(m.pool.len(), 4);
    }

    #[test]
    fn recovery_returns_everything_but_leases() {
        let mut m = TransportModel::new(4);
        m.apply(TransportOp::Get);
        m.apply(TransportOp::Send);
        m.apply(TransportOp::Receive); // one with the peer
        m.apply(TransportOp::Get);
        m.apply(TransportOp::Send); // one in the ring
        m.apply(TransportOp::Get); // one leased
        assert_eq!(m.pool.len(), 1);

        m.apply(TransportOp::Recover);
        m.verify().unwrap();
        assert_eq!(m.pool.len(), 3);
        assert_eq!(m.leased.len(), 1);
        assert!(m.ring.is_empty());
        assert!(m.peer_held.is_empty());

        m.apply(TransportOp::Put);
        assert_eq!(m.pool.len(), 4);
    }

    #[test]
    fn empty_structures_refuse_their_verbs() {
        let mut m = TransportModel::new(1);
        assert!(!m.apply(TransportOp::Put));
        assert!(!m.apply(TransportOp::Receive));
        assert!(!m.apply(TransportOp::Release));
        assert!(m.apply(TransportOp::Get));
        assert!(!m.apply(TransportOp::Get));
        m.verify().unwrap();
    }
}
