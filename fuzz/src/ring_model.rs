//! Model of one ring/pool structure: free-running u32 counters over a
//! fixed slot array, with a shadow queue recording what the contents must
//! be. Push/pop model the transfer-ring roles; unpop models the pool
//! taker handing a block back (the one legal counter retreat).

use std::collections::VecDeque;

/// One operation against the ring, as decoded from fuzz input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOp {
    Push(u64),
    Pop,
    Unpop(u64),
}

impl RingOp {
    /// Decode from a raw `(selector, payload)` pair so harnesses can feed
    /// plain tuples.
    pub fn decode(selector: u8, payload: u64) -> RingOp {
        match selector % 3 {
            0 => RingOp::Push(payload),
            1 => RingOp::Pop,
            _ => RingOp::Unpop(payload),
        }
    }
}

pub struct RingModel {
    count: u32,
    rdptr: u32,
    wrptr: u32,
    slots: Vec<u64>,
    shadow: VecDeque<u64>,
}

impl RingModel {
    pub fn new(count: u32) -> Self {
        assert!(count > 0);
        Self {
            count,
            rdptr: 0,
            wrptr: 0,
            slots: vec![0; count as usize],
            shadow: VecDeque::new(),
        }
    }

    fn pos(&self, counter: u32) -> usize {
        if self.count.is_power_of_two() {
            (counter & (self.count - 1)) as usize
        } else {
            (counter % self.count) as usize
        }
    }

    pub fn fill(&self) -> u32 {
        self.wrptr.wrapping_sub(self.rdptr)
    }

    /// Apply one op; returns whether the ring accepted it.
    pub fn apply(&mut self, op: RingOp) -> bool {
        match op {
            RingOp::Push(v) => {
                if self.fill() >= self.count {
                    return false;
                }
                let pos = self.pos(self.wrptr);
                self.slots[pos] = v;
                self.wrptr = self.wrptr.wrapping_add(1);
                self.shadow.push_back(v);
                true
            }
            RingOp::Pop => {
                if self.fill() == 0 {
                    return false;
                }
                let pos = self.pos(self.rdptr);
                let got = self.slots[pos];
                self.rdptr = self.rdptr.wrapping_add(1);
                let want = self.shadow.pop_front().expect("shadow out of sync");
                assert_eq!(got, want, "popped descriptor differs from shadow");
                true
            }
            RingOp::Unpop(v) => {
                if self.fill() >= self.count {
                    return false;
                }
                self.rdptr = self.rdptr.wrapping_sub(1);
                let pos = self.pos(self.rdptr);
                self.slots[pos] = v;
                self.shadow.push_front(v);
                true
            }
        }
    }

    /// Capacity invariant plus shadow agreement.
    pub fn verify(&self) -> Result<(), String> {
        let fill = self.fill();
        if fill > self.count {
            return Err(format!(
                "capacity violated: fill {} > count {} (rd={:#x} wr={:#x})",
                fill, self.count, self.rdptr, self.wrptr
            ));
        }
        if fill as usize != self.shadow.len() {
            return Err(format!(
                "fill {} disagrees with shadow length {}",
                fill,
                self.shadow.len()
            ));
        }
        Ok(())
    }

    /// Run a decoded op sequence, checking invariants and counter
    /// monotonicity (unpop excepted, by one step) after every op.
    pub fn execute_and_verify(&mut self, ops: &[(u8, u64)]) -> Result<(), String> {
        for &(selector, payload) in ops {
            let op = RingOp::decode(selector, payload);
            let rd_before = self.rdptr;
            let wr_before = self.wrptr;
            self.apply(op);
            self.verify()?;

            let rd_delta = self.rdptr.wrapping_sub(rd_before);
            let wr_delta = self.wrptr.wrapping_sub(wr_before);
            let rd_ok = match op {
                RingOp::Unpop(_) => rd_delta == 0 || rd_delta == u32::MAX,
                _ => rd_delta <= 1,
            };
            if !rd_ok {
                return Err(format!("rdptr moved by {rd_delta} on {op:?}"));
            }
            if wr_delta > 1 {
                return Err(format!("wrptr moved by {wr_delta} on {op:?}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_checked_through_the_shadow() {
        let mut m = RingModel::new(4);
        assert!(m.apply(RingOp::Push(10)));
        assert!(m.apply(RingOp::Push(20)));
        assert!(m.apply(RingOp::Pop));
        assert!(m.apply(RingOp::Pop));
        assert!(!m.apply(RingOp::Pop));
        m.verify().unwrap();
    }

    #[test]
    fn full_ring_refuses_push_and_unpop() {
        let mut m = RingModel::new(2);
        assert!(m.apply(RingOp::Push(1)));
        assert!(m.apply(RingOp::Push(2)));
        assert!(!m.apply(RingOp::Push(3)));
        assert!(!m.apply(RingOp::Unpop(4)));
        m.verify().unwrap();
    }

    #[test]
    fn unpop_front_loads_before_older_entries() {
        let mut m = RingModel::new(4);
        m.apply(RingOp::Push(1));
        m.apply(RingOp::Push(2));
        m.apply(RingOp::Pop);
        m.apply(RingOp::Unpop(1));
        // Shadow expects 1 then 2; apply asserts on mismatch.
        m.apply(RingOp::Pop);
        m.apply(RingOp::Pop);
        m.verify().unwrap();
    }

    #[test]
    fn long_mixed_sequence_survives_counter_wrap_regions() {
        let mut m = RingModel::new(4);
        // Seed the counters near the wrap point.
        m.rdptr = u32::MAX - 2;
        m.wrptr = u32::MAX - 2;
        let ops: Vec<(u8, u64)> = (0..64).map(|i| ((i % 3) as u8, i as u64)).collect();
        m.execute_and_verify(&ops).unwrap();
    }
}
