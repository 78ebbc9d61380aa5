//! Bolero fuzzer for the shared ring counter discipline.
//!
//! Properties tested:
//! - fill never exceeds count (capacity)
//! - FIFO order, checked against a shadow queue
//! - unpop reinserts ahead of older entries
//! - counters only ever move by one step per op, rdptr retreat only on unpop

use bolero::check;
use shmlink_fuzz::ring_model::RingModel;

fn main() {
    check!()
        .with_type::<(u8, Vec<(u8, u64)>)>()
        .for_each(|(count_byte, ops)| {
            // Ring sizes 1..=8, power-of-two and not.
            let count = (*count_byte as u32 % 8) + 1;
            let mut model = RingModel::new(count);
            if let Err(e) = model.execute_and_verify(ops) {
                panic!("ring invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    use shmlink_fuzz::ring_model::RingModel;

    #[test]
    fn fuzz_ring_basic() {
        let ops: Vec<(u8, u64)> = vec![(0, 1), (0, 2), (1, 0), (2, 9), (1, 0), (1, 0)];
        RingModel::new(4).execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn fuzz_ring_overdrive() {
        // More pushes than capacity; the refusals must keep fill bounded.
        let ops: Vec<(u8, u64)> = (0..32).map(|i| (0, i)).collect();
        RingModel::new(3).execute_and_verify(&ops).unwrap();
    }
}
