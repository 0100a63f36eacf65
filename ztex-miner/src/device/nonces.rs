//! Nonce slot readout and duplicate suppression.

pub const REQ_READ_NONCES: u8 = 0x81;

/// Bytes per slot in a read-nonces reply.
pub const SLOT_LEN: usize = 12;

/// One hashing core's state as of the last poll.
///
/// Values are already corrected for the descriptor's nonce offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceSlot {
    /// Last golden candidate the core found for the active work.
    pub golden: u32,
    /// Free-running counter of the core.
    pub counter: u32,
    /// Witness word belonging to `counter` (give or take the pipeline).
    pub witness: u32,
    /// The reply carried no golden candidate.
    pub golden_empty: bool,
}

impl NonceSlot {
    /// The counter has run into the upper half of the nonce range (or was
    /// never refreshed), so fresh work is due.
    pub fn needs_work(&self) -> bool {
        (self.counter as i32) < 0
    }
}

fn le_word(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Parse a read-nonces reply and fold it into `slots`.
///
/// Returns `(overflow, moved)`: whether any counter's upper 28 bits went
/// backwards since the previous poll (the counter wrapped past a full
/// window between polls), and which slots' counters changed.
pub fn update_slots(buf: &[u8], offset: i32, slots: &mut [NonceSlot]) -> (bool, Vec<bool>) {
    let mut overflow = false;
    let mut moved = Vec::with_capacity(slots.len());
    let bias = offset as u32;
    for (i, slot) in slots.iter_mut().enumerate() {
        let base = i * SLOT_LEN;
        let raw_golden = le_word(buf, base);
        let counter = le_word(buf, base + 4).wrapping_sub(bias);
        overflow |= (counter >> 4) < (slot.counter >> 4);
        moved.push(counter != slot.counter);
        *slot = NonceSlot {
            golden: raw_golden.wrapping_sub(bias),
            counter,
            witness: le_word(buf, base + 8),
            golden_empty: raw_golden == 0,
        };
    }
    (overflow, moved)
}

/// The last few submitted nonces, most recent first.
///
/// A core keeps reporting its last golden nonce until it finds another one
/// or gets new work, so consecutive polls see the same value repeatedly.
#[derive(Debug, Clone, Default)]
pub struct RecentSubmissions {
    nonces: [u32; Self::CAPACITY],
}

impl RecentSubmissions {
    pub const CAPACITY: usize = 8;

    pub fn contains(&self, nonce: u32) -> bool {
        self.nonces.contains(&nonce)
    }

    pub fn push(&mut self, nonce: u32) {
        self.nonces.rotate_right(1);
        self.nonces[0] = nonce;
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.nonces
    }
}
