//! Randomized scattered-register layouts.
//!
//! Each VM owns one [`RegLayout`]: a shuffled role assignment for the
//! sixteen GPRs plus a scatter plan that splits every logical 64-bit guest
//! register into five bit ranges and places each range at a random free
//! interval of a random destination register. Destinations are the GPRs
//! left over after roles and temporaries are reserved, plus all sixteen XMM
//! registers.
//!
//! Invariants maintained here and checked by the tests:
//!
//! - the source ranges of a guest register partition `[0, 63]`;
//! - within any destination, occupied ranges are pairwise disjoint and lie
//!   inside the register;
//! - a destination range has the same width as its source range, and an XMM
//!   fragment never straddles a 64-bit lane.
//!
//! All randomness comes from the caller's [`Shuffler`], so a fixed seed
//! reproduces the exact layout.

use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::codec::{Gpr, HostReg, Xmm};
use crate::control::Shuffler;
use crate::error::{VirtError, VirtResult};

/// Number of VM-reserved role registers: vip, vsp, vregs, vcs, vcsret,
/// vbase.
pub const RESERVED_ROLES: usize = 6;

/// Number of source ranges each guest register is split into.
const SPLIT_RANGES: usize = 5;

/// An inclusive bit interval.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BitRange {
    /// First bit, inclusive.
    pub lo: u16,
    /// Last bit, inclusive.
    pub hi: u16,
}

impl BitRange {
    /// Width in bits.
    pub fn len(self) -> u16 {
        self.hi - self.lo + 1
    }

    /// Whether two ranges share any bit.
    pub fn overlaps(self, other: BitRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

/// One fragment of the scatter plan: guest bits `src` live at `dst` inside
/// `dst_reg`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MappedRange {
    /// Bits of the guest register.
    pub src: BitRange,
    /// Bits of the destination register.
    pub dst: BitRange,
    /// The destination register.
    pub dst_reg: HostReg,
}

/// The per-VM register schedule.
pub struct RegLayout {
    vm_order: [Gpr; 16],
    temp_count: u8,
    source_map: FxHashMap<Gpr, SmallVec<[MappedRange; SPLIT_RANGES]>>,
    dest_pool: Vec<HostReg>,
    dest_map: FxHashMap<HostReg, Vec<BitRange>>,
}

impl RegLayout {
    /// A layout with roles assigned but no mappings yet; call
    /// [`RegLayout::create_mappings`] next.
    pub fn new(rng: &mut Shuffler, temp_count: u8) -> Self {
        let mut layout = Self {
            vm_order: Gpr::ALL,
            temp_count,
            source_map: FxHashMap::default(),
            dest_pool: Vec::new(),
            dest_map: FxHashMap::default(),
        };
        layout.init_reg_order(rng);
        layout
    }

    /// Shuffle the role order and open the destination pool.
    fn init_reg_order(&mut self, rng: &mut Shuffler) {
        rng.shuffle(&mut self.vm_order);

        // The native stack pointer keeps its job: handlers call, push, and
        // return through it, so it can be neither a role, a temporary, nor
        // a scatter destination. Its guest value still lives in the plan.
        let rsp_at = self
            .vm_order
            .iter()
            .position(|&g| g == Gpr::Rsp)
            .expect("rsp is a gpr");
        self.vm_order.swap(rsp_at, 15);

        let blocked = RESERVED_ROLES + self.temp_count as usize;
        self.dest_pool.clear();
        for &gpr in &self.vm_order[blocked..15] {
            self.dest_pool.push(HostReg::Gpr(gpr));
        }
        for xmm in Xmm::all() {
            self.dest_pool.push(HostReg::Xmm(xmm));
        }
        for &dest in &self.dest_pool {
            self.dest_map.insert(dest, Vec::new());
        }
        trace!("vm order {:?}, {} destinations", self.vm_order, self.dest_pool.len());
    }

    /// Build the scatter plan for all sixteen guest registers.
    ///
    /// Each placement retries up to `retry_bound` times across freshly drawn
    /// destination registers before giving up with
    /// [`VirtError::AllocationFailure`].
    pub fn create_mappings(&mut self, rng: &mut Shuffler, retry_bound: u8) -> VirtResult<()> {
        for guest in Gpr::ALL {
            let ranges = split_points(rng);
            let mut plan: SmallVec<[MappedRange; SPLIT_RANGES]> = SmallVec::new();
            for src in ranges {
                let placed = self.place_range(rng, src.len(), retry_bound);
                let Some((dst_reg, dst)) = placed else {
                    return Err(VirtError::AllocationFailure(guest));
                };
                trace!("{guest}[{}..={}] -> {dst_reg}[{}..={}]", src.lo, src.hi, dst.lo, dst.hi);
                self.dest_map.get_mut(&dst_reg).expect("pooled dest").push(dst);
                plan.push(MappedRange { src, dst, dst_reg });
            }
            self.source_map.insert(guest, plan);
        }
        Ok(())
    }

    /// Try to place a range of `len` bits, drawing a new destination
    /// register for every attempt.
    fn place_range(
        &self,
        rng: &mut Shuffler,
        len: u16,
        retry_bound: u8,
    ) -> Option<(HostReg, BitRange)> {
        for _ in 0..retry_bound {
            let dst_reg = self.dest_pool[rng.uniform(self.dest_pool.len() as u64) as usize];
            let occupied = &self.dest_map[&dst_reg];
            if let Some(range) = find_avail_range(occupied, len, dst_reg.width_bits(), rng) {
                return Some((dst_reg, range));
            }
        }
        None
    }

    /// The scatter plan of a guest register.
    pub fn get_register_mapped_ranges(&self, guest: Gpr) -> &[MappedRange] {
        self.source_map
            .get(&guest)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Occupied intervals of a destination register.
    pub fn get_occupied_ranges(&self, host: HostReg) -> &[BitRange] {
        self.dest_map.get(&host).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Free intervals of a destination register, in ascending order.
    pub fn get_unoccupied_ranges(&self, host: HostReg) -> Vec<BitRange> {
        let bit_count = host.width_bits();
        let mut occupied = self.get_occupied_ranges(host).to_vec();
        occupied.sort_by_key(|r| r.lo);

        let mut unoccupied = Vec::new();
        let mut current = 0u16;
        for range in occupied {
            if range.lo > current {
                unoccupied.push(BitRange {
                    lo: current,
                    hi: range.lo - 1,
                });
            }
            current = range.hi + 1;
        }
        if current < bit_count {
            unoccupied.push(BitRange {
                lo: current,
                hi: bit_count - 1,
            });
        }
        unoccupied
    }

    /// VM instruction-pointer role; also carries inline handler operands.
    pub fn vip(&self) -> Gpr {
        self.vm_order[0]
    }

    /// VM stack-pointer role.
    pub fn vsp(&self) -> Gpr {
        self.vm_order[1]
    }

    /// Pointer to the VM context area.
    pub fn vregs(&self) -> Gpr {
        self.vm_order[2]
    }

    /// Code-segment role, carries the not-taken branch target.
    pub fn vcs(&self) -> Gpr {
        self.vm_order[3]
    }

    /// Return-segment role, carries the taken branch target.
    pub fn vcsret(&self) -> Gpr {
        self.vm_order[4]
    }

    /// Image-base role.
    pub fn vbase(&self) -> Gpr {
        self.vm_order[5]
    }

    /// Scratch temporary `n`.
    pub fn temp(&self, n: usize) -> Gpr {
        debug_assert!(n < self.temp_count as usize);
        self.vm_order[RESERVED_ROLES + n]
    }

    /// The destination pool, role and temp registers excluded.
    pub fn dest_pool(&self) -> &[HostReg] {
        &self.dest_pool
    }
}

/// Draw `SPLIT_RANGES - 1` distinct split points and return the resulting
/// source ranges covering `[0, 63]`.
fn split_points(rng: &mut Shuffler) -> [BitRange; SPLIT_RANGES] {
    let mut points: SmallVec<[u16; SPLIT_RANGES + 1]> = SmallVec::new();
    points.push(0);
    points.push(64);
    while points.len() < SPLIT_RANGES + 1 {
        let point = u16::from(rng.next_u8()) % 64;
        if !points.contains(&point) {
            points.push(point);
        }
    }
    points.sort_unstable();

    let mut ranges = [BitRange { lo: 0, hi: 0 }; SPLIT_RANGES];
    for i in 0..SPLIT_RANGES {
        ranges[i] = BitRange {
            lo: points[i],
            hi: points[i + 1] - 1,
        };
    }
    ranges
}

/// Find a free interval of `len` bits inside a register of `max_bit` bits,
/// trying legal start positions in random order.
///
/// Start positions that would straddle a 64-bit lane are never legal, so a
/// placed fragment always fits a single lane move.
fn find_avail_range(
    occupied: &[BitRange],
    len: u16,
    max_bit: u16,
    rng: &mut Shuffler,
) -> Option<BitRange> {
    let mut starts: Vec<u16> = (0..=max_bit - len)
        .filter(|&start| start / 64 == (start + len - 1) / 64)
        .collect();
    rng.shuffle(&mut starts);

    for start in starts {
        let candidate = BitRange {
            lo: start,
            hi: start + len - 1,
        };
        if occupied.iter().all(|r| !r.overlaps(candidate)) {
            return Some(candidate);
        }
    }
    None
}
