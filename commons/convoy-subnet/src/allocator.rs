use std::cmp::Ordering;

use crate::cidr::Ipv4Cidr;
use crate::error::AllocationError;

pub const HOSTS_PER_24: u64 = 254;
pub const HOSTS_PER_25: u64 = 126;

/// Carves consecutive, non-overlapping subnets out of a base block.
///
/// The allocator keeps no state beyond a cursor (the last block handed out
/// or seeded), so callers rebuild it on every pass from the ranges that are
/// observed to be in use. Identical inputs always yield identical output.
#[derive(Clone, Debug)]
pub struct SubnetAllocator {
    base: Ipv4Cidr,
    cursor: Option<Ipv4Cidr>,
}

impl SubnetAllocator {
    pub fn new(base: Ipv4Cidr) -> Self {
        Self { base, cursor: None }
    }

    /// Seeds the cursor from the ranges already in use.
    ///
    /// Ranges are ordered by start address; on equal starts the containing
    /// (shorter prefix) range sorts after the contained one so the widest
    /// range anchors the cursor. Ranges outside the base block are ignored.
    pub fn init(&mut self, used: &[Ipv4Cidr]) {
        let mut ranges: Vec<Ipv4Cidr> = used
            .iter()
            .filter(|r| r.overlaps(&self.base))
            .copied()
            .collect();
        ranges.sort_by(order_ranges);
        // A range nested in an earlier, wider one must not pull the cursor back.
        self.cursor = ranges
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.end().cmp(&b.end()).then(ia.cmp(ib)))
            .map(|(_, r)| *r);
    }

    pub fn base(&self) -> Ipv4Cidr {
        self.base
    }

    pub fn cursor(&self) -> Option<Ipv4Cidr> {
        self.cursor
    }

    /// Allocates the next block with at least `usable_hosts` usable addresses.
    pub fn generate_subnet(
        &mut self,
        usable_hosts: u64,
    ) -> Result<Ipv4Cidr, AllocationError> {
        let host_bits = host_bits_for(usable_hosts)?;
        let start = match self.cursor {
            None => u64::from(self.base.start()),
            Some(cursor) => {
                let shift = cursor.host_bits().max(host_bits);
                ((u64::from(cursor.start()) >> shift) + 1) << shift
            }
        };
        let end = start + (1u64 << host_bits) - 1;
        if end > u64::from(u32::MAX)
            || start < u64::from(self.base.start())
            || end > u64::from(self.base.end())
        {
            return Err(AllocationError::Exhausted {
                base: self.base.to_string(),
                cursor: self
                    .cursor
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "<unset>".into()),
                prefix: 32 - host_bits,
            });
        }
        let subnet = Ipv4Cidr::from_start(start as u32, host_bits);
        self.cursor = Some(subnet);
        Ok(subnet)
    }

    pub fn generate_next_24(&mut self) -> Result<Ipv4Cidr, AllocationError> {
        self.generate_subnet(HOSTS_PER_24)
    }

    pub fn generate_next_25(&mut self) -> Result<Ipv4Cidr, AllocationError> {
        self.generate_subnet(HOSTS_PER_25)
    }
}

fn order_ranges(a: &Ipv4Cidr, b: &Ipv4Cidr) -> Ordering {
    a.start()
        .cmp(&b.start())
        .then_with(|| b.prefix().cmp(&a.prefix()))
}

/// Smallest host-bit count whose block holds `usable_hosts` plus the
/// network and broadcast addresses.
fn host_bits_for(usable_hosts: u64) -> Result<u8, AllocationError> {
    let needed = usable_hosts.saturating_add(2);
    let mut bits = 0u8;
    while (1u64 << bits) < needed {
        bits += 1;
        if bits > 31 {
            return Err(AllocationError::TooLarge(usable_hosts));
        }
    }
    Ok(bits)
}
