//! The topology table: which node owns which range of the key space.

/// Total key-space partitions in a cluster.
pub const SLOT_COUNT: u16 = 16384;

// CRC-16/XMODEM, the checksum the store uses for key placement.
const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = crc16_table();

pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) ^ byte as u16) & 0xff) as usize]
    })
}

/// Map a key to its slot, honoring `{tag}` hash tags: when the key contains
/// a non-empty brace-delimited tag, only the tag is hashed, so related keys
/// can be pinned to one node.
pub fn key_slot(key: &[u8]) -> u16 {
    let hashed = match key.iter().position(|&byte| byte == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&byte| byte == b'}') {
            Some(0) | None => key,
            Some(close) => &key[open + 1..open + 1 + close],
        },
        None => key,
    };
    crc16(hashed) % SLOT_COUNT
}

/// One contiguous range of slots and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    /// `host:port` of the primary serving the range.
    pub primary: String,
    pub replicas: Vec<String>,
}

impl SlotRange {
    /// The whole key space, for a store without cluster support.
    pub fn full(primary: String) -> SlotRange {
        SlotRange {
            start: 0,
            end: SLOT_COUNT - 1,
            primary,
            replicas: Vec::new(),
        }
    }

    /// A single slot, as learned from a `MOVED` redirection.
    pub fn single(slot: u16, primary: String) -> SlotRange {
        SlotRange {
            start: slot,
            end: slot,
            primary,
            replicas: Vec::new(),
        }
    }
}

/// The slot table. Ranges are kept sorted and non-overlapping; an insert
/// trims or splits whatever it lands on, so single-slot updates from
/// redirections coexist with the coarse ranges of a full refresh.
#[derive(Debug, Default)]
pub struct SlotMap {
    ranges: Vec<SlotRange>,
}

impl SlotMap {
    pub fn new() -> SlotMap {
        SlotMap { ranges: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn insert(&mut self, range: SlotRange) {
        let mut next = Vec::with_capacity(self.ranges.len() + 2);
        for old in self.ranges.drain(..) {
            if old.end < range.start || old.start > range.end {
                next.push(old);
                continue;
            }
            if old.start < range.start {
                next.push(SlotRange {
                    start: old.start,
                    end: range.start - 1,
                    primary: old.primary.clone(),
                    replicas: old.replicas.clone(),
                });
            }
            if old.end > range.end {
                next.push(SlotRange {
                    start: range.end + 1,
                    end: old.end,
                    primary: old.primary,
                    replicas: old.replicas,
                });
            }
        }
        next.push(range);
        next.sort_by_key(|range| range.start);
        self.ranges = next;
    }

    pub fn lookup(&self, slot: u16) -> Option<&SlotRange> {
        self.ranges
            .iter()
            .find(|range| range.start <= slot && slot <= range.end)
    }

    pub fn primary_for_key(&self, key: &[u8]) -> Option<&str> {
        self.lookup(key_slot(key)).map(|range| range.primary.as_str())
    }

    /// Any primary, for keyless commands.
    pub fn any_primary(&self) -> Option<&str> {
        self.ranges.first().map(|range| range.primary.as_str())
    }

    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }
}
