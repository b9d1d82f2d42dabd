//! Programming targets and their memory layout.
//!
//! All address ranges are in program memory addresses (two addresses per
//! 24-bit program word) and are fixed at compile time.

/// Device id used for broadcast frames.
pub const BROADCAST_ID: u8 = 0;
/// Target id selecting the master itself.
pub const MASTER_ID: u8 = 0xFF;
/// Number of addressable slaves.
pub const N_SLAVES: u8 = 63;
/// Added to a slave id when the slave replies.
pub const REPLY_ID_OFFSET: u8 = 100;

/// Humidifier slave id.
pub const HUMIDIFIER_ID: u8 = 43;
/// Tinting slave id.
pub const TINTING_ID: u8 = 44;

/// Most upload packets a slave accepts.
pub const MAX_SLAVE_PACKETS: u16 = 10000;

/// `true` for ids a master may address and for slave reply ids.
pub fn is_valid_id(id: u8) -> bool {
    (1..=N_SLAVES).contains(&id)
        || (REPLY_ID_OFFSET + 1..=REPLY_ID_OFFSET + N_SLAVES).contains(&id)
}

/// Id a slave uses when answering the master.
pub fn reply_id(slave: u8) -> u8 {
    slave.wrapping_add(REPLY_ID_OFFSET)
}

/// Half-open address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    /// First address.
    pub start: u32,
    /// First address past the range.
    pub stop: u32,
}

impl AddressRange {
    /// Number of addresses covered.
    pub const fn len(&self) -> u32 {
        self.stop - self.start
    }

    /// `true` for an empty range.
    pub const fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// Master application area.
pub const MASTER_APPLICATION: AddressRange = AddressRange {
    start: 0x2C00,
    stop: 0x2A800,
};

/// Master application area including the configuration words page.
pub const MASTER_APPLICATION_WITH_CONFIG: AddressRange = AddressRange {
    start: 0x2C00,
    stop: 0x2AC00,
};

/// Reset and interrupt vectors, reported when configuration is unlocked.
pub const VECTORS: AddressRange = AddressRange {
    start: 0x0,
    stop: 0x400,
};

/// Configuration words, reported when configuration is unlocked.
pub const CONFIG_WORDS: AddressRange = AddressRange {
    start: 0x2ABF8,
    stop: 0x2AC00,
};

/// Program word that holds something other than the erased pattern when
/// an application is installed.
pub const APPLICATION_SENTINEL: u32 = 0x2C04;

/// Width of an address in slave messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressWidth {
    /// Low and high byte.
    Short,
    /// Low and high byte of the low word, low byte of the high word.
    Long,
}

/// Kind of device being programmed, each with its own layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetClass {
    /// The master itself.
    Master,
    /// Any actuator slave without a dedicated layout.
    Generic,
    /// Humidifier slave.
    Humidifier,
    /// Tinting slave.
    Tinting,
}

/// Memory layout of a target class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetProfile {
    /// Application area.
    pub program: AddressRange,
    /// Address encoding in slave messages.
    pub address_width: AddressWidth,
}

impl TargetClass {
    /// Layout of this class.
    pub const fn profile(self) -> TargetProfile {
        match self {
            TargetClass::Master => TargetProfile {
                program: MASTER_APPLICATION,
                address_width: AddressWidth::Long,
            },
            TargetClass::Generic => TargetProfile {
                program: AddressRange {
                    start: 0x1700,
                    stop: 0x5800,
                },
                address_width: AddressWidth::Short,
            },
            TargetClass::Humidifier => TargetProfile {
                program: AddressRange {
                    start: 0x2000,
                    stop: 0xAF00,
                },
                address_width: AddressWidth::Short,
            },
            TargetClass::Tinting => TargetProfile {
                program: AddressRange {
                    start: 0x2C00,
                    stop: 0x2A800,
                },
                address_width: AddressWidth::Long,
            },
        }
    }
}

/// Device selected by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Nothing selected yet, or id 0.
    Broadcast,
    /// The master itself.
    Master,
    /// A slave on the serial bus.
    Slave(u8),
}

impl Target {
    /// Target named by an id received from the host, `None` if no
    /// device can have that id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            MASTER_ID => Some(Target::Master),
            BROADCAST_ID => Some(Target::Broadcast),
            1..=N_SLAVES => Some(Target::Slave(id)),
            _ => None,
        }
    }

    /// Id as sent by the host.
    pub fn id(self) -> u8 {
        match self {
            Target::Broadcast => BROADCAST_ID,
            Target::Master => MASTER_ID,
            Target::Slave(id) => id,
        }
    }

    /// Memory layout class.
    pub fn class(self) -> TargetClass {
        match self {
            Target::Master => TargetClass::Master,
            Target::Slave(HUMIDIFIER_ID) => TargetClass::Humidifier,
            Target::Slave(TINTING_ID) => TargetClass::Tinting,
            Target::Slave(_) | Target::Broadcast => TargetClass::Generic,
        }
    }

    /// `true` when the bootloader programs its own flash.
    pub fn is_master(self) -> bool {
        self == Target::Master
    }
}

/// Type of a region reported by a query.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Program flash.
    ProgramMemory = 0x01,
    /// Data EEPROM.
    Eeprom = 0x02,
    /// Configuration words.
    ConfigWords = 0x03,
    /// Terminates the list.
    EndOfList = 0xFF,
}

/// One entry of a query response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Region type.
    pub kind: RegionKind,
    /// First address.
    pub address: u32,
    /// Length in addresses.
    pub length: u32,
}

impl MemoryRegion {
    /// List terminator.
    pub const END: MemoryRegion = MemoryRegion {
        kind: RegionKind::EndOfList,
        address: 0,
        length: 0,
    };

    fn new(kind: RegionKind, range: AddressRange) -> Self {
        Self {
            kind,
            address: range.start,
            length: range.len(),
        }
    }
}

/// Most regions a query reports, terminator excluded.
pub const MAX_REGIONS: usize = 3;

/// Regions reported for `target`, terminated by [`MemoryRegion::END`].
pub fn regions(target: Target, config_unlocked: bool) -> [MemoryRegion; MAX_REGIONS + 1] {
    let program = target.class().profile().program;
    let mut list = [MemoryRegion::END; MAX_REGIONS + 1];

    list[0] = MemoryRegion::new(RegionKind::ProgramMemory, program);
    if config_unlocked {
        list[1] = MemoryRegion::new(RegionKind::ProgramMemory, VECTORS);
        list[2] = MemoryRegion::new(RegionKind::ConfigWords, CONFIG_WORDS);
    }

    list
}
