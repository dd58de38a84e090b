use std::fmt::Display;
use std::str::FromStr;

const PCI_SLOTS_PER_BUS: u8 = 32;
const PCI_FUNCTIONS_PER_SLOT: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PciAddressError {
    #[error("expected a PCI address of the form dddd:bb:ss.f, got {0:?}")]
    Malformed(String),
    #[error("PCI slot {0:#04x} outside range of 0x00-0x1f")]
    SlotOutOfRange(u8),
    #[error("PCI function {0} outside range of 0-7")]
    FunctionOutOfRange(u8),
}

/// A guest PCI address in domain:bus:slot.function notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    domain: u16,
    bus: u8,
    slot: u8,
    function: u8,
}

impl PciAddress {
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Result<Self, PciAddressError> {
        if slot >= PCI_SLOTS_PER_BUS {
            return Err(PciAddressError::SlotOutOfRange(slot));
        }
        if function >= PCI_FUNCTIONS_PER_SLOT {
            return Err(PciAddressError::FunctionOutOfRange(function));
        }
        Ok(Self {
            domain,
            bus,
            slot,
            function,
        })
    }

    pub fn domain(&self) -> u16 {
        self.domain
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn function(&self) -> u8 {
        self.function
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PciAddressError::Malformed(s.to_string());

        let (rest, function) = s.rsplit_once('.').ok_or_else(malformed)?;
        let mut fields = rest.split(':');
        let (Some(domain), Some(bus), Some(slot), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };

        let hex = |field: &str, width: usize| {
            if field.len() != width || !field.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(malformed());
            }
            u16::from_str_radix(field, 16).map_err(|_| malformed())
        };
        if function.len() != 1 {
            return Err(malformed());
        }
        let function = function.parse::<u8>().map_err(|_| malformed())?;

        let domain = hex(domain, 4)?;
        // two hex digits always fit a u8
        let bus = hex(bus, 2)? as u8;
        let slot = hex(slot, 2)? as u8;

        Self::new(domain, bus, slot, function)
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}
