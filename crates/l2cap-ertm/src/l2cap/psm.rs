//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! See Bluetooth Core Specification Vol 3, Part A, Section 4.2 and the
//! assigned numbers for logical link control.

use std::fmt;

/// Protocol/Service Multiplexer value carried in a Connection Request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Psm(u16);

impl Psm {
    /// Service Discovery Protocol
    pub const SDP: Psm = Psm(0x0001);
    pub const RFCOMM: Psm = Psm(0x0003);
    pub const BNEP: Psm = Psm(0x000F);
    pub const HID_CONTROL: Psm = Psm(0x0011);
    pub const HID_INTERRUPT: Psm = Psm(0x0013);
    pub const AVCTP: Psm = Psm(0x0017);
    pub const AVDTP: Psm = Psm(0x0019);
    pub const AVCTP_BROWSING: Psm = Psm(0x001B);

    /// First value of the dynamically assigned range
    pub const DYNAMIC_MIN: u16 = 0x1001;

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Validated constructor
    pub fn from_value(value: u16) -> Option<Self> {
        let psm = Self(value);
        psm.is_valid().then_some(psm)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// The least significant octet must be odd and the most significant
    /// octet even
    pub fn is_valid(&self) -> bool {
        self.0 & 0x0001 == 0x0001 && self.0 & 0x0100 == 0
    }

    pub fn is_dynamic(&self) -> bool {
        self.0 >= Self::DYNAMIC_MIN
    }

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::SDP => "SDP",
            Self::RFCOMM => "RFCOMM",
            Self::BNEP => "BNEP",
            Self::HID_CONTROL => "HID-Control",
            Self::HID_INTERRUPT => "HID-Interrupt",
            Self::AVCTP => "AVCTP",
            Self::AVDTP => "AVDTP",
            Self::AVCTP_BROWSING => "AVCTP-Browsing",
            _ => return None,
        })
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:04X})", name, self.0),
            None if self.is_dynamic() => write!(f, "Dynamic PSM (0x{:04X})", self.0),
            None => write!(f, "PSM 0x{:04X}", self.0),
        }
    }
}

/// Hands out unused dynamic PSMs
#[derive(Debug, Clone)]
pub struct PsmAllocator {
    next: u16,
}

impl Default for PsmAllocator {
    fn default() -> Self {
        Self {
            next: Psm::DYNAMIC_MIN,
        }
    }
}

impl PsmAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next valid dynamic PSM for which `in_use` is false, wrapping around
    /// the dynamic range
    pub fn allocate(&mut self, in_use: impl Fn(Psm) -> bool) -> Option<Psm> {
        let start = self.next;
        loop {
            let candidate = Psm(self.next);
            self.next = match self.next.checked_add(2) {
                Some(next) if next >= Psm::DYNAMIC_MIN => next,
                _ => Psm::DYNAMIC_MIN,
            };

            if candidate.is_valid() && !in_use(candidate) {
                return Some(candidate);
            }
            if self.next == start {
                return None;
            }
        }
    }
}
