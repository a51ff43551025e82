/// Operation tags encoded in the upper 8 bits of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    /// Single-shot recvmsg for a receiver port.
    RecvMsg = 0,
    /// Copying sendmsg for a sender port.
    SendMsg = 1,
    /// Close of a port's direct descriptor.
    Close = 2,
    /// Async cancel (informational CQE only).
    Cancel = 3,
    /// Eventfd read for the task wakeup.
    TaskWakeup = 4,
    /// Eventfd read for the stop wakeup.
    StopWakeup = 5,
    /// Eventfd read for the data wakeup (outbound datagrams, resolver results).
    DataWakeup = 6,
    /// Timeout bounding a shutdown drain iteration.
    DrainTimeout = 7,
}

impl OpTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpTag::RecvMsg),
            1 => Some(OpTag::SendMsg),
            2 => Some(OpTag::Close),
            3 => Some(OpTag::Cancel),
            4 => Some(OpTag::TaskWakeup),
            5 => Some(OpTag::StopWakeup),
            6 => Some(OpTag::DataWakeup),
            7 => Some(OpTag::DrainTimeout),
            _ => None,
        }
    }
}

/// Encoded user_data for io_uring CQE identification.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpTag (8 bits)
/// Bits 55..32: PortIndex (24 bits)
/// Bits 31..0:  Generation (32 bits, detects CQEs for recycled slots)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;
    const PORT_SHIFT: u64 = 32;
    const TAG_MASK: u64 = 0xFF << Self::TAG_SHIFT;
    const PORT_MASK: u64 = 0x00FF_FFFF << Self::PORT_SHIFT;
    const GEN_MASK: u64 = 0xFFFF_FFFF;

    /// Encode an operation tag, port index, and slot generation into user_data.
    #[inline]
    pub fn encode(tag: OpTag, port_index: u32, generation: u32) -> Self {
        debug_assert!(port_index < (1 << 24), "port_index exceeds 24 bits");
        let v = ((tag as u64) << Self::TAG_SHIFT)
            | (((port_index as u64) & 0x00FF_FFFF) << Self::PORT_SHIFT)
            | (generation as u64);
        UserData(v)
    }

    /// Decode the operation tag.
    #[inline]
    pub fn tag(self) -> Option<OpTag> {
        let raw = ((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8;
        OpTag::from_u8(raw)
    }

    /// Decode the port index.
    #[inline]
    pub fn port_index(self) -> u32 {
        ((self.0 & Self::PORT_MASK) >> Self::PORT_SHIFT) as u32
    }

    /// Decode the slot generation.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 & Self::GEN_MASK) as u32
    }

    /// Get the raw u64 value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_tags() {
        for tag_val in 0..=7u8 {
            let tag = match OpTag::from_u8(tag_val) {
                Some(t) => t,
                None => continue,
            };
            let port = 0x00AB_CDEFu32 & 0x00FF_FFFF;
            let generation = 0xDEAD_BEEFu32;
            let ud = UserData::encode(tag, port, generation);
            assert_eq!(ud.tag(), Some(tag));
            assert_eq!(ud.port_index(), port);
            assert_eq!(ud.generation(), generation);
        }
    }

    #[test]
    fn zero_values() {
        let ud = UserData::encode(OpTag::RecvMsg, 0, 0);
        assert_eq!(ud.tag(), Some(OpTag::RecvMsg));
        assert_eq!(ud.port_index(), 0);
        assert_eq!(ud.generation(), 0);
    }

    #[test]
    fn max_port_index() {
        let max_port = (1u32 << 24) - 1;
        let ud = UserData::encode(OpTag::Close, max_port, u32::MAX);
        assert_eq!(ud.port_index(), max_port);
        assert_eq!(ud.generation(), u32::MAX);
    }

    #[test]
    fn invalid_tag() {
        let ud = UserData(0xFF << 56);
        assert_eq!(ud.tag(), None);
    }
}
