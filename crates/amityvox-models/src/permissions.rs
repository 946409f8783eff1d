use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u64 {
        const VIEW_CHANNEL    = 1 << 0;
        const READ_HISTORY    = 1 << 1;
        const SEND_MESSAGES   = 1 << 2;
        const ADD_REACTIONS   = 1 << 3;
        const MANAGE_GUILD    = 1 << 4;
        const MANAGE_CHANNELS = 1 << 5;
        const MANAGE_ROLES    = 1 << 6;
        const MANAGE_MESSAGES = 1 << 7;
        const MANAGE_NICKNAMES = 1 << 8;
        const KICK_MEMBERS    = 1 << 9;
        const BAN_MEMBERS     = 1 << 10;
        const TIMEOUT_MEMBERS = 1 << 11;
        const CREATE_INVITES  = 1 << 12;
        const CONNECT         = 1 << 20;
        const SPEAK           = 1 << 21;
        const STREAM          = 1 << 22;
        const ADMINISTRATOR   = 1 << 31;
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(Permissions::from_bits_truncate(bits))
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::VIEW_CHANNEL
            | Self::READ_HISTORY
            | Self::SEND_MESSAGES
            | Self::ADD_REACTIONS
            | Self::CREATE_INVITES
            | Self::CONNECT
            | Self::SPEAK
            | Self::STREAM
    }
}
