use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(WorkspaceId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(SystemMessageId);
id_newtype!(PinId);

/// Identifies one tab (one sync-core instance) within a browser profile.
/// Never persisted; a tab mints a fresh id on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(pub Uuid);

impl TabId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}
