//! Replication wire messages
//!
//! Every frame exchanged with a relay is one CBOR-encoded [`ReplicationMsg`]:
//! - `Update` carries an ADD, MODIFY, MODRDN or DELETE stamped with its CSN
//! - `Ack` answers an assured update, possibly with error flags
//!
//! Field indices are part of the wire format. Never reuse an index.

use crate::csn::Csn;
use crate::dn::{Dn, Rdn};
use crate::types::{AttrDesc, EntryUuid, Modification, ReplicaId};
use crate::{Error, Result};
use bytes::Bytes;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Assured replication mode requested by the writer
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize, Debug)]
#[cbor(index_only)]
pub enum AssuredMode {
    #[n(0)]
    SafeData,
    #[n(1)]
    SafeRead,
}

impl fmt::Display for AssuredMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssuredMode::SafeData => f.write_str("safe-data"),
            AssuredMode::SafeRead => f.write_str("safe-read"),
        }
    }
}

/// Assured flags carried by an update
#[derive(Clone, Copy, PartialEq, Eq, Encode, Decode, Debug)]
pub struct AssuredRequest {
    #[n(0)]
    pub mode: AssuredMode,

    /// Only meaningful for Safe Data
    #[n(1)]
    pub safe_data_level: u8,
}

#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub struct AddMsg {
    #[n(0)]
    pub csn: Csn,
    #[n(1)]
    pub dn: Dn,
    #[n(2)]
    pub uuid: EntryUuid,
    /// `None` for the suffix entry
    #[n(3)]
    pub parent_uuid: Option<EntryUuid>,
    #[n(4)]
    pub object_classes: Vec<String>,
    #[n(5)]
    pub attributes: Vec<(AttrDesc, Vec<String>)>,
    #[n(6)]
    pub assured: Option<AssuredRequest>,
}

#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub struct ModifyMsg {
    #[n(0)]
    pub csn: Csn,
    #[n(1)]
    pub dn: Dn,
    #[n(2)]
    pub mods: Vec<Modification>,
    #[n(3)]
    pub uuid: EntryUuid,
    #[n(4)]
    pub assured: Option<AssuredRequest>,
}

#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub struct ModifyDnMsg {
    #[n(0)]
    pub csn: Csn,
    /// DN of the entry before the rename
    #[n(1)]
    pub dn: Dn,
    #[n(2)]
    pub uuid: EntryUuid,
    #[n(3)]
    pub new_parent_uuid: Option<EntryUuid>,
    #[n(4)]
    pub delete_old_rdn: bool,
    #[n(5)]
    pub new_superior: Option<Dn>,
    #[n(6)]
    pub new_rdn: Rdn,
    #[n(7)]
    pub assured: Option<AssuredRequest>,
}

impl ModifyDnMsg {
    /// DN the originating replica gave the entry
    pub fn new_dn(&self) -> Dn {
        let parent = self
            .new_superior
            .clone()
            .or_else(|| self.dn.parent())
            .unwrap_or_default();
        parent.child(self.new_rdn.clone())
    }
}

#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub struct DeleteMsg {
    #[n(0)]
    pub csn: Csn,
    #[n(1)]
    pub dn: Dn,
    #[n(2)]
    pub uuid: EntryUuid,
    #[n(3)]
    pub subtree: bool,
    #[n(4)]
    pub assured: Option<AssuredRequest>,
}

/// A replicated change
#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub enum UpdateMsg {
    #[n(0)]
    Add(#[n(0)] AddMsg),
    #[n(1)]
    Modify(#[n(0)] ModifyMsg),
    #[n(2)]
    ModifyDn(#[n(0)] ModifyDnMsg),
    #[n(3)]
    Delete(#[n(0)] DeleteMsg),
}

impl UpdateMsg {
    pub fn csn(&self) -> Csn {
        match self {
            UpdateMsg::Add(m) => m.csn,
            UpdateMsg::Modify(m) => m.csn,
            UpdateMsg::ModifyDn(m) => m.csn,
            UpdateMsg::Delete(m) => m.csn,
        }
    }

    pub fn dn(&self) -> &Dn {
        match self {
            UpdateMsg::Add(m) => &m.dn,
            UpdateMsg::Modify(m) => &m.dn,
            UpdateMsg::ModifyDn(m) => &m.dn,
            UpdateMsg::Delete(m) => &m.dn,
        }
    }

    pub fn uuid(&self) -> EntryUuid {
        match self {
            UpdateMsg::Add(m) => m.uuid,
            UpdateMsg::Modify(m) => m.uuid,
            UpdateMsg::ModifyDn(m) => m.uuid,
            UpdateMsg::Delete(m) => m.uuid,
        }
    }

    pub fn assured(&self) -> Option<AssuredRequest> {
        match self {
            UpdateMsg::Add(m) => m.assured,
            UpdateMsg::Modify(m) => m.assured,
            UpdateMsg::ModifyDn(m) => m.assured,
            UpdateMsg::Delete(m) => m.assured,
        }
    }

    pub fn set_assured(&mut self, assured: Option<AssuredRequest>) {
        match self {
            UpdateMsg::Add(m) => m.assured = assured,
            UpdateMsg::Modify(m) => m.assured = assured,
            UpdateMsg::ModifyDn(m) => m.assured = assured,
            UpdateMsg::Delete(m) => m.assured = assured,
        }
    }

    pub fn origin(&self) -> ReplicaId {
        self.csn().replica_id
    }

    /// Precedence among operations sharing a CSN: ADD < DELETE < MODIFY < MODRDN
    pub fn kind_rank(&self) -> u8 {
        match self {
            UpdateMsg::Add(_) => 0,
            UpdateMsg::Delete(_) => 1,
            UpdateMsg::Modify(_) => 2,
            UpdateMsg::ModifyDn(_) => 3,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            UpdateMsg::Add(_) => "add",
            UpdateMsg::Modify(_) => "modify",
            UpdateMsg::ModifyDn(_) => "modrdn",
            UpdateMsg::Delete(_) => "delete",
        }
    }
}

/// Acknowledgement of an assured update
#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug, Default)]
pub struct AckMsg {
    #[n(0)]
    pub csn: Csn,
    #[n(1)]
    pub has_timeout: bool,
    #[n(2)]
    pub has_replay_error: bool,
    #[n(3)]
    pub has_wrong_status: bool,
    /// Servers that did not confirm
    #[n(4)]
    pub failed: Vec<ReplicaId>,
}

impl AckMsg {
    pub fn success(csn: Csn) -> Self {
        Self {
            csn,
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        self.has_timeout || self.has_replay_error || self.has_wrong_status
    }
}

/// Envelope for everything sent over a peer session
#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub enum ReplicationMsg {
    #[n(0)]
    Update(#[n(0)] UpdateMsg),
    #[n(1)]
    Ack(#[n(0)] AckMsg),
}

impl ReplicationMsg {
    pub fn encode(&self) -> Result<Bytes> {
        minicbor::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(format!("Failed to encode message: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        minicbor::decode(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to decode message: {}", e)))
    }
}
