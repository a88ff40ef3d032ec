//! Codec registry.
//!
//! A group names its payload format through `lorawan.data_model`. The id is
//! resolved to a [`Codec`] once, when the group is loaded, and the resolved
//! value is reused for every frame of that group.

pub mod application_server;
pub mod cayenne;

use std::fmt;
use std::str::FromStr;

use loragent_core::model::DecodedAttribute;
use loragent_core::{Error, Result};
use serde_json::{Map, Value};

/// Supported payload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Binary CayenneLPP records.
    CayenneLpp,
    /// JSON fields decoded upstream by the network server.
    ApplicationServer,
}

impl Codec {
    pub const ALL: [Codec; 2] = [Codec::CayenneLpp, Codec::ApplicationServer];

    /// Resolve a codec identifier, ignoring case.
    pub fn from_id(id: &str) -> Result<Self> {
        let normalized = id.trim().to_ascii_lowercase();
        Codec::ALL
            .into_iter()
            .find(|c| c.id() == normalized)
            .ok_or_else(|| Error::UnsupportedCodec(id.to_string()))
    }

    pub fn id(&self) -> &'static str {
        match self {
            Codec::CayenneLpp => "cayennelpp",
            Codec::ApplicationServer => "application_server",
        }
    }

    /// Decode one uplink. `fields` is the network server's pre-decoded
    /// object, if the envelope carried one.
    pub fn decode(
        &self,
        raw: &[u8],
        fields: Option<&Map<String, Value>>,
    ) -> Result<Vec<DecodedAttribute>> {
        match self {
            Codec::CayenneLpp => cayenne::decode(raw),
            Codec::ApplicationServer => application_server::decode(fields),
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Codec::from_id(s)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Decode raw bytes with the codec named by `codec_id`.
pub fn decode(codec_id: &str, raw: &[u8]) -> Result<Vec<DecodedAttribute>> {
    Codec::from_id(codec_id)?.decode(raw, None)
}
