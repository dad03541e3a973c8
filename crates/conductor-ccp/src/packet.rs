//! Binary forms of the two routing-protocol messages, carried as the
//! `ccp_control` and `ccp_update` sub-protocol payloads on the peer link.

use std::io::Read;
use std::str;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use conductor_packet::oer::{BufOerExt, MutBufOerExt};
use conductor_packet::ParseError;

const FLAG_OPTIONAL: u8 = 0x80;
const FLAG_TRANSITIVE: u8 = 0x40;
const FLAG_PARTIAL: u8 = 0x20;
const FLAG_UTF8: u8 = 0x10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    Sync = 1,
}

impl Mode {
    pub fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Mode::Idle),
            1 => Ok(Mode::Sync),
            _ => Err(ParseError::InvalidPacket(format!(
                "Unexpected mode: {}",
                value
            ))),
        }
    }
}

/// Tells the peer where to resume sending us route updates from.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RouteControlRequest {
    pub mode: Mode,
    pub last_known_routing_table_id: [u8; 16],
    pub last_known_epoch: u32,
    pub features: Vec<String>,
}

impl RouteControlRequest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = bytes;

        let mode = Mode::try_from(reader.read_u8()?)?;
        let mut last_known_routing_table_id = [0u8; 16];
        reader.read_exact(&mut last_known_routing_table_id)?;
        let last_known_epoch = reader.read_u32::<BigEndian>()?;

        let num_features = reader.read_var_uint()?;
        let mut features = Vec::with_capacity(num_features.min(16) as usize);
        for _ in 0..num_features {
            features.push(str::from_utf8(reader.read_var_octet_string()?)?.to_owned());
        }

        Ok(RouteControlRequest {
            mode,
            last_known_routing_table_id,
            last_known_epoch,
            features,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.put_u8(self.mode as u8);
        bytes.put_slice(&self.last_known_routing_table_id);
        bytes.put_u32(self.last_known_epoch);
        bytes.put_var_uint(self.features.len() as u64);
        for feature in self.features.iter() {
            bytes.put_var_octet_string(feature.as_bytes());
        }
        bytes
    }
}

/// An advisory flag attached to an advertised route.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RouteProp {
    pub is_optional: bool,
    pub is_transitive: bool,
    pub is_partial: bool,
    pub is_utf8: bool,
    pub id: u16,
    pub value: Vec<u8>,
}

impl RouteProp {
    // advances the cursor in the caller's slice
    pub fn from_reader(reader: &mut &[u8]) -> Result<Self, ParseError> {
        let meta = reader.read_u8()?;
        let id = reader.read_u16::<BigEndian>()?;
        let value = reader.read_var_octet_string()?.to_vec();

        Ok(RouteProp {
            is_optional: meta & FLAG_OPTIONAL != 0,
            is_transitive: meta & FLAG_TRANSITIVE != 0,
            is_partial: meta & FLAG_PARTIAL != 0,
            is_utf8: meta & FLAG_UTF8 != 0,
            id,
            value,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        let mut meta = 0;
        if self.is_optional {
            meta |= FLAG_OPTIONAL;
        }
        if self.is_transitive {
            meta |= FLAG_TRANSITIVE;
        }
        if self.is_partial {
            meta |= FLAG_PARTIAL;
        }
        if self.is_utf8 {
            meta |= FLAG_UTF8;
        }

        buf.put_u8(meta);
        buf.put_u16(self.id);
        buf.put_var_octet_string(&self.value[..]);
    }
}

/// One advertised route: the prefix, the path it has already travelled
/// (loop prevention), a freshness token and advisory props.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Route {
    pub prefix: String,
    pub path: Vec<String>,
    pub auth: [u8; 32],
    pub props: Vec<RouteProp>,
}

impl Route {
    // advances the cursor in the caller's slice
    pub fn from_reader(reader: &mut &[u8]) -> Result<Self, ParseError> {
        let prefix = str::from_utf8(reader.read_var_octet_string()?)?.to_owned();
        let path_len = reader.read_var_uint()? as usize;
        let mut path = Vec::with_capacity(path_len.min(32));
        for _ in 0..path_len {
            path.push(str::from_utf8(reader.read_var_octet_string()?)?.to_owned());
        }
        let mut auth = [0u8; 32];
        reader.read_exact(&mut auth)?;

        let props_len = reader.read_var_uint()? as usize;
        let mut props = Vec::with_capacity(props_len.min(32));
        for _ in 0..props_len {
            props.push(RouteProp::from_reader(reader)?);
        }

        Ok(Route {
            prefix,
            path,
            auth,
            props,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_var_octet_string(self.prefix.as_bytes());
        buf.put_var_uint(self.path.len() as u64);
        for hop in self.path.iter() {
            buf.put_var_octet_string(hop.as_bytes());
        }
        buf.put_slice(&self.auth);
        buf.put_var_uint(self.props.len() as u64);
        for prop in self.props.iter() {
            prop.write_to(buf);
        }
    }
}

/// An incremental diff of the speaker's forwarding table covering the
/// epoch range `[from_epoch_index, to_epoch_index)`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RouteUpdateRequest {
    pub routing_table_id: [u8; 16],
    pub current_epoch_index: u32,
    pub from_epoch_index: u32,
    pub to_epoch_index: u32,
    pub hold_down_time: u32,
    pub speaker: String,
    pub new_routes: Vec<Route>,
    pub withdrawn_routes: Vec<String>,
}

impl RouteUpdateRequest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = bytes;

        let mut routing_table_id = [0u8; 16];
        reader.read_exact(&mut routing_table_id)?;
        let current_epoch_index = reader.read_u32::<BigEndian>()?;
        let from_epoch_index = reader.read_u32::<BigEndian>()?;
        let to_epoch_index = reader.read_u32::<BigEndian>()?;
        let hold_down_time = reader.read_u32::<BigEndian>()?;
        let speaker = str::from_utf8(reader.read_var_octet_string()?)?.to_owned();

        let new_routes_len = reader.read_var_uint()? as usize;
        let mut new_routes = Vec::with_capacity(new_routes_len.min(64));
        for _ in 0..new_routes_len {
            new_routes.push(Route::from_reader(&mut reader)?);
        }
        let withdrawn_routes_len = reader.read_var_uint()? as usize;
        let mut withdrawn_routes = Vec::with_capacity(withdrawn_routes_len.min(64));
        for _ in 0..withdrawn_routes_len {
            withdrawn_routes.push(str::from_utf8(reader.read_var_octet_string()?)?.to_owned());
        }

        Ok(RouteUpdateRequest {
            routing_table_id,
            current_epoch_index,
            from_epoch_index,
            to_epoch_index,
            hold_down_time,
            speaker,
            new_routes,
            withdrawn_routes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.put_slice(&self.routing_table_id);
        bytes.put_u32(self.current_epoch_index);
        bytes.put_u32(self.from_epoch_index);
        bytes.put_u32(self.to_epoch_index);
        bytes.put_u32(self.hold_down_time);
        bytes.put_var_octet_string(self.speaker.as_bytes());
        bytes.put_var_uint(self.new_routes.len() as u64);
        for route in self.new_routes.iter() {
            route.write_to(&mut bytes);
        }
        bytes.put_var_uint(self.withdrawn_routes.len() as u64);
        for withdrawn in self.withdrawn_routes.iter() {
            bytes.put_var_octet_string(withdrawn.as_bytes());
        }
        bytes
    }
}
