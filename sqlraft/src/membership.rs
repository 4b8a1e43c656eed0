//! Cluster membership: servers, roles and the configuration codec.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigurationError;
use crate::quorum;
use crate::NodeId;

/// Version tag of the configuration encoding format.
const ENCODING_FORMAT: u8 = 1;

/// The role a server plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The server participates in quorum and elections.
    Voter,
    /// The server receives replicated entries but does not vote.
    Standby,
    /// The server is excluded from majorities; used while catching up.
    Spare,
}

impl Role {
    fn code(self) -> u8 {
        match self {
            Role::Voter => 0,
            Role::Standby => 1,
            Role::Spare => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self, ConfigurationError> {
        match code {
            0 => Ok(Role::Voter),
            1 => Ok(Role::Standby),
            2 => Ok(Role::Spare),
            other => Err(ConfigurationError::BadRole(other)),
        }
    }
}

/// A member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The server's unique id; never zero.
    pub id: NodeId,
    /// The network address of the server, opaque to the Raft engine.
    pub address: String,
    /// The server's role.
    pub role: Role,
}

/// An ordered set of servers with unique ids and unique addresses.
///
/// An accepted configuration always contains at least one voter. The order of servers is
/// significant: vote tallies are bitmaps indexed by voter position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    servers: Vec<Server>,
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self { servers: Vec::new() }
    }

    /// Create a configuration holding a single voter, used when bootstrapping a one-node
    /// cluster.
    pub fn new_single(id: NodeId, address: String) -> Self {
        let mut c = Self::new();
        c.add(id, address, Role::Voter).expect("single-server configuration");
        c
    }

    /// The servers of this configuration, in order.
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Add a server to the configuration.
    pub fn add(&mut self, id: NodeId, address: String, role: Role) -> Result<(), ConfigurationError> {
        if id == 0 {
            return Err(ConfigurationError::BadId);
        }
        for server in &self.servers {
            if server.id == id {
                return Err(ConfigurationError::DuplicateId(id));
            }
            if server.address == address {
                return Err(ConfigurationError::DuplicateAddress(address));
            }
        }
        self.servers.push(Server { id, address, role });
        Ok(())
    }

    /// Remove the server with the given id.
    pub fn remove(&mut self, id: NodeId) -> Result<(), ConfigurationError> {
        let i = self.index_of(id).ok_or(ConfigurationError::UnknownServer(id))?;
        self.servers.remove(i);
        Ok(())
    }

    /// Change the role of the server with the given id.
    pub fn set_role(&mut self, id: NodeId, role: Role) -> Result<(), ConfigurationError> {
        let i = self.index_of(id).ok_or(ConfigurationError::UnknownServer(id))?;
        self.servers[i].role = role;
        Ok(())
    }

    /// Get the server with the given id.
    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// The position of the server with the given id.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// The position of the given server among the voters, used to index vote bitmaps.
    pub fn index_of_voter(&self, id: NodeId) -> Option<usize> {
        let mut j = 0;
        for server in &self.servers {
            if server.id == id {
                return if server.role == Role::Voter { Some(j) } else { None };
            }
            if server.role == Role::Voter {
                j += 1;
            }
        }
        None
    }

    /// Whether a server with the given id is part of the configuration.
    pub fn contains(&self, id: NodeId) -> bool {
        self.index_of(id).is_some()
    }

    /// Whether the server with the given id is a voter.
    pub fn is_voter(&self, id: NodeId) -> bool {
        matches!(self.get(id), Some(s) if s.role == Role::Voter)
    }

    /// The number of voters.
    pub fn voter_count(&self) -> usize {
        self.servers.iter().filter(|s| s.role == Role::Voter).count()
    }

    /// The ids of all voters, in configuration order.
    pub fn voter_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.servers.iter().filter(|s| s.role == Role::Voter).map(|s| s.id)
    }

    /// The ids of all members, in configuration order.
    pub fn member_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.servers.iter().map(|s| s.id)
    }

    /// The number of votes forming a majority of voters.
    pub fn majority(&self) -> usize {
        quorum::majority_of(self.voter_count())
    }

    /// Whether the configuration is acceptable for use: non-empty with at least one voter.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.voter_count() == 0 {
            return Err(ConfigurationError::NoVoters);
        }
        Ok(())
    }

    /// Encode the configuration into its wire format.
    ///
    /// Layout: 1 byte format version, 8-byte little-endian server count, then per server an
    /// 8-byte little-endian id, the NUL-terminated address and a 1-byte role code. The result
    /// is zero-padded to an 8-byte boundary.
    pub fn encode(&self) -> Bytes {
        let mut size = 1 + 8;
        for server in &self.servers {
            size += 8 + server.address.len() + 1 + 1;
        }
        let padded = (size + 7) / 8 * 8;

        let mut buf = BytesMut::with_capacity(padded);
        buf.put_u8(ENCODING_FORMAT);
        buf.put_u64_le(self.servers.len() as u64);
        for server in &self.servers {
            buf.put_u64_le(server.id);
            buf.put_slice(server.address.as_bytes());
            buf.put_u8(0);
            buf.put_u8(server.role.code());
        }
        buf.resize(padded, 0);
        buf.freeze()
    }

    /// Decode a configuration from its wire format.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ConfigurationError> {
        if buf.remaining() < 1 + 8 {
            return Err(ConfigurationError::Malformed("buffer too short for header"));
        }
        let version = buf.get_u8();
        if version != ENCODING_FORMAT {
            return Err(ConfigurationError::Malformed("unknown encoding format version"));
        }
        let n = buf.get_u64_le();

        let mut configuration = Configuration::new();
        for _ in 0..n {
            if buf.remaining() < 8 {
                return Err(ConfigurationError::Malformed("buffer too short for server id"));
            }
            let id = buf.get_u64_le();

            let nul = match buf.iter().position(|b| *b == 0) {
                Some(pos) => pos,
                None => return Err(ConfigurationError::Malformed("server address not terminated")),
            };
            let address = String::from_utf8(buf[..nul].to_vec())
                .map_err(|_| ConfigurationError::Malformed("server address is not valid utf-8"))?;
            buf.advance(nul + 1);

            if buf.remaining() < 1 {
                return Err(ConfigurationError::Malformed("buffer too short for server role"));
            }
            let role = Role::from_code(buf.get_u8())?;

            configuration.add(id, address, role)?;
        }
        Ok(configuration)
    }
}
