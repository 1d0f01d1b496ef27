use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::error::ConfigError;
use crate::consensus::PeerId;

/*
    Config file layout, read once at startup:

        <number of other nodes>
        <id> <host> <port>
        ...

    Every node gets the same peer list minus itself. A line naming the
    local node is skipped so that one shared file can serve a whole cluster.
*/

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub peers: Vec<PeerAddr>,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>, local_id: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, local_id)
    }

    pub fn parse(text: &str, local_id: &str) -> Result<Self, ConfigError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(n, l)| (n + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (_, count_line) = lines.next().ok_or(ConfigError::MissingCount)?;
        let expected: usize = count_line
            .parse()
            .map_err(|_| ConfigError::InvalidCount(count_line.to_string()))?;

        let mut peers = Vec::with_capacity(expected);
        let mut seen = HashSet::new();
        let mut listed = 0;
        for (line, content) in lines {
            let fields: Vec<&str> = content.split_whitespace().collect();
            let [id, host, port] = fields[..] else {
                return Err(ConfigError::MalformedPeer {
                    line,
                    content: content.to_string(),
                });
            };
            let port = port.parse().map_err(|_| ConfigError::InvalidPort {
                line,
                port: port.to_string(),
            })?;
            if !seen.insert(id.to_string()) {
                return Err(ConfigError::DuplicatePeer(id.to_string()));
            }
            if id == local_id {
                continue;
            }
            listed += 1;
            peers.push(PeerAddr {
                id: id.to_string(),
                host: host.to_string(),
                port,
            });
        }

        if listed != expected {
            return Err(ConfigError::CountMismatch {
                expected,
                found: listed,
            });
        }
        Ok(ClusterConfig { peers })
    }

    /// Peers this node accepts connections from.
    pub fn smaller_than<'a>(&'a self, local_id: &'a str) -> impl Iterator<Item = &'a PeerAddr> {
        self.peers.iter().filter(move |p| p.id.as_str() < local_id)
    }

    /// Peers this node dials.
    pub fn larger_than<'a>(&'a self, local_id: &'a str) -> impl Iterator<Item = &'a PeerAddr> {
        self.peers.iter().filter(move |p| p.id.as_str() > local_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter().map(|p| &p.id)
    }
}
