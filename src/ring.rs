//! A ketama-compatible consistent hash ring.
//!
//! Each server contributes 160 points to the continuum: 40 MD5 digests
//! of `"{host}:{port}-{index}"`, four little-endian u32 points per
//! digest. A key maps to the server owning the smallest point at or
//! after the key's own hash (the first four little-endian bytes of the
//! key's MD5), wrapping around at the top. Adding or removing a server
//! moves roughly 1/N of the keyspace, and the layout matches the widely
//! deployed ketama scheme so an existing deployment keeps its routing.

use crate::key::ServerAddress;

const POINTS_PER_SERVER: usize = 160;
const DIGESTS_PER_SERVER: usize = POINTS_PER_SERVER / 4;

struct Entry {
    point: u32,
    server_index: usize,
}

/// Immutable after construction; lookups are lock-free.
pub struct Ring {
    servers: Vec<ServerAddress>,
    continuum: Vec<Entry>,
}

impl Ring {
    /// Builds the continuum for a fixed server set. The set must be
    /// non-empty.
    pub fn new(servers: Vec<ServerAddress>) -> Ring {
        debug_assert!(!servers.is_empty(), "ring needs at least one server");

        let mut continuum = Vec::with_capacity(servers.len() * POINTS_PER_SERVER);
        for (server_index, server) in servers.iter().enumerate() {
            for digest_index in 0..DIGESTS_PER_SERVER {
                let digest = md5::compute(format!("{}-{}", server, digest_index));
                for chunk in digest.chunks_exact(4) {
                    continuum.push(Entry {
                        point: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                        server_index,
                    });
                }
            }
        }

        continuum.sort_unstable_by_key(|e| (e.point, e.server_index));

        Ring { servers, continuum }
    }

    /// The servers backing this ring, in construction order.
    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    /// Maps a routing token to its server. Pure in (server set, token).
    pub fn server_for(&self, routing_token: &[u8]) -> &ServerAddress {
        if self.servers.len() == 1 {
            return &self.servers[0];
        }

        let hash = key_point(routing_token);
        let index = match self.continuum.binary_search_by(|e| e.point.cmp(&hash)) {
            Ok(index) => index,
            Err(index) if index == self.continuum.len() => 0,
            Err(index) => index,
        };
        &self.servers[self.continuum[index].server_index]
    }
}

fn key_point(routing_token: &[u8]) -> u32 {
    let digest = md5::compute(routing_token);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: usize) -> Vec<ServerAddress> {
        (0..n)
            .map(|i| ServerAddress::new(format!("cache-{}", i), 11211))
            .collect()
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let a = Ring::new(servers(3));
        let b = Ring::new(servers(3));
        for i in 0..200 {
            let token = format!("key-{}", i);
            assert_eq!(
                a.server_for(token.as_bytes()),
                b.server_for(token.as_bytes())
            );
        }
    }

    #[test]
    fn test_single_server_takes_everything() {
        let ring = Ring::new(servers(1));
        for i in 0..50 {
            let token = format!("key-{}", i);
            assert_eq!(ring.server_for(token.as_bytes()).host, "cache-0");
        }
    }

    #[test]
    fn test_continuum_has_points_for_every_server() {
        let ring = Ring::new(servers(4));
        assert_eq!(ring.continuum.len(), 4 * POINTS_PER_SERVER);
    }

    #[test]
    fn test_keys_spread_across_servers() {
        let ring = Ring::new(servers(3));
        let mut hits = [0usize; 3];
        for i in 0..3000 {
            let token = format!("key-{}", i);
            let server = ring.server_for(token.as_bytes());
            let index = ring.servers.iter().position(|s| s == server).unwrap();
            hits[index] += 1;
        }
        for (index, count) in hits.iter().enumerate() {
            assert!(*count > 0, "server {} received no keys: {:?}", index, hits);
        }
    }

    #[test]
    fn test_removing_a_server_moves_a_minority_of_keys() {
        let full = Ring::new(servers(3));
        let reduced = Ring::new(servers(3).into_iter().take(2).collect());
        let mut moved = 0;
        let total = 3000;
        for i in 0..total {
            let token = format!("key-{}", i);
            let before = full.server_for(token.as_bytes());
            if before.host == "cache-2" {
                continue;
            }
            if before != reduced.server_for(token.as_bytes()) {
                moved += 1;
            }
        }
        // Keys not owned by the removed server should mostly stay put.
        assert!(moved * 5 < total, "{} of {} surviving keys moved", moved, total);
    }
}
