//! Pseudo-random, non-repeating iteration over an IP subnet.
//!
//! A scan over the usable hosts of a subnet is modeled as a walk through the
//! multiplicative group of integers modulo a prime `p` chosen just above the
//! host space. Powers of a primitive root enumerate every non-zero residue
//! exactly once, so the walk visits every usable offset once without storing
//! visited addresses, and picking a fresh root per scan yields a different
//! ordering each time. Subnets with more than 32 host bits fall back to
//! uniform sampling; subnets of four addresses or fewer degenerate to a
//! linear scan.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::Rng;

use crate::{EgressError, Result};

/// An IP network (v4 or v6) serving as an egress address pool.
#[derive(Debug, Clone)]
pub struct AddressPool {
    net: IpNet,
}

impl AddressPool {
    /// Parse a CIDR string, masking any host bits in the address part.
    pub fn parse(s: &str) -> Result<Self> {
        let net: IpNet = s
            .parse()
            .map_err(|e| EgressError::Config(format!("invalid subnet {s}: {e}")))?;
        Ok(Self::new(net))
    }

    pub fn new(net: IpNet) -> Self {
        Self { net: net.trunc() }
    }

    pub fn network(&self) -> IpAddr {
        self.net.network()
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.net, IpNet::V6(_))
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn max_prefix_len(&self) -> u8 {
        self.net.max_prefix_len()
    }

    pub fn host_bits(&self) -> u8 {
        self.max_prefix_len() - self.prefix_len()
    }

    /// Total number of addresses in the subnet, saturating for an IPv6 `/0`.
    pub fn num_addresses(&self) -> u128 {
        match 1u128.checked_shl(u32::from(self.host_bits())) {
            Some(n) => n,
            None => u128::MAX,
        }
    }

    /// Largest valid offset from the network address.
    pub fn max_offset(&self) -> u128 {
        match 1u128.checked_shl(u32::from(self.host_bits())) {
            Some(n) => n - 1,
            None => u128::MAX,
        }
    }

    /// Usable hosts for a bounded scan: the first and last address of the
    /// subnet are excluded.
    pub fn host_count(&self) -> u128 {
        self.num_addresses().saturating_sub(2)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.net.contains(addr)
    }

    fn base(&self) -> u128 {
        match self.network() {
            IpAddr::V4(a) => u128::from(u32::from(a)),
            IpAddr::V6(a) => u128::from(a),
        }
    }

    /// Address at `offset` from the network address.
    pub fn addr_at(&self, offset: u128) -> IpAddr {
        let value = self.base().wrapping_add(offset);
        if self.is_ipv6() {
            IpAddr::V6(Ipv6Addr::from(value))
        } else {
            IpAddr::V4(Ipv4Addr::from(value as u32))
        }
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

struct CycleParams {
    prime: u64,
    root: u64,
    factors: &'static [u64],
}

/// Per-prefix cycle parameters, indexed by `32 - host_bits`: the smallest
/// prime strictly above the host space, a known primitive root of (Z/pZ)*,
/// and the prime factors of `p - 1`.
#[rustfmt::skip]
const CYCLE_PARAMS: [CycleParams; 31] = [
    CycleParams { prime: 4_294_967_311, root: 3,  factors: &[2, 3, 5, 131, 364_289] },
    CycleParams { prime: 2_147_483_659, root: 2,  factors: &[2, 3, 149, 2_402_107] },
    CycleParams { prime: 1_073_741_827, root: 2,  factors: &[2, 3, 59, 3_033_169] },
    CycleParams { prime: 536_870_923,   root: 3,  factors: &[2, 3, 7, 23, 555_767] },
    CycleParams { prime: 268_435_459,   root: 2,  factors: &[2, 3, 19, 87_211] },
    CycleParams { prime: 134_217_757,   root: 5,  factors: &[2, 3, 1_242_757] },
    CycleParams { prime: 67_108_879,    root: 3,  factors: &[2, 3, 1_242_757] },
    CycleParams { prime: 33_554_467,    root: 2,  factors: &[2, 3, 11, 56_489] },
    CycleParams { prime: 16_777_259,    root: 2,  factors: &[2, 23, 103, 3_541] },
    CycleParams { prime: 8_388_617,     root: 3,  factors: &[2, 17, 61_681] },
    CycleParams { prime: 4_194_319,     root: 3,  factors: &[2, 3, 699_053] },
    CycleParams { prime: 2_097_169,     root: 47, factors: &[2, 3, 43_691] },
    CycleParams { prime: 1_048_583,     root: 5,  factors: &[2, 29, 101, 179] },
    CycleParams { prime: 524_309,       root: 2,  factors: &[2, 23, 41, 139] },
    CycleParams { prime: 262_147,       root: 2,  factors: &[2, 3, 43_691] },
    CycleParams { prime: 131_101,       root: 17, factors: &[2, 3, 5, 19, 23] },
    CycleParams { prime: 65_537,        root: 3,  factors: &[2] },
    CycleParams { prime: 32_771,        root: 2,  factors: &[2, 5, 29, 113] },
    CycleParams { prime: 16_411,        root: 3,  factors: &[2, 3, 5, 547] },
    CycleParams { prime: 8_209,         root: 7,  factors: &[2, 3, 19] },
    CycleParams { prime: 4_099,         root: 2,  factors: &[2, 3, 683] },
    CycleParams { prime: 2_053,         root: 2,  factors: &[2, 3, 19] },
    CycleParams { prime: 1_031,         root: 14, factors: &[2, 5, 103] },
    CycleParams { prime: 521,           root: 3,  factors: &[2, 5, 13] },
    CycleParams { prime: 257,           root: 3,  factors: &[2] },
    CycleParams { prime: 131,           root: 2,  factors: &[2, 5, 13] },
    CycleParams { prime: 67,            root: 2,  factors: &[2, 3, 11] },
    CycleParams { prime: 37,            root: 2,  factors: &[2, 3] },
    CycleParams { prime: 17,            root: 3,  factors: &[2] },
    CycleParams { prime: 11,            root: 2,  factors: &[2, 5] },
    CycleParams { prime: 5,             root: 2,  factors: &[2] },
];

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) % u128::from(m)) as u64
}

fn mod_pow(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    let mut acc: u64 = 1;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, modulus);
        }
        base = mul_mod(base, base, modulus);
        exp >>= 1;
    }
    acc
}

/// Derive a fresh primitive root as `g0^c mod p` for a random exponent `c`
/// coprime to `p - 1`.
fn random_primitive_root(params: &CycleParams, rng: &mut impl Rng) -> u64 {
    let phi = params.prime - 1;
    loop {
        let c = rng.gen_range(3..=phi - 1);
        // Coprimality shortcut over the precomputed factors of p - 1.
        if params.factors.iter().all(|&f| f % c != 0 && c % f != 0) {
            return mod_pow(params.root, c, params.prime);
        }
    }
}

/// One scan through the multiplicative group; finite, ends when the walk
/// returns to its seed.
struct CycleWalk {
    prime: u64,
    multiplier: u64,
    seed: u64,
    current: u64,
    host_count: u64,
    done: bool,
}

impl CycleWalk {
    fn new(pool: &AddressPool, params: &CycleParams) -> Self {
        let mut rng = rand::thread_rng();
        // Bounded case: host_count <= 2^32 - 2.
        let host_count = pool.host_count() as u64;
        let multiplier = random_primitive_root(params, &mut rng);
        let seed = rng.gen_range(1..=host_count);
        Self {
            prime: params.prime,
            multiplier,
            seed,
            current: seed,
            host_count,
            done: false,
        }
    }

    fn next_offset(&mut self) -> Option<u64> {
        while !self.done {
            let candidate = self.current;
            self.current = mul_mod(self.current, self.multiplier, self.prime);
            if self.current == self.seed {
                self.done = true;
            }
            // Residues above the host range advance the walk but yield nothing.
            if candidate <= self.host_count {
                return Some(candidate);
            }
        }
        None
    }
}

enum Walk {
    Cycle(CycleWalk),
    Linear { next: u128, total: u128 },
    Random,
}

impl Walk {
    fn new(pool: &AddressPool) -> Self {
        if pool.prefix_len() > pool.max_prefix_len().saturating_sub(2) {
            // Four addresses or fewer: scan the whole subnet in order.
            return Walk::Linear {
                next: 0,
                total: pool.num_addresses(),
            };
        }
        if pool.host_bits() <= 32 {
            let index = usize::from(32 - pool.host_bits());
            if let Some(params) = CYCLE_PARAMS.get(index) {
                return Walk::Cycle(CycleWalk::new(pool, params));
            }
        }
        Walk::Random
    }
}

/// Lazy address stream over a pool, skipping blacklisted addresses.
///
/// Bounded pools produce a finite permutation per construction; building a
/// new generator starts a fresh scan with a different ordering. Pools with
/// more than 32 host bits sample uniformly forever (duplicates tolerated).
pub struct IpGenerator {
    pool: AddressPool,
    blacklist: HashSet<IpAddr>,
    walk: Walk,
}

impl IpGenerator {
    pub fn new(pool: &AddressPool, blacklist: HashSet<IpAddr>) -> Self {
        Self {
            pool: pool.clone(),
            blacklist,
            walk: Walk::new(pool),
        }
    }
}

impl Iterator for IpGenerator {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        loop {
            let offset = match &mut self.walk {
                Walk::Cycle(walk) => u128::from(walk.next_offset()?),
                Walk::Linear { next, total } => {
                    if *next >= *total {
                        return None;
                    }
                    let offset = *next;
                    *next += 1;
                    offset
                }
                Walk::Random => rand::thread_rng().gen_range(0..=self.pool.max_offset()),
            };
            let addr = self.pool.addr_at(offset);
            if !self.blacklist.contains(&addr) {
                return Some(addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(s: &str) -> AddressPool {
        AddressPool::parse(s).unwrap()
    }

    #[test]
    fn parse_masks_host_bits() {
        let p = pool("10.0.0.5/28");
        assert_eq!(p.network(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(p.prefix_len(), 28);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(AddressPool::parse("not-a-subnet").is_err());
        assert!(AddressPool::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn host_count_excludes_network_and_broadcast() {
        assert_eq!(pool("10.0.0.0/28").host_count(), 14);
        assert_eq!(pool("10.0.0.0/24").host_count(), 254);
        assert_eq!(pool("fd00::/120").host_count(), 254);
    }

    #[test]
    fn mod_pow_small_values() {
        assert_eq!(mod_pow(3, 4, 5), 1);
        assert_eq!(mod_pow(2, 10, 1000), 24);
        assert_eq!(mod_pow(7, 0, 13), 1);
    }

    #[test]
    fn mul_mod_handles_large_operands() {
        let m = 4_294_967_311;
        let product = mul_mod(m - 1, m - 1, m);
        assert!(product < m);
        assert_eq!(mul_mod(7, 8, 5), 1);
    }

    #[test]
    fn full_cycle_on_slash_28() {
        let p = pool("10.0.0.0/28");
        let addrs: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        assert_eq!(addrs.len(), 14);
        let unique: HashSet<&IpAddr> = addrs.iter().collect();
        assert_eq!(unique.len(), 14);
        let expected: Vec<IpAddr> = (1..=14)
            .map(|i| format!("10.0.0.{i}").parse().unwrap())
            .collect();
        for addr in &addrs {
            assert!(expected.contains(addr), "unexpected address {addr}");
        }
    }

    #[test]
    fn full_cycle_on_slash_24_is_a_permutation() {
        let p = pool("192.168.1.0/24");
        let addrs: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        let unique: HashSet<IpAddr> = addrs.iter().copied().collect();
        assert_eq!(addrs.len(), 254);
        assert_eq!(unique.len(), 254);
        let expected: HashSet<IpAddr> = (1..=254)
            .map(|i| format!("192.168.1.{i}").parse().unwrap())
            .collect();
        assert_eq!(unique, expected);
    }

    #[test]
    fn full_cycle_on_bounded_ipv6() {
        let p = pool("fd00::/120");
        let addrs: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        let unique: HashSet<IpAddr> = addrs.iter().copied().collect();
        assert_eq!(addrs.len(), 254);
        assert_eq!(unique.len(), 254);
        for addr in &unique {
            assert!(p.contains(addr));
        }
        assert!(!unique.contains(&"fd00::".parse::<IpAddr>().unwrap()));
        assert!(!unique.contains(&"fd00::ff".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn successive_scans_reorder() {
        let p = pool("10.10.0.0/16");
        let a: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        let b: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        let c: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        assert!(
            a != b || b != c,
            "three scans produced identical orderings"
        );
    }

    #[test]
    fn blacklist_is_never_yielded() {
        let p = pool("10.0.0.0/28");
        let blocked: HashSet<IpAddr> = ["10.0.0.5", "10.0.0.9"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let addrs: Vec<IpAddr> = IpGenerator::new(&p, blocked.clone()).collect();
        assert_eq!(addrs.len(), 12);
        for addr in &addrs {
            assert!(!blocked.contains(addr));
        }
    }

    #[test]
    fn tiny_subnets_scan_linearly() {
        let p = pool("10.0.0.0/31");
        let addrs: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        assert_eq!(
            addrs,
            vec![
                "10.0.0.0".parse::<IpAddr>().unwrap(),
                "10.0.0.1".parse::<IpAddr>().unwrap(),
            ]
        );

        let p = pool("192.0.2.7/32");
        let addrs: Vec<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        assert_eq!(addrs, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn slash_30_cycles_over_two_hosts() {
        let p = pool("10.0.0.0/30");
        let addrs: HashSet<IpAddr> = IpGenerator::new(&p, HashSet::new()).collect();
        let expected: HashSet<IpAddr> = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(addrs, expected);
    }

    #[test]
    fn wide_ipv6_pool_samples_forever() {
        let p = pool("fd00:1234::/32");
        let mut generator = IpGenerator::new(&p, HashSet::new());
        for _ in 0..100 {
            let addr = generator.next().unwrap();
            assert!(p.contains(&addr), "sampled outside pool: {addr}");
        }
    }
}
