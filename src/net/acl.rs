//! Per-interface IPv6 packet classification.
//!
//! Rules are registered in bulk per category before the classifier is
//! built; one compiled context exists per NUMA node so lookups stay local,
//! and all replicas derive from the same rule list so categorization is
//! bitwise identical everywhere.
//!
//! The field layout mirrors the classifier's four-byte input grouping:
//! the protocol byte, the destination address as four 32-bit chunks, the
//! source and destination ports sharing one four-byte input, and the
//! ICMPv6 type as a four-byte input at `sizeof(ipv6_hdr)` into L3.
//!
//! Category 0 is reserved: a packet matching no rule and no
//! extension-header fallback is dropped and dumped at WARNING level.
//! An attacker able to generate such packets has found an unfiltered
//! path, which the operator must know about.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::warn;

use crate::dataplane::buffer::{hex_dump, PktBuf};
use crate::error::{Error, Result};
use crate::net::Iface;

/// Maximum number of ACL classification categories per interface,
/// including the reserved no-match category 0.
pub const ACL_MAX_CATEGORIES: usize = 8;

/// Maximum number of rules installed per ACL.
pub const MAX_NUM_IPV6_ACL_RULES: usize = 32;

/// Offset of the next-header byte within the IPv6 header.
const PROTO_OFFSET: usize = 6;
/// Offset of the destination address within the IPv6 header.
const DST_OFFSET: usize = 24;
/// Offset of the transport header (ports, ICMPv6 type) behind the fixed
/// IPv6 header.
const L4_OFFSET: usize = 40;

/// A bitmask-matched field: the packet value ANDed with `mask` must equal
/// `value` ANDed with `mask`. A zero mask matches anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclField<T> {
    pub value: T,
    pub mask: T,
}

/// One destination-address chunk, matched by prefix length (0..=32).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclAddrChunk {
    pub value: u32,
    pub mask_len: u8,
}

/// One IPv6 classification rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6AclRule {
    pub proto: AclField<u8>,
    /// Destination address as four big-endian 32-bit chunks.
    pub dst: [AclAddrChunk; 4],
    pub src_port: AclField<u16>,
    pub dst_port: AclField<u16>,
    /// Four-byte window starting at the ICMPv6 type.
    pub icmp_type: AclField<u32>,
    /// Higher priority wins when several rules match.
    pub priority: i32,
}

impl Ipv6AclRule {
    /// Whether the L3 slice (starting at the IPv6 header) matches.
    fn matches(&self, l3: &[u8]) -> bool {
        if self.proto.mask != 0 {
            match l3.get(PROTO_OFFSET) {
                Some(&p) if p & self.proto.mask == self.proto.value & self.proto.mask => {}
                _ => return false,
            }
        }

        for (i, chunk) in self.dst.iter().enumerate() {
            if chunk.mask_len == 0 {
                continue;
            }
            let off = DST_OFFSET + i * 4;
            let Some(bytes) = l3.get(off..off + 4) else {
                return false;
            };
            let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let shift = 32 - chunk.mask_len as u32;
            if word >> shift != chunk.value >> shift {
                return false;
            }
        }

        if self.src_port.mask != 0 {
            let Some(bytes) = l3.get(L4_OFFSET..L4_OFFSET + 2) else {
                return false;
            };
            let port = u16::from_be_bytes([bytes[0], bytes[1]]);
            if port & self.src_port.mask != self.src_port.value & self.src_port.mask {
                return false;
            }
        }
        if self.dst_port.mask != 0 {
            let Some(bytes) = l3.get(L4_OFFSET + 2..L4_OFFSET + 4) else {
                return false;
            };
            let port = u16::from_be_bytes([bytes[0], bytes[1]]);
            if port & self.dst_port.mask != self.dst_port.value & self.dst_port.mask {
                return false;
            }
        }

        if self.icmp_type.mask != 0 {
            let Some(bytes) = l3.get(L4_OFFSET..L4_OFFSET + 4) else {
                return false;
            };
            let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if word & self.icmp_type.mask != self.icmp_type.value & self.icmp_type.mask {
                return false;
            }
        }

        true
    }
}

/// Callback invoked with the sub-burst of packets a category claimed.
///
/// On error the callback is responsible for having freed every packet it
/// did not hand off.
pub type AclMatchFn = Arc<dyn Fn(Vec<PktBuf>, &Iface) -> Result<()> + Send + Sync>;

/// Fallback matcher for packets the classifier could not place, typically
/// because of IPv6 extension headers. Returns true to claim the packet.
pub type AclExtFn = Arc<dyn Fn(&PktBuf, &Iface) -> bool + Send + Sync>;

struct AclCategory {
    match_fn: AclMatchFn,
    ext_fn: Option<AclExtFn>,
}

/// A compiled classifier: the same rule list on every NUMA node.
#[derive(Default)]
struct AclCtx {
    rules: Vec<(u32, Ipv6AclRule)>,
}

impl AclCtx {
    fn classify(&self, l3: &[u8]) -> u32 {
        let mut best: Option<(i32, u32)> = None;
        for (cat, rule) in &self.rules {
            if rule.matches(l3) {
                match best {
                    Some((prio, _)) if prio >= rule.priority => {}
                    _ => best = Some((rule.priority, *cat)),
                }
            }
        }
        best.map(|(_, cat)| cat).unwrap_or(0)
    }
}

struct AclBuild {
    rules: Vec<(u32, Ipv6AclRule)>,
    num_categories: u32,
    built: bool,
}

/// The IPv6 ACL of one interface.
pub struct Ipv6Acl {
    iface_name: String,
    build: Mutex<AclBuild>,
    /// One compiled context per NUMA node, published at finalize.
    ctxs: Vec<ArcSwap<AclCtx>>,
    /// Category callbacks; index is the category id.
    funcs: ArcSwap<Vec<AclCategory>>,
}

impl Ipv6Acl {
    pub fn new(iface_name: impl Into<String>, numa_nodes: usize) -> Self {
        // Category 0 is the implicit drop-and-warn handler.
        let name = iface_name.into();
        let drop_name = name.clone();
        let drop_fn: AclMatchFn = Arc::new(move |pkts: Vec<PktBuf>, _iface: &Iface| {
            for pkt in pkts {
                warn!(
                    iface = %drop_name,
                    "an IPv6 packet failed to match any IPv6 ACL rules, the whole packet is dumped below:\n{}",
                    hex_dump(pkt.data())
                );
            }
            Ok(())
        });

        Self {
            iface_name: name,
            build: Mutex::new(AclBuild {
                rules: Vec::new(),
                num_categories: 1,
                built: false,
            }),
            ctxs: (0..numa_nodes.max(1))
                .map(|_| ArcSwap::from_pointee(AclCtx::default()))
                .collect(),
            funcs: ArcSwap::from_pointee(vec![AclCategory {
                match_fn: drop_fn,
                ext_fn: None,
            }]),
        }
    }

    /// Register a rule set under a fresh category.
    ///
    /// Returns the assigned category id. Must happen before `build`.
    pub fn register(
        &self,
        mut rules: Vec<Ipv6AclRule>,
        match_fn: AclMatchFn,
        ext_fn: AclExtFn,
    ) -> Result<u32> {
        let mut build = self.build.lock().unwrap();
        if build.built {
            return Err(Error::Config(format!(
                "ACL on {} is already built",
                self.iface_name
            )));
        }
        if build.num_categories as usize == ACL_MAX_CATEGORIES {
            return Err(Error::Config(format!(
                "cannot install more ACL types on the {} iface",
                self.iface_name
            )));
        }
        if build.rules.len() + rules.len() > MAX_NUM_IPV6_ACL_RULES {
            return Err(Error::Config(format!(
                "more than {MAX_NUM_IPV6_ACL_RULES} ACL rules on the {} iface",
                self.iface_name
            )));
        }

        let cat = build.num_categories;
        build.num_categories += 1;
        for rule in rules.drain(..) {
            build.rules.push((cat, rule));
        }

        let mut funcs: Vec<AclCategory> = Vec::with_capacity(cat as usize + 1);
        let current = self.funcs.load();
        for existing in current.iter() {
            funcs.push(AclCategory {
                match_fn: Arc::clone(&existing.match_fn),
                ext_fn: existing.ext_fn.as_ref().map(Arc::clone),
            });
        }
        funcs.push(AclCategory {
            match_fn,
            ext_fn: Some(ext_fn),
        });
        self.funcs.store(Arc::new(funcs));

        Ok(cat)
    }

    /// Compile the registered rules into every NUMA node's context.
    pub fn build(&self) -> Result<()> {
        let mut build = self.build.lock().unwrap();
        build.built = true;
        for ctx in &self.ctxs {
            ctx.store(Arc::new(AclCtx {
                rules: build.rules.clone(),
            }));
        }
        Ok(())
    }

    /// Classify a single L3 slice on the given NUMA node's context.
    pub fn classify(&self, numa_node: usize, l3: &[u8]) -> u32 {
        let ctx = self.ctxs[numa_node.min(self.ctxs.len() - 1)].load();
        ctx.classify(l3)
    }

    /// Classify and dispatch a burst of Ethernet frames carrying IPv6.
    ///
    /// Packets route to their category's match callback as a sub-burst;
    /// no-match packets get one try at each category's extension-header
    /// fallback, in registration order, before falling to category 0.
    pub fn process_burst(&self, numa_node: usize, pkts: Vec<PktBuf>, iface: &Iface) -> Result<()> {
        let funcs = self.funcs.load();
        let num_cats = funcs.len();
        let mut by_cat: Vec<Vec<PktBuf>> = (0..num_cats).map(|_| Vec::new()).collect();

        for pkt in pkts {
            let data = pkt.data();
            let mut cat = if data.len() > 14 {
                self.classify(numa_node, &data[14..])
            } else {
                0
            };

            if cat == 0 {
                // Category 0 has no fallback; try the others in order.
                for (i, funcs_cat) in funcs.iter().enumerate().skip(1) {
                    if let Some(ext) = &funcs_cat.ext_fn {
                        if ext(&pkt, iface) {
                            cat = i as u32;
                            break;
                        }
                    }
                }
            }

            by_cat[cat as usize].push(pkt);
        }

        for (cat, sub) in by_cat.into_iter().enumerate() {
            if sub.is_empty() {
                continue;
            }
            if let Err(e) = (funcs[cat].match_fn)(sub, iface) {
                warn!(
                    iface = %self.iface_name,
                    category = cat,
                    error = %e,
                    "ACL function failed"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp6_l3(dst: [u8; 16], sport: u16, dport: u16) -> Vec<u8> {
        let mut l3 = vec![0u8; 60];
        l3[0] = 0x60;
        l3[PROTO_OFFSET] = 6;
        l3[DST_OFFSET..DST_OFFSET + 16].copy_from_slice(&dst);
        l3[L4_OFFSET..L4_OFFSET + 2].copy_from_slice(&sport.to_be_bytes());
        l3[L4_OFFSET + 2..L4_OFFSET + 4].copy_from_slice(&dport.to_be_bytes());
        l3
    }

    fn bgp_rule(dst: [u8; 16], source_port: bool) -> Ipv6AclRule {
        let mut rule = Ipv6AclRule {
            proto: AclField { value: 6, mask: 0xff },
            priority: 1,
            ..Default::default()
        };
        for (i, chunk) in rule.dst.iter_mut().enumerate() {
            chunk.value =
                u32::from_be_bytes([dst[i * 4], dst[i * 4 + 1], dst[i * 4 + 2], dst[i * 4 + 3]]);
            chunk.mask_len = 32;
        }
        if source_port {
            rule.src_port = AclField {
                value: 179,
                mask: 0xffff,
            };
        } else {
            rule.dst_port = AclField {
                value: 179,
                mask: 0xffff,
            };
        }
        rule
    }

    fn dst_bytes() -> [u8; 16] {
        let addr: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        addr.octets()
    }

    fn built_acl(numa_nodes: usize) -> Ipv6Acl {
        let acl = Ipv6Acl::new("front", numa_nodes);
        acl.register(
            vec![bgp_rule(dst_bytes(), true), bgp_rule(dst_bytes(), false)],
            Arc::new(|_, _| Ok(())),
            Arc::new(|_, _| false),
        )
        .unwrap();
        acl.build().unwrap();
        acl
    }

    #[test]
    fn test_bgp_rules_classify() {
        let acl = built_acl(1);
        let hit = tcp6_l3(dst_bytes(), 54321, 179);
        let miss_port = tcp6_l3(dst_bytes(), 54321, 80);
        let mut wrong_dst = dst_bytes();
        wrong_dst[15] = 0x99;
        let miss_dst = tcp6_l3(wrong_dst, 179, 80);

        assert_eq!(acl.classify(0, &hit), 1);
        assert_eq!(acl.classify(0, &miss_port), 0);
        assert_eq!(acl.classify(0, &miss_dst), 0);
    }

    #[test]
    fn test_replicas_agree() {
        let acl = built_acl(4);
        let hit = tcp6_l3(dst_bytes(), 179, 33000);
        let miss = tcp6_l3(dst_bytes(), 33000, 33000);
        for numa in 0..4 {
            assert_eq!(acl.classify(numa, &hit), 1);
            assert_eq!(acl.classify(numa, &miss), 0);
        }
    }

    #[test]
    fn test_higher_priority_wins() {
        let acl = Ipv6Acl::new("front", 1);
        let mut low = bgp_rule(dst_bytes(), false);
        low.priority = 1;
        let mut high = low;
        high.priority = 5;
        acl.register(vec![low], Arc::new(|_, _| Ok(())), Arc::new(|_, _| false))
            .unwrap();
        acl.register(vec![high], Arc::new(|_, _| Ok(())), Arc::new(|_, _| false))
            .unwrap();
        acl.build().unwrap();
        assert_eq!(acl.classify(0, &tcp6_l3(dst_bytes(), 1, 179)), 2);
    }

    #[test]
    fn test_category_limit() {
        let acl = Ipv6Acl::new("front", 1);
        for _ in 0..(ACL_MAX_CATEGORIES - 1) {
            acl.register(vec![], Arc::new(|_, _| Ok(())), Arc::new(|_, _| false))
                .unwrap();
        }
        assert!(acl
            .register(vec![], Arc::new(|_, _| Ok(())), Arc::new(|_, _| false))
            .is_err());
    }

    #[test]
    fn test_short_packet_is_no_match() {
        let acl = built_acl(1);
        assert_eq!(acl.classify(0, &[0x60, 0, 0, 0]), 0);
    }
}
