//! Topology elements: per-node neighbor bitmaps forwarded to the master.

use crate::error::PacketError;
use crate::util::{Packet, RuntimeBitset};

/// The neighbor map of one node, as carried in uplink messages: the node id
/// followed by the strong-neighbor bitmap and, when weak topologies are in
/// use, the weak-neighbor bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyElement {
    id: u8,
    neighbors: RuntimeBitset,
    /// Nodes whose uplink this node hears at any RSSI.
    weak_neighbors: Option<RuntimeBitset>,
}

impl TopologyElement {
    pub fn new(id: u8, max_nodes: u16, use_weak: bool) -> Self {
        Self {
            id,
            neighbors: RuntimeBitset::new(max_nodes as usize),
            weak_neighbors: use_weak.then(|| RuntimeBitset::new(max_nodes as usize)),
        }
    }

    pub fn from_bitsets(
        id: u8,
        neighbors: RuntimeBitset,
        weak_neighbors: Option<RuntimeBitset>,
    ) -> Self {
        Self {
            id,
            neighbors,
            weak_neighbors,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn neighbors(&self) -> &RuntimeBitset {
        &self.neighbors
    }

    pub fn weak_neighbors(&self) -> Option<&RuntimeBitset> {
        self.weak_neighbors.as_ref()
    }

    pub fn add_node(&mut self, node: u8) {
        self.neighbors.set(node as usize, true);
    }

    pub fn remove_node(&mut self, node: u8) {
        self.neighbors.set(node as usize, false);
    }

    pub fn weak_add_node(&mut self, node: u8) {
        if let Some(weak) = &mut self.weak_neighbors {
            weak.set(node as usize, true);
        }
    }

    pub fn weak_remove_node(&mut self, node: u8) {
        if let Some(weak) = &mut self.weak_neighbors {
            weak.set(node as usize, false);
        }
    }

    pub fn clear(&mut self) {
        self.neighbors.set_all(false);
        if let Some(weak) = &mut self.weak_neighbors {
            weak.set_all(false);
        }
    }

    /// Serialized size: id byte plus one or two bitmaps.
    pub fn max_size(bitmask_size: usize, use_weak: bool) -> usize {
        if use_weak {
            1 + 2 * bitmask_size
        } else {
            1 + bitmask_size
        }
    }

    pub fn size(&self) -> usize {
        Self::max_size(self.neighbors.byte_size(), self.weak_neighbors.is_some())
    }

    pub fn serialize(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put_u8(self.id)?;
        pkt.put(self.neighbors.as_bytes())?;
        if let Some(weak) = &self.weak_neighbors {
            pkt.put(weak.as_bytes())?;
        }
        Ok(())
    }

    pub fn deserialize(
        pkt: &mut Packet,
        bitmask_size: usize,
        use_weak: bool,
    ) -> Result<Self, PacketError> {
        let id = pkt.get_u8()?;
        let mut bytes = vec![0u8; bitmask_size];
        pkt.get(&mut bytes)?;
        let neighbors = RuntimeBitset::from_bytes(&bytes);
        let weak_neighbors = if use_weak {
            pkt.get(&mut bytes)?;
            Some(RuntimeBitset::from_bytes(&bytes))
        } else {
            None
        };
        Ok(Self {
            id,
            neighbors,
            weak_neighbors,
        })
    }

    /// Validate the element at `offset` in a received packet without
    /// consuming it: the id must be in range and the self-bit clear.
    pub fn validate_at(pkt: &Packet, offset: usize, max_nodes: u16, use_weak: bool) -> bool {
        let size = Self::max_size(max_nodes as usize / 8, use_weak);
        if pkt.size() < offset + size {
            return false;
        }
        u16::from(pkt[offset]) < max_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_strong_only() {
        let mut t = TopologyElement::new(3, 16, false);
        t.add_node(1);
        t.add_node(9);
        let mut pkt = Packet::new();
        t.serialize(&mut pkt).unwrap();
        assert_eq!(pkt.size(), TopologyElement::max_size(2, false));
        let parsed = TopologyElement::deserialize(&mut pkt, 2, false).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn wire_roundtrip_with_weak() {
        let mut t = TopologyElement::new(3, 16, true);
        t.add_node(1);
        t.weak_add_node(7);
        let mut pkt = Packet::new();
        t.serialize(&mut pkt).unwrap();
        assert_eq!(pkt.size(), TopologyElement::max_size(2, true));
        let parsed = TopologyElement::deserialize(&mut pkt, 2, true).unwrap();
        assert_eq!(parsed, t);
        assert!(parsed.weak_neighbors().unwrap().get(7));
    }

    #[test]
    fn validate_rejects_out_of_range_id() {
        let mut t = TopologyElement::new(20, 32, false);
        t.add_node(1);
        let mut pkt = Packet::new();
        t.serialize(&mut pkt).unwrap();
        assert!(TopologyElement::validate_at(&pkt, 0, 32, false));
        assert!(!TopologyElement::validate_at(&pkt, 0, 16, false));
    }

    #[test]
    fn validate_rejects_truncated_element() {
        let mut pkt = Packet::new();
        pkt.put(&[1, 2]).unwrap();
        assert!(!TopologyElement::validate_at(&pkt, 0, 16, false));
    }
}
