//! The pipeline's negotiated BGP capability set. Mutable only during stage
//! Prepare, read-only at runtime — enforced here by taking `&mut self`
//! only from `Pipeline`'s Prepare-phase accessor.

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub four_byte_asn: bool,
    pub route_refresh: bool,
    pub extended_nexthop: bool,
}

impl Capabilities {
    /// Applies the `--short-asn` global switch, which bans the 4-byte-ASN
    /// capability outright.
    pub fn apply_short_asn(&mut self, short_asn: bool) {
        if short_asn {
            self.four_byte_asn = false;
        }
    }
}
