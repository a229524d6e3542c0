use netinsight_common::{protocol_slot, CoarseFlowKey, FineFlowKey};

use crate::walker::ParsedHeaders;

/// Keys derived from one validated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowKeys {
    pub coarse: CoarseFlowKey,
    /// Always populated; ports are zero when the frame carried neither TCP
    /// nor UDP.
    pub fine: FineFlowKey,
    /// Protocol-count slot. `None` excludes the frame from connection
    /// tracking, protocol counting and gap measurement.
    pub slot: Option<u32>,
}

pub fn extract(headers: &ParsedHeaders) -> FlowKeys {
    let (src_port, dst_port) = headers.ports.unwrap_or((0, 0));
    FlowKeys {
        coarse: CoarseFlowKey::new(headers.src_addr, headers.dst_addr),
        fine: FineFlowKey::new(
            headers.src_addr,
            headers.dst_addr,
            src_port,
            dst_port,
            headers.protocol,
        ),
        slot: protocol_slot(headers.protocol),
    }
}
