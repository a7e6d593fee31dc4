// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Runtime settings.
//!
//! Everything that would otherwise be an ambient debug flag lives here as
//! an immutable value threaded through device construction. Encoding code
//! never consults global state.

/// How many event packets a multi-dispatch operation signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPolicy {
    /// All sub-operations of one logical append share the first packet.
    FirstPacketOnly,
    /// Each sub-operation signals its own packet, up to the event's count.
    SignalAll,
}

/// Global runtime settings, fixed at device creation.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Override the capability table's packet signal policy.
    pub packet_policy: Option<PacketPolicy>,
    /// Force the copy-engine priming workaround even where the capability
    /// table says it is not needed.
    pub force_dma_priming: bool,
    /// Omit ordering barriers between independent lists on one queue.
    pub relaxed_ordering: bool,
    /// Log every encoded instruction at trace level.
    pub log_encoded_streams: bool,
    /// Semaphore polls the soft backend performs before declaring a hang.
    pub hang_spin_budget: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            packet_policy: None,
            force_dma_priming: false,
            relaxed_ordering: false,
            log_encoded_streams: false,
            hang_spin_budget: 1 << 20,
        }
    }
}
