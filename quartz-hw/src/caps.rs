// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-generation capability tables.
//!
//! The encoder never asks "which generation am I" — it asks the table for
//! a feature flag or a constant. Each generation supplies one immutable
//! table at device construction.

use quartz_common::settings::PacketPolicy;

/// Hardware generations the runtime knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Generation {
    Gen1 = 0x100,
    Gen2 = 0x200,
}

/// Thread-arbitration policy programmed before a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArbitrationPolicy {
    AgeBased = 0,
    RoundRobin = 1,
    RoundRobinAfterDependency = 2,
}

/// Feature flags and constants for one hardware generation.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub generation: Generation,
    /// SEM_WAIT can compare a full 64-bit operand in one instruction.
    pub native_64bit_compare: bool,
    /// Timestamp registers can be stored as one 64-bit read. Without
    /// this, the encoder stores hi/lo halves plus a masked low re-read to
    /// guard against tearing.
    pub wide_timestamp_read: bool,
    /// A dispatch that wrote images leaves a texture-cache hazard that
    /// must be flushed before the next dispatch.
    pub requires_post_image_write_flush: bool,
    /// The copy engine needs a one-time dummy blit before its first real
    /// transfer on a fresh command buffer.
    pub requires_dma_priming: bool,
    /// Whether cooperative launches can be predicated on wait events.
    pub cooperative_wait_predication: bool,
    /// Minimum address alignment for the blit fast path.
    pub blit_alignment: u64,
    /// Cacheline size used for copy decomposition.
    pub cacheline_size: u64,
    /// Largest byte span one copy-kernel dispatch may address.
    pub max_copy_dispatch_span: u64,
    /// Arbitration policy the queue baseline assumes.
    pub default_arbitration: ArbitrationPolicy,
    /// Default event-packet signal policy.
    pub default_packet_policy: PacketPolicy,
}

impl Capabilities {
    /// Capability table for a generation.
    pub fn for_generation(generation: Generation) -> Self {
        match generation {
            Generation::Gen1 => Self {
                generation,
                native_64bit_compare: false,
                wide_timestamp_read: false,
                requires_post_image_write_flush: true,
                requires_dma_priming: true,
                cooperative_wait_predication: false,
                blit_alignment: 4,
                cacheline_size: 64,
                max_copy_dispatch_span: 1 << 24,
                default_arbitration: ArbitrationPolicy::AgeBased,
                default_packet_policy: PacketPolicy::FirstPacketOnly,
            },
            Generation::Gen2 => Self {
                generation,
                native_64bit_compare: true,
                wide_timestamp_read: true,
                requires_post_image_write_flush: false,
                requires_dma_priming: false,
                cooperative_wait_predication: true,
                blit_alignment: 4,
                cacheline_size: 64,
                max_copy_dispatch_span: 1 << 26,
                default_arbitration: ArbitrationPolicy::RoundRobin,
                default_packet_policy: PacketPolicy::FirstPacketOnly,
            },
        }
    }
}
