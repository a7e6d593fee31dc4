// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod caps;
pub mod decoder;
pub mod encoder;
pub mod isa;

pub use caps::{ArbitrationPolicy, Capabilities, Generation};
pub use decoder::{DecodeError, StreamReader};
pub use encoder::Instruction;
pub use isa::{CompareOp, DataWidth, FlushScope, MathOp, MathOperand};
