// SPDX-License-Identifier: MIT

pub mod config;
pub mod pipeline;
pub mod workflow;
