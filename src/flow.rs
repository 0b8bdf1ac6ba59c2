// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/// Successful outcome of a data-flow operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSuccess {
    Ok,
}

/// Why a push was refused or the pacing task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The element is flushing or shutting down.
    #[error("flushing")]
    Flushing,
    /// EOS was already queued or delivered.
    #[error("eos")]
    Eos,
    /// No clock rate could be resolved for the stream.
    #[error("not negotiated")]
    NotNegotiated,
    /// No downstream peer is linked.
    #[error("not linked")]
    NotLinked,
    /// Fatal error, e.g. undecodable RTP input.
    #[error("error")]
    Error,
}

pub type FlowReturn = Result<FlowSuccess, FlowError>;
