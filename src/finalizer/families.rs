//! Protocol-family dispatch table
//!
//! Bridge families differ only in which phases a withdrawal passes through;
//! everything else is uniform. A withdrawal carries its chain's family tag
//! and this table selects the state-transition shape, so adding a family is
//! one row here rather than a new type hierarchy.

use crate::config::ProtocolFamily;

/// Phase shape of one protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    /// Whether the family requires an explicit prove submission before the
    /// finalization window opens
    pub has_prove_phase: bool,
    pub name: &'static str,
}

/// Family -> phase table
pub fn phase_spec(family: ProtocolFamily) -> PhaseSpec {
    match family {
        ProtocolFamily::Optimistic => PhaseSpec {
            has_prove_phase: true,
            name: "optimistic",
        },
        ProtocolFamily::Delayed => PhaseSpec {
            has_prove_phase: false,
            name: "delayed",
        },
        ProtocolFamily::Proof => PhaseSpec {
            has_prove_phase: false,
            name: "proof",
        },
        ProtocolFamily::Checkpoint => PhaseSpec {
            has_prove_phase: false,
            name: "checkpoint",
        },
    }
}
