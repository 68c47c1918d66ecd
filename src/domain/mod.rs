//! Domain layer: the conversion ledger state machine and the contracts of its collaborators.

pub mod ledger;
pub mod payment;
pub mod ports;
pub mod quote;
pub mod treasury;
