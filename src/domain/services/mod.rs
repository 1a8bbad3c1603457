pub mod ledger;
pub mod reconcile;

pub use ledger::{OperationLedger, Registration, DEFAULT_SUPPRESSION_WINDOW};
pub use reconcile::{plan, ReconcilePlan};
