use crate::{BlockHeader, Transaction};

/// Boolean checks owned by the consensus layer.
///
/// Proof-of-work and script interpretation are not implemented here; the
/// node only asks yes/no questions through this trait.
pub trait Validator: Send + Sync {
    fn check_proof_of_work(&self, header: &BlockHeader) -> bool;
    fn check_scripts(&self, tx: &Transaction) -> bool;
}

/// Accepts everything. Used when verification is switched off and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn check_proof_of_work(&self, _header: &BlockHeader) -> bool {
        true
    }

    fn check_scripts(&self, _tx: &Transaction) -> bool {
        true
    }
}
