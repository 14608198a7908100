// Who holds which session: per-session locks and the claim ledger.

pub mod ledger;
pub mod locks;
