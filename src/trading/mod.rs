//! External trading collaborators and on-chain allowance tracking.

pub mod approvals;
pub mod interfaces;
