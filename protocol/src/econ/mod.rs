//! # Economics
//!
//! NAV/corridor math, the epoch issuance curve, PoP/stake reward settlement,
//! and slashing — all pure functions over snapshots the engine and epoch
//! scheduler hand in. Nothing here touches the database or the account
//! store directly, which keeps the reward math trivially testable.

pub mod issuance;
pub mod nav;
pub mod settlement;
pub mod slashing;
