// Library interface for the pinclaim engine.
// The operator binary, tests and embedding services all go through here.

pub mod amount;
pub mod chain;
pub mod claim;
pub mod claims;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod local;
pub mod metrics;
pub mod moderation;
pub mod oracle;
pub mod pinning;
pub mod scheduler;
pub mod storage;
pub mod tracker;

pub use amount::TokenAmount;
pub use chain::{TxData, TxIo, TxLookup};
pub use claim::{ClaimRecord, ClaimResponse, ClaimSubmission, ClaimView, RejectReason, SubmitOutcome};
pub use claims::PinService;
pub use content::{ContentError, ContentStore};
pub use error::{PinError, PinResult};
pub use executor::Executor;
pub use oracle::{PriceCache, PriceOracle};
pub use pinning::{PinEngine, PinOutcome};
pub use scheduler::Reconciler;
pub use storage::Store;
pub use tracker::PinTracker;
