// Cycle data model and certificate protocol
//
// - `types`: records, markers and per-cycle transactions
// - `cert`: certificate scoring, ranking, merging and validation
// - `timing`: quarter boundaries

pub mod cert;
pub mod timing;
pub mod types;

pub use cert::{score, validate_certs, BestCertState, CertBundle, CertError, Comparison, CycleCert, Sign};
pub use timing::{calc_cycle_times, CycleTimes, Quarter};
pub use types::{make_cycle_marker, CycleRecord, CycleTxs, JoinedNode};
