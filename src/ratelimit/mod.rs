//! Rate limiting logic and state management.

pub mod clock;
mod engine;
mod identifier;
mod policy;
mod reaper;
mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AdmissionEngine, Decision, RequestContext, Usage};
pub use identifier::{Actor, IdentifierResolver, DEFAULT_TRUSTED_HEADERS, UNKNOWN_ADDRESS};
pub use policy::{
    default_tiers, load_policies, normalize_action, policies_from_yaml, Policy, PolicyRegistry,
    DEFAULT_ACTION, DEFAULT_POLICY,
};
pub use reaper::{Reaper, DEFAULT_CLEANUP_PROBABILITY};
pub use tier::{AuthenticatedUser, TierSelector};
