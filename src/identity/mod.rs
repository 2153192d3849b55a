//! Canonical identity for teams and events.
//!
//! Providers name the same team and game differently. Everything that enters
//! the store goes through these resolvers first, and anything they cannot
//! place with confidence comes back as `None` to be quarantined by the caller.

pub mod events;
pub mod matching;
pub mod teams;

pub use events::{
    season_for, EventObservation, EventResolver, FeedMatch, Resolution, ScoreUpdate, UnresolvedReason,
};
pub use matching::{match_names, normalize_name, MatchConfidence};
pub use teams::{IdentityResolver, MappingKey};
