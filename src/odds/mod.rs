pub mod selection;
pub mod store;

pub use selection::{book_priority, select_best, select_closing};
pub use store::{time_bucket, ObservationError, OddsStore, SnapshotObservation, StoreReport};
