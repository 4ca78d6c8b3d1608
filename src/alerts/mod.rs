//! Alert ingestion and presentation.
//!
//! `queue` owns deduplication and the bounded pending queue; `presenter`
//! owns the display state machine and the acknowledgment guarantees.

pub mod presenter;
pub mod queue;

pub use self::presenter::{
    AlertPresenter, DismissTrigger, DisplaySnapshot, PresenterConfig, PresenterPhase,
};
pub use self::queue::{AlertQueue, EnqueueOutcome, QueuedAlert};
