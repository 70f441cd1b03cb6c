pub mod controller;
pub mod events;

pub use controller::{Controller, HOSTNAME_BUDGET, Phase, RunOutcome};
pub use events::{EVENT_QUEUE_CAPACITY, Event, EventQueue, EventReceiver};
