pub use timer::{schedule_periodic, CancelHandle};

mod timer;
