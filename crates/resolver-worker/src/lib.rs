mod driver;
mod fanout;
mod handler;

pub use driver::{DriverConfig, IterationDriver};
pub use fanout::{run_iteration, BatchOutcome};
pub use handler::{handle_message, HandlerContext};
