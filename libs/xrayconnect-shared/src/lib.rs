pub mod notification;
pub mod settings;
pub mod task;
pub mod telemetry;

pub use notification::NotificationMessage;
pub use task::{Lane, Task, TaskType};
