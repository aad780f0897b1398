pub mod component;
pub mod config;
pub mod connectors;
pub mod control;
pub mod engine;
pub mod error;
pub mod frame;
pub mod io;
pub mod message;
pub mod pool;
pub mod router;
pub mod runtime;
pub mod station;
pub mod step;
mod test;
pub mod utils;

pub use component::{ComponentRegistry, Descriptor, Messagable};
pub use config::{EngineConfig, EngineSettings};
pub use engine::{CallReport, Engine, PhaseReport};
pub use message::{Message, MessageKind};
pub use router::MessageRouter;
pub use runtime::Runtime;
pub use step::{Step, StepKind};
