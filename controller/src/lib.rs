pub mod api;
pub mod app;
pub mod clock;
pub mod cycle;
pub mod remote;
pub mod settings;
pub mod store;
pub mod supervisor;

pub use cycle::{ControlCycle, Cycle, CycleError, CycleReport};
pub use remote::{HttpNodeClient, NodeClient, RemoteRelay, RemoteSensor};
pub use settings::Settings;
pub use store::{StoreError, ZoneStore};
pub use supervisor::{Supervisor, SupervisorError, SupervisorState};
