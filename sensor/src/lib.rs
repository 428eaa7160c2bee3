pub mod host;
pub mod model;
pub mod node;
pub mod pusher;
pub mod server;

pub use model::ThermalModel;
pub use node::{SimConfig, SimNode, LEVEL_ENERGIZED, LEVEL_RELEASED};
pub use pusher::{spawn_pusher, PushTarget};
pub use server::router;
