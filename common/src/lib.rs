pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod record;
pub mod routes;
pub mod schedule;
pub mod thermostat;
pub mod types;
pub mod zone;

pub use cache::{Lookup, TtlCache};
pub use config::{BreakerConfig, CacheConfig, RuntimeConfig, SupervisorConfig, ThermostatConfig};
pub use error::{CommunicationError, ValidationError};
pub use node::{RelayNode, SensorNode, TemperatureReading};
pub use record::{PersistenceDocument, RelayRecord, ZoneRecord};
pub use routes::*;
pub use schedule::{DayOfWeek, Days, Period, Schedule};
pub use thermostat::{decide, Decision, DecisionError, Readings, Rule, RULES};
pub use types::{ZoneId, ZoneStatus};
pub use zone::{Admission, BreakerState, ExpiredOverrides, FailureOutcome, Zone};
