pub const ROUTE_SYSTEMS: &str = "/api/v3/systems";
pub const ROUTE_SYSTEM: &str = "/api/v3/systems/{id}";
pub const ROUTE_SYSTEM_PROGRAM: &str = "/api/v3/systems/{id}/program";
pub const ROUTE_SYSTEM_ADVANCE: &str = "/api/v3/systems/{id}/advance";
pub const ROUTE_SYSTEM_BOOST: &str = "/api/v3/systems/{id}/boost";
pub const ROUTE_SYSTEM_PERIODS: &str = "/api/v3/systems/{id}/periods";
pub const ROUTE_SYSTEM_PERIOD: &str = "/api/v3/systems/{id}/periods/{period_id}";
pub const ROUTE_SYSTEM_TEMPERATURE: &str = "/api/v3/systems/{id}/temperature";
pub const ROUTE_SUPERVISOR: &str = "/api/v3/supervisor";
pub const ROUTE_SUPERVISOR_START: &str = "/api/v3/supervisor/start";
pub const ROUTE_SUPERVISOR_STOP: &str = "/api/v3/supervisor/stop";

pub fn system_temperature_path(id: &str) -> String {
    ROUTE_SYSTEM_TEMPERATURE.replace("{id}", id)
}
